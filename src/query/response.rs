use std::collections::HashMap;

use serde::Deserialize;

use crate::query_context::QueryContextPayload;
use crate::row::{SnowflakeColumn, SnowflakeColumnType};
use crate::types::NameValueParameter;

/// `data` of a query-request or result response.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct ExecResponseData {
    pub(crate) parameters: Vec<NameValueParameter>,
    #[serde(rename = "rowtype")]
    pub(crate) row_types: Vec<RowType>,
    #[serde(rename = "rowset")]
    pub(crate) row_set: Option<Vec<Vec<Option<String>>>>,
    #[serde(rename = "rowsetBase64")]
    pub(crate) row_set_base64: Option<String>,
    pub(crate) total: Option<i64>,
    pub(crate) returned: Option<i64>,
    pub(crate) query_id: Option<String>,
    pub(crate) sql_state: Option<String>,
    pub(crate) error_code: Option<String>,
    pub(crate) final_database_name: Option<String>,
    pub(crate) final_schema_name: Option<String>,
    pub(crate) final_warehouse_name: Option<String>,
    pub(crate) final_role_name: Option<String>,
    pub(crate) statement_type_id: Option<i64>,
    pub(crate) chunks: Vec<ChunkDescriptor>,
    pub(crate) qrmk: Option<String>,
    pub(crate) chunk_headers: Option<HashMap<String, String>>,
    pub(crate) get_result_url: Option<String>,
    pub(crate) query_result_format: Option<String>,
    pub(crate) result_ids: Option<String>,
    pub(crate) result_types: Option<String>,
    pub(crate) query_context: Option<QueryContextPayload>,
}

impl ExecResponseData {
    pub(crate) fn is_arrow(&self) -> bool {
        self.query_result_format
            .as_deref()
            .is_some_and(|f| f.eq_ignore_ascii_case("arrow"))
    }

    pub(crate) fn is_multi_statement(&self) -> bool {
        self.statement_type_id == Some(MULTI_STATEMENT_TYPE_ID)
    }

    pub(crate) fn is_dml(&self) -> bool {
        self.statement_type_id.is_some_and(is_dml)
    }

    pub(crate) fn columns(&self) -> Vec<SnowflakeColumn> {
        self.row_types
            .iter()
            .enumerate()
            .map(|(index, row_type)| SnowflakeColumn {
                name: row_type.name.clone(),
                index,
                column_type: SnowflakeColumnType::from(row_type),
            })
            .collect()
    }
}

pub(crate) const MULTI_STATEMENT_TYPE_ID: i64 = 0xA000;
const DML_TYPE_IDS: std::ops::RangeInclusive<i64> = 0x3000..=0x3500;

pub(crate) fn is_dml(statement_type_id: i64) -> bool {
    DML_TYPE_IDS.contains(&statement_type_id)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct RowType {
    pub(crate) name: String,
    #[serde(rename = "type")]
    pub(crate) data_type: String,
    pub(crate) nullable: bool,
    pub(crate) length: Option<i64>,
    pub(crate) precision: Option<i64>,
    pub(crate) scale: Option<i64>,
    pub(crate) byte_length: Option<i64>,
    pub(crate) database: Option<String>,
    pub(crate) schema: Option<String>,
    pub(crate) table: Option<String>,
    pub(crate) fields: Vec<RowType>,
}

impl From<&RowType> for SnowflakeColumnType {
    fn from(row_type: &RowType) -> Self {
        let mut column_type = SnowflakeColumnType::new(&row_type.data_type, row_type.nullable);
        column_type.length = row_type.length;
        column_type.precision = row_type.precision;
        column_type.scale = row_type.scale;
        column_type.fields = row_type
            .fields
            .iter()
            .enumerate()
            .map(|(index, field)| SnowflakeColumn {
                name: field.name.clone(),
                index,
                column_type: SnowflakeColumnType::from(field),
            })
            .collect();
        column_type
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct ChunkDescriptor {
    pub(crate) url: String,
    pub(crate) row_count: i64,
    pub(crate) uncompressed_size: i64,
    pub(crate) compressed_size: i64,
}
