use arrow_array::RecordBatch;
use tokio::sync::oneshot;

use crate::error::{SnowflakeError, codes, sql_state};
use crate::query::{Pending, ResultSets};
use crate::row::{LogicalType, ScanType, SnowflakeColumn, SnowflakeRow};
use crate::{Error, Result};

/// A record batch handed out as-is from an Arrow result.
#[derive(Debug, Clone)]
pub struct SnowflakeArrowBatch {
    batch: RecordBatch,
    row_count: usize,
}

impl SnowflakeArrowBatch {
    pub(crate) fn new(batch: RecordBatch) -> Self {
        let row_count = batch.num_rows();
        Self { batch, row_count }
    }

    pub fn record_batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn into_record_batch(self) -> RecordBatch {
        self.batch
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }
}

/// Rows of a query, read one at a time.
///
/// For statements submitted with [`crate::SnowflakeSession::query_async`] every method first
/// waits for the statement to finish. Once an error is returned, the same error is returned by
/// every later read.
pub struct SnowflakeRows {
    query_id: String,
    state: Pending<ResultSets>,
    first_error: Option<SnowflakeError>,
    closed: bool,
}

impl SnowflakeRows {
    pub(crate) fn ready(query_id: String, sets: ResultSets) -> Self {
        Self::with_state(query_id, Pending::Ready(sets))
    }

    pub(crate) fn pending(
        query_id: String,
        rx: oneshot::Receiver<std::result::Result<ResultSets, SnowflakeError>>,
    ) -> Self {
        Self::with_state(query_id, Pending::Waiting(rx))
    }

    fn with_state(query_id: String, state: Pending<ResultSets>) -> Self {
        Self {
            query_id,
            state,
            first_error: None,
            closed: false,
        }
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    fn remember(&mut self, err: Error) -> Error {
        match &self.first_error {
            Some(first) => first.clone().into(),
            None => {
                let first = err.into_snowflake_error(codes::FAILED_TO_GET_CHUNK);
                self.first_error = Some(first.clone());
                first.into()
            }
        }
    }

    fn check_open(&self) -> Result<()> {
        if let Some(err) = &self.first_error {
            return Err(err.clone().into());
        }
        if self.closed {
            return Err(SnowflakeError::new(codes::ROWS_CLOSED, sql_state::GENERAL_ERROR, "rows are closed")
                .with_query_id(Some(self.query_id.clone()))
                .into());
        }
        Ok(())
    }

    async fn sets(&mut self) -> Result<&mut ResultSets> {
        self.check_open()?;
        if self.state.is_waiting() {
            let outcome = self.state.resolve().await.map(|_| ());
            if let Err(err) = outcome {
                return Err(self.remember(err));
            }
        }
        self.state.resolve().await
    }

    /// The next row of the current result set, `None` once it is exhausted.
    pub async fn next(&mut self) -> Result<Option<SnowflakeRow>> {
        let result = self.sets().await?.current().next_row().await;
        result.map_err(|err| self.remember(err))
    }

    /// The next raw batch, for results requested with arrow batches.
    pub async fn next_batch(&mut self) -> Result<Option<SnowflakeArrowBatch>> {
        let result = self.sets().await?.current().next_batch().await;
        result.map_err(|err| self.remember(err))
    }

    /// Reads the remaining rows of the current result set.
    pub async fn fetch_all(&mut self) -> Result<Vec<SnowflakeRow>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    pub async fn columns(&mut self) -> Result<Vec<SnowflakeColumn>> {
        Ok(self.sets().await?.current().schema().columns.clone())
    }

    async fn column(&mut self, index: usize) -> Result<SnowflakeColumn> {
        Ok(self.sets().await?.current().schema().column(index)?.clone())
    }

    /// Upper-cased Snowflake type name, e.g. `FIXED` or `TIMESTAMP_LTZ`.
    pub async fn column_type_database_type_name(&mut self, index: usize) -> Result<String> {
        let column = self.column(index).await?;
        Ok(column.column_type.logical_type.as_str().to_ascii_uppercase())
    }

    pub async fn column_type_nullable(&mut self, index: usize) -> Result<bool> {
        Ok(self.column(index).await?.column_type.nullable)
    }

    /// Length of text and binary columns.
    pub async fn column_type_length(&mut self, index: usize) -> Result<Option<i64>> {
        let column = self.column(index).await?;
        let column_type = column.column_type;
        Ok(match column_type.logical_type {
            LogicalType::Text | LogicalType::Binary => column_type.length,
            _ => None,
        })
    }

    /// `(precision, scale)` of numbers; time and timestamp columns report `(0, scale)`.
    pub async fn column_type_precision_scale(&mut self, index: usize) -> Result<Option<(i64, i64)>> {
        let column = self.column(index).await?;
        let column_type = column.column_type;
        Ok(match column_type.logical_type {
            LogicalType::Fixed => Some((
                column_type.precision.unwrap_or_default(),
                column_type.scale.unwrap_or_default(),
            )),
            LogicalType::Time
            | LogicalType::TimestampNtz
            | LogicalType::TimestampLtz
            | LogicalType::TimestampTz => Some((0, column_type.scale.unwrap_or_default())),
            _ => None,
        })
    }

    pub async fn column_type_scan_type(&mut self, index: usize) -> Result<ScanType> {
        let schema = self.sets().await?.current().schema();
        Ok(schema.column(index)?.column_type.scan_type(schema.high_precision))
    }

    pub async fn has_next_result_set(&mut self) -> Result<bool> {
        Ok(self.sets().await?.has_next())
    }

    /// Moves to the result of the next statement; `false` when there is none.
    pub async fn next_result_set(&mut self) -> Result<bool> {
        let result = self.sets().await?.advance().await;
        result.map_err(|err| self.remember(err))
    }

    /// Stops any downloads. Never fails; later reads return the first error seen, if any.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Ok(sets) = self.state.resolve().await {
            sets.close();
        }
        Ok(())
    }
}

/// Outcome of a statement run for its side effects.
pub struct SnowflakeResult {
    query_id: String,
    affected: Pending<i64>,
}

impl SnowflakeResult {
    pub(crate) fn ready(query_id: String, affected: i64) -> Self {
        Self {
            query_id,
            affected: Pending::Ready(affected),
        }
    }

    pub(crate) fn pending(
        query_id: String,
        rx: oneshot::Receiver<std::result::Result<i64, SnowflakeError>>,
    ) -> Self {
        Self {
            query_id,
            affected: Pending::Waiting(rx),
        }
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    /// Rows inserted, updated or deleted; waits for asynchronous statements to finish.
    pub async fn rows_affected(&mut self) -> Result<i64> {
        Ok(*self.affected.resolve().await?)
    }
}
