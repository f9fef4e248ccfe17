//! Results of requests carrying several statements.
//!
//! The parent response only lists the child query ids and statement types; every child
//! result is fetched from `/queries/<id>/result`.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use crate::chunk::ChunkDownloader;
use crate::error::{SnowflakeError, codes, sql_state};
use crate::session::SessionInner;
use crate::Result;

use super::response::{ExecResponseData, is_dml};
use super::{ResultOptions, dml_affected_rows, fetch_result, result_path, result_set};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChildResult {
    pub(crate) query_id: String,
    pub(crate) statement_type_id: i64,
}

fn split(list: Option<&str>) -> Vec<&str> {
    list.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Pairs `resultIds` with `resultTypes`.
pub(crate) fn child_results(data: &ExecResponseData) -> Result<Vec<ChildResult>> {
    let query_id = data.query_id.clone();
    let ids = split(data.result_ids.as_deref());
    if ids.is_empty() {
        return Err(SnowflakeError::new(
            codes::NO_RESULT_IDS,
            sql_state::GENERAL_ERROR,
            "no result ids returned with the multi-statement query",
        )
        .with_query_id(query_id)
        .into());
    }
    let types = split(data.result_types.as_deref());
    if ids.len() != types.len() {
        return Err(SnowflakeError::new(
            codes::RESULT_IDS_MISMATCH,
            sql_state::GENERAL_ERROR,
            "got {} result ids but {} result types",
        )
        .with_args([ids.len(), types.len()])
        .with_query_id(query_id)
        .into());
    }
    ids.into_iter()
        .zip(types)
        .map(|(id, kind)| {
            let statement_type_id = kind.parse::<i64>().map_err(|_| {
                SnowflakeError::new(
                    codes::RESULT_IDS_MISMATCH,
                    sql_state::GENERAL_ERROR,
                    "invalid result type: {}",
                )
                .with_args([kind])
            })?;
            Ok(ChildResult {
                query_id: id.to_string(),
                statement_type_id,
            })
        })
        .collect()
}

/// Affected rows summed over the DML statements of a multi-statement request.
pub(crate) async fn affected_rows(session: &Arc<SessionInner>, data: &ExecResponseData) -> Result<i64> {
    let mut total = 0;
    for child in child_results(data)? {
        if !is_dml(child.statement_type_id) {
            continue;
        }
        let result = fetch_result(session, &result_path(&child.query_id)).await?;
        total += dml_affected_rows(session, result).await?;
    }
    Ok(total)
}

/// The result sets of one request, walked in statement order.
pub(crate) struct ResultSets {
    session: Arc<SessionInner>,
    options: ResultOptions,
    current: ChunkDownloader,
    remaining: VecDeque<ChildResult>,
}

impl ResultSets {
    pub(crate) fn single(session: Arc<SessionInner>, current: ChunkDownloader, options: ResultOptions) -> Self {
        Self {
            session,
            options,
            current,
            remaining: VecDeque::new(),
        }
    }

    pub(crate) async fn from_response(
        session: &Arc<SessionInner>,
        data: ExecResponseData,
        options: ResultOptions,
    ) -> Result<Self> {
        if !data.is_multi_statement() {
            let current = result_set(session, data, options)?;
            return Ok(Self::single(Arc::clone(session), current, options));
        }
        let mut remaining: VecDeque<ChildResult> = child_results(&data)?.into();
        debug!(query_id = ?data.query_id, children = remaining.len(), "multi-statement result");
        let first = remaining.pop_front().ok_or_else(|| {
            SnowflakeError::new(codes::NO_RESULT_IDS, sql_state::GENERAL_ERROR, "no result ids")
        })?;
        let current = child_result_set(session, &first, options).await?;
        Ok(Self {
            session: Arc::clone(session),
            options,
            current,
            remaining,
        })
    }

    pub(crate) fn current(&mut self) -> &mut ChunkDownloader {
        &mut self.current
    }

    pub(crate) fn has_next(&self) -> bool {
        !self.remaining.is_empty()
    }

    /// Moves to the next statement's result; `false` when there is none.
    pub(crate) async fn advance(&mut self) -> Result<bool> {
        let Some(child) = self.remaining.pop_front() else {
            return Ok(false);
        };
        let next = child_result_set(&self.session, &child, self.options).await?;
        self.current.close();
        self.current = next;
        Ok(true)
    }

    pub(crate) fn close(&mut self) {
        self.current.close();
        self.remaining.clear();
    }
}

async fn child_result_set(
    session: &Arc<SessionInner>,
    child: &ChildResult,
    options: ResultOptions,
) -> Result<ChunkDownloader> {
    debug!(query_id = %child.query_id, "fetching statement result");
    let data = fetch_result(session, &result_path(&child.query_id)).await?;
    result_set(session, data, options)
}
