use std::sync::Arc;

use reqwest::Method;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{SnowflakeError, codes, sql_state};
use crate::retry::with_request_ids;
use crate::session::SessionInner;
use crate::types::{JSON_CONTENT, SnowflakeResponse};
use crate::Result;

use super::validate_query_id;

/// Server-side state of a query as reported by the monitoring endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStatus {
    Running,
    Aborting,
    Success,
    FailedWithError,
    Aborted,
    Queued,
    FailedWithIncident,
    Disconnected,
    ResumingWarehouse,
    /// Spelled `QUEUED_REPARING_WAREHOUSE` by the server.
    QueuedRepairingWarehouse,
    Restarted,
    Blocked,
    NoData,
    Other(String),
}

impl QueryStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "RUNNING" => Self::Running,
            "ABORTING" => Self::Aborting,
            "SUCCESS" => Self::Success,
            "FAILED_WITH_ERROR" => Self::FailedWithError,
            "ABORTED" => Self::Aborted,
            "QUEUED" => Self::Queued,
            "FAILED_WITH_INCIDENT" => Self::FailedWithIncident,
            "DISCONNECTED" => Self::Disconnected,
            "RESUMING_WAREHOUSE" => Self::ResumingWarehouse,
            "QUEUED_REPARING_WAREHOUSE" => Self::QueuedRepairingWarehouse,
            "RESTARTED" => Self::Restarted,
            "BLOCKED" => Self::Blocked,
            "NO_DATA" => Self::NoData,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Self::Running
                | Self::ResumingWarehouse
                | Self::Queued
                | Self::QueuedRepairingWarehouse
                | Self::NoData
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::Aborting
                | Self::FailedWithError
                | Self::Aborted
                | Self::FailedWithIncident
                | Self::Disconnected
                | Self::Blocked
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryStatusReport {
    pub query_id: String,
    pub status: QueryStatus,
    pub sql_text: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl QueryStatusReport {
    /// Fails when the query reported an error or is still running.
    pub fn check(&self) -> Result<()> {
        if let Some(code) = self.error_code.as_deref().filter(|c| !c.is_empty()) {
            return Err(SnowflakeError::new(
                codes::QUERY_REPORTED_ERROR,
                sql_state::GENERAL_ERROR,
                "query reported error {}: {}",
            )
            .with_args([code, self.error_message.as_deref().unwrap_or_default()])
            .with_query_id(Some(self.query_id.clone()))
            .into());
        }
        if self.status.is_running() {
            return Err(SnowflakeError::new(
                codes::QUERY_IS_RUNNING,
                sql_state::GENERAL_ERROR,
                "query is still running",
            )
            .with_query_id(Some(self.query_id.clone()))
            .into());
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct MonitoringData {
    #[serde(default)]
    queries: Vec<MonitoredQuery>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct MonitoredQuery {
    id: String,
    status: String,
    sql_text: Option<String>,
    start_time: Option<i64>,
    end_time: Option<i64>,
    error_code: Option<String>,
    error_message: Option<String>,
}

impl From<MonitoredQuery> for QueryStatusReport {
    fn from(query: MonitoredQuery) -> Self {
        Self {
            query_id: query.id,
            status: QueryStatus::parse(&query.status),
            sql_text: query.sql_text,
            start_time: query.start_time,
            end_time: query.end_time,
            error_code: query.error_code,
            error_message: query.error_message,
        }
    }
}

pub(crate) async fn query_status(session: &Arc<SessionInner>, query_id: &str) -> Result<QueryStatusReport> {
    session.ensure_open()?;
    validate_query_id(query_id)?;
    let url = with_request_ids(
        session.url(&format!("/monitoring/queries/{query_id}"))?,
        &Uuid::new_v4(),
    );
    let response: SnowflakeResponse<MonitoringData> = session
        .request(
            Method::GET,
            url,
            JSON_CONTENT,
            None,
            &session.retry_policy(),
            codes::QUERY_STATUS,
        )
        .await?;
    if !response.success {
        return Err(response.to_error(codes::QUERY_STATUS).into());
    }
    response
        .data
        .and_then(|data| data.queries.into_iter().next())
        .map(QueryStatusReport::from)
        .ok_or_else(|| {
            SnowflakeError::new(
                codes::QUERY_STATUS,
                sql_state::GENERAL_ERROR,
                "no status returned for query {}",
            )
            .with_args([query_id])
            .with_query_id(Some(query_id.to_string()))
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn classifies_statuses() {
        assert!(QueryStatus::parse("QUEUED_REPARING_WAREHOUSE").is_running());
        assert!(QueryStatus::parse("RUNNING").is_running());
        assert!(QueryStatus::parse("FAILED_WITH_ERROR").is_error());
        let success = QueryStatus::parse("SUCCESS");
        assert!(!success.is_running() && !success.is_error());
        assert_eq!(QueryStatus::parse("NEW"), QueryStatus::Other("NEW".into()));
    }

    #[test]
    fn report_check_surfaces_errors() {
        let body = r#"{
            "data": {"queries": [{
                "id": "01b2c3d4-0000-1234-0000-000100020003",
                "status": "FAILED_WITH_ERROR",
                "errorCode": "2003",
                "errorMessage": "does not exist"
            }]},
            "success": true
        }"#;
        let response: SnowflakeResponse<MonitoringData> = serde_json::from_str(body).unwrap();
        let report = QueryStatusReport::from(response.data.unwrap().queries.remove(0));
        assert_eq!(report.status, QueryStatus::FailedWithError);

        let Err(Error::Snowflake(err)) = report.check() else {
            panic!("expected an error");
        };
        assert_eq!(err.number, codes::QUERY_REPORTED_ERROR);
        assert_eq!(err.formatted_message(), "query reported error 2003: does not exist");
    }
}
