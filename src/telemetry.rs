use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use reqwest::Method;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::auth::client::client_app_id;
use crate::error::{SnowflakeError, codes};
use crate::retry::epoch_millis;
use crate::session::SessionInner;
use crate::types::{JSON_CONTENT, SnowflakeResponse};

const TELEMETRY_PATH: &str = "/telemetry/send";
const FLUSH_SIZE: usize = 100;
const SQL_EXCEPTION: &str = "client_sql_exception";

/// In-memory buffer of client-side telemetry entries.
///
/// Once a send fails the buffer is disabled for the rest of the session.
#[derive(Debug)]
pub(crate) struct Telemetry {
    logs: Mutex<Vec<Value>>,
    enabled: AtomicBool,
}

impl Telemetry {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            logs: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(enabled),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Buffers a SQL error; returns whether the buffer is due for a flush.
    pub(crate) fn record_error(&self, err: &SnowflakeError) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let entry = json!({
            "timestamp": epoch_millis(),
            "message": {
                "type": SQL_EXCEPTION,
                "source": client_app_id(),
                "QueryID": err.query_id,
                "SQLState": err.sql_state,
                "ErrorNumber": err.number.to_string(),
                "reason": err.formatted_message(),
            },
        });
        let mut logs = self.lock();
        logs.push(entry);
        logs.len() >= FLUSH_SIZE
    }

    pub(crate) fn take(&self) -> Vec<Value> {
        std::mem::take(&mut *self.lock())
    }

    pub(crate) fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Value>> {
        match self.logs.lock() {
            Ok(logs) => logs,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl SessionInner {
    /// Records a query failure and sends the buffer once it is full.
    pub(crate) async fn report_error(&self, err: &SnowflakeError) {
        if self.telemetry.record_error(err) {
            self.flush_telemetry().await;
        }
    }

    pub(crate) async fn flush_telemetry(&self) {
        if !self.telemetry.is_enabled() {
            return;
        }
        let logs = self.telemetry.take();
        if logs.is_empty() {
            return;
        }
        let count = logs.len();
        let result = self.send_telemetry(logs).await;
        match result {
            Ok(()) => debug!(count, "telemetry sent"),
            Err(err) => {
                warn!(error = %err, "failed to send telemetry, disabling it");
                self.telemetry.disable();
            }
        }
    }

    async fn send_telemetry(&self, logs: Vec<Value>) -> crate::Result<()> {
        let body = serde_json::to_vec(&json!({ "logs": logs }))?;
        let mut policy = self.retry_policy();
        policy.max_retry_count = 0;
        let response: SnowflakeResponse<Value> = self
            .request(
                Method::POST,
                self.url(TELEMETRY_PATH)?,
                JSON_CONTENT,
                Some(&body),
                &policy,
                codes::FAILED_TO_POST_TELEMETRY,
            )
            .await?;
        if !response.success {
            return Err(rejected(&response).into());
        }
        Ok(())
    }
}

fn rejected(response: &SnowflakeResponse<Value>) -> SnowflakeError {
    response.to_error(codes::FAILED_TO_POST_TELEMETRY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::sql_state;

    #[test]
    fn records_sql_exceptions() {
        let telemetry = Telemetry::new(true);
        let err = SnowflakeError::new(2003, sql_state::GENERAL_ERROR, "missing {}")
            .with_args(["T"])
            .with_query_id(Some("01ab".to_string()));
        assert!(!telemetry.record_error(&err));

        let logs = telemetry.take();
        assert_eq!(logs.len(), 1);
        let message = &logs[0]["message"];
        assert_eq!(message["type"], SQL_EXCEPTION);
        assert_eq!(message["QueryID"], "01ab");
        assert_eq!(message["ErrorNumber"], "2003");
        assert_eq!(message["reason"], "missing T");
        assert!(telemetry.take().is_empty());
    }

    #[test]
    fn asks_for_a_flush_when_full() {
        let telemetry = Telemetry::new(true);
        let err = SnowflakeError::new(1, "", "x");
        let due = (0..FLUSH_SIZE).filter(|_| telemetry.record_error(&err)).count();
        assert_eq!(due, 1);
    }

    #[test]
    fn rejected_sends_carry_their_own_code() {
        let response: SnowflakeResponse<Value> =
            serde_json::from_str(r#"{"data": null, "code": null, "message": "rejected", "success": false}"#)
                .unwrap();
        let err = rejected(&response);
        assert_eq!(err.number, codes::FAILED_TO_POST_TELEMETRY);
        assert_ne!(err.number, codes::FAILED_TO_POST_QUERY);

        let response: SnowflakeResponse<Value> =
            serde_json::from_str(r#"{"data": null, "code": "390114", "message": "expired", "success": false}"#)
                .unwrap();
        assert_eq!(rejected(&response).number, 390114);
    }

    #[test]
    fn disabled_buffer_drops_entries() {
        let telemetry = Telemetry::new(true);
        let err = SnowflakeError::new(1, "", "x");
        telemetry.record_error(&err);
        telemetry.disable();
        assert!(!telemetry.record_error(&err));
        assert!(telemetry.take().is_empty());

        let off = Telemetry::new(false);
        assert!(!off.record_error(&err));
    }
}
