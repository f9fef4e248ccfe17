use reqwest::Response;
use serde::Deserialize;

use crate::error::{Error, Result, SnowflakeError, sql_state};

pub(crate) const QUERY_IN_PROGRESS_CODE: &str = "333333";
pub(crate) const QUERY_IN_PROGRESS_ASYNC_CODE: &str = "333334";
pub(crate) const SESSION_EXPIRED_CODE: &str = "390112";
pub(crate) const SESSION_GONE_CODE: &str = "390111";
pub(crate) const QUERY_NOT_EXECUTING_CODE: &str = "000605";

pub(crate) const SNOWFLAKE_ACCEPT: &str = "application/snowflake";
pub(crate) const JSON_CONTENT: &str = "application/json";

#[derive(Deserialize, Debug)]
pub(crate) struct SnowflakeResponse<T> {
    pub(crate) data: Option<T>,
    pub(crate) code: Option<String>,
    pub(crate) message: Option<String>,
    #[serde(default)]
    pub(crate) success: bool,
}

impl<T> SnowflakeResponse<T> {
    pub(crate) fn is_session_expired(&self) -> bool {
        self.code.as_deref() == Some(SESSION_EXPIRED_CODE)
    }

    pub(crate) fn is_in_progress(&self) -> bool {
        matches!(
            self.code.as_deref(),
            Some(QUERY_IN_PROGRESS_CODE) | Some(QUERY_IN_PROGRESS_ASYNC_CODE)
        )
    }

    /// Error built from the envelope only, numbered `fallback` when the server sent no code.
    pub(crate) fn to_error(&self, fallback: i64) -> SnowflakeError {
        let mut err =
            SnowflakeError::from_server(self.code.as_deref(), None, self.message.as_deref(), None);
        if self.code.as_deref().and_then(|c| c.parse::<i64>().ok()).is_none() {
            err.number = fallback;
        }
        err
    }
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct NameValueParameter {
    pub(crate) name: String,
    pub(crate) value: serde_json::Value,
}

pub(crate) fn parse_body<T: serde::de::DeserializeOwned>(body: String) -> Result<T> {
    serde_json::from_str(&body).map_err(|e| Error::Json(e, body))
}

/// Reads the body of a successful response; any other status becomes a structured error
/// numbered `code` that cites the status and whatever the server sent.
pub(crate) async fn read_success_body(response: Response, code: i64) -> Result<String> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(http_status_error(code, status.as_u16(), &body).into());
    }
    Ok(body)
}

pub(crate) fn http_status_error(code: i64, status: u16, body: &str) -> SnowflakeError {
    SnowflakeError::new(
        code,
        sql_state::CONNECTION_FAILURE,
        "HTTP status: {}, response body: {}",
    )
    .with_args([status.to_string(), body.to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;

    #[test]
    fn envelope_error_keeps_server_code() {
        let response: SnowflakeResponse<()> = serde_json::from_str(
            r#"{"data": null, "code": "002003", "message": "does not exist", "success": false}"#,
        )
        .unwrap();
        let err = response.to_error(codes::FAILED_TO_POST_QUERY);
        assert_eq!(err.number, 2003);
        assert_eq!(err.message, "does not exist");
    }

    #[test]
    fn envelope_error_without_code_uses_fallback() {
        let response: SnowflakeResponse<()> =
            serde_json::from_str(r#"{"message": "nope", "success": false}"#).unwrap();
        assert_eq!(response.to_error(codes::FAILED_TO_AUTH).number, codes::FAILED_TO_AUTH);
        assert!(!response.is_in_progress());
    }

    #[test]
    fn status_error_cites_status() {
        let err = http_status_error(codes::FAILED_TO_GET_CHUNK, 403, "denied");
        assert_eq!(
            err.formatted_message(),
            "HTTP status: 403, response body: denied"
        );
    }
}
