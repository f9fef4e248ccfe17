use std::sync::atomic::Ordering;

use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::codes;
use crate::retry::{self, RequestParts, with_request_ids};
use crate::types::{
    JSON_CONTENT, SESSION_EXPIRED_CODE, SESSION_GONE_CODE, SnowflakeResponse, parse_body,
    read_success_body,
};
use crate::{Error, Result};

use super::SessionInner;

const TOKEN_REQUEST_PATH: &str = "/session/token-request";
const SESSION_PATH: &str = "/session";
const HEARTBEAT_PATH: &str = "/session/heartbeat";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenewSessionResponseData {
    session_token: String,
    master_token: Option<String>,
    session_id: Option<i64>,
}

impl SessionInner {
    /// Renews the session token if it is still `stale`.
    ///
    /// Callers racing on the same expired token serialize on the renewal lock; only the first
    /// one reaches the server, the rest observe the new token and return.
    pub(crate) async fn renew_expired(&self, stale: &str) -> Result<()> {
        let _guard = self.tokens.lock().await;
        let current = self.tokens.get();
        if current.session_token != stale {
            debug!("session token already renewed");
            return Ok(());
        }

        let url = with_request_ids(self.url(TOKEN_REQUEST_PATH)?, &Uuid::new_v4());
        let body = json!({
            "oldSessionToken": current.session_token,
            "requestType": "RENEW",
        });
        let response = retry::execute(&self.http, Method::POST, url, &self.retry_policy(), || {
            RequestParts::json(
                self.headers_with_token(JSON_CONTENT, &current.master_token)?,
                &body,
            )
        })
        .await?;
        let body = read_success_body(response, codes::FAILED_TO_RENEW_SESSION).await?;
        let response: SnowflakeResponse<RenewSessionResponseData> = parse_body(body)?;
        if !response.success {
            return Err(response.to_error(codes::FAILED_TO_RENEW_SESSION).into());
        }
        let data = response
            .data
            .ok_or_else(|| Error::Communication("missing token-request data".to_string()))?;

        let session_id = data.session_id.unwrap_or(current.session_id);
        self.tokens.set(
            &data.session_token,
            data.master_token.as_deref().unwrap_or(&current.master_token),
            session_id,
        );
        info!(session_id, "session token renewed");
        Ok(())
    }

    /// Deletes the server-side session and clears the tokens. Safe to call more than once.
    pub(crate) async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.flush_telemetry().await;

        let mut url = self.url(SESSION_PATH)?;
        url.query_pairs_mut().append_pair("delete", "true");
        let url = with_request_ids(url, &Uuid::new_v4());
        let result = self
            .request::<Value>(
                Method::POST,
                url,
                JSON_CONTENT,
                None,
                &self.retry_policy(),
                codes::FAILED_TO_CLOSE_SESSION,
            )
            .await;
        let session_id = self.tokens.get().session_id;
        self.tokens.clear();

        let response = result?;
        let tolerated = matches!(
            response.code.as_deref(),
            Some(SESSION_EXPIRED_CODE) | Some(SESSION_GONE_CODE)
        );
        if !response.success && !tolerated {
            warn!(session_id, code = ?response.code, "failed to close session");
            return Err(response.to_error(codes::FAILED_TO_CLOSE_SESSION).into());
        }
        info!(session_id, "session closed");
        Ok(())
    }

    pub(crate) async fn heartbeat(&self) -> Result<()> {
        let token = self.tokens.session_token();
        let url = with_request_ids(self.url(HEARTBEAT_PATH)?, &Uuid::new_v4());
        let response: SnowflakeResponse<Value> = self
            .request(
                Method::POST,
                url,
                JSON_CONTENT,
                None,
                &self.retry_policy(),
                codes::FAILED_TO_HEARTBEAT,
            )
            .await?;
        if response.is_session_expired() {
            debug!("heartbeat found an expired session");
            return self.renew_expired(&token).await;
        }
        if !response.success {
            return Err(response.to_error(codes::FAILED_TO_HEARTBEAT).into());
        }
        debug!("heartbeat sent");
        Ok(())
    }
}
