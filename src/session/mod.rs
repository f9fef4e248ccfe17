mod heartbeat;
mod lifecycle;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use chrono::{FixedOffset, Offset, Utc};
use http::HeaderMap;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::auth::client::user_agent;
use crate::chunk::SnowflakeRowStream;
use crate::error::{SnowflakeError, codes, sql_state};
use crate::parameters::SessionParameters;
use crate::query::response::ExecResponseData;
use crate::query::status::QueryStatusReport;
use crate::query::{BindUploader, FileTransferAgent, QueryRequest};
use crate::query_context::{QueryContextCache, QueryContextDto};
use crate::retry::{self, RequestParts, RetryPolicy};
use crate::row::RowSchema;
use crate::telemetry::Telemetry;
use crate::token::TokenAccessor;
use crate::types::{JSON_CONTENT, SnowflakeResponse, parse_body, read_success_body};
use crate::{Result, SnowflakeClientConfig, SnowflakeResult, SnowflakeRows};

pub(crate) use heartbeat::Heartbeat;

const SERVICE_NAME_HEADER: &str = "x-snowflake-service";

/// Names the server may reassign through `final*Name` fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SessionNames {
    pub(crate) database: Option<String>,
    pub(crate) schema: Option<String>,
    pub(crate) warehouse: Option<String>,
    pub(crate) role: Option<String>,
}

/// State shared between a session, its result sets and background tasks.
pub(crate) struct SessionInner {
    pub(crate) http: Client,
    pub(crate) base_url: Url,
    pub(crate) config: SnowflakeClientConfig,
    pub(crate) tokens: Arc<TokenAccessor>,
    pub(crate) parameters: SessionParameters,
    pub(crate) telemetry: Telemetry,
    pub(crate) bind_uploader: Option<Arc<dyn BindUploader>>,
    pub(crate) file_transfer: Option<Arc<dyn FileTransferAgent>>,
    query_context: Mutex<QueryContextCache>,
    sequence: AtomicU64,
    names: ArcSwap<SessionNames>,
    closed: AtomicBool,
}

impl SessionInner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        http: Client,
        base_url: Url,
        config: SnowflakeClientConfig,
        tokens: Arc<TokenAccessor>,
        parameters: SessionParameters,
        names: SessionNames,
        bind_uploader: Option<Arc<dyn BindUploader>>,
        file_transfer: Option<Arc<dyn FileTransferAgent>>,
    ) -> Self {
        let telemetry = Telemetry::new(parameters.telemetry_enabled());
        Self {
            http,
            base_url,
            config,
            tokens,
            parameters,
            telemetry,
            bind_uploader,
            file_transfer,
            query_context: Mutex::new(QueryContextCache::default()),
            sequence: AtomicU64::new(0),
            names: ArcSwap::from_pointee(names),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config)
    }

    /// Headers for an authenticated call; the session token is read at call time.
    pub(crate) fn headers(&self, accept: &'static str) -> Result<HeaderMap> {
        self.headers_with_token(accept, &self.tokens.session_token())
    }

    pub(crate) fn headers_with_token(&self, accept: &'static str, token: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(accept));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT));
        headers.insert(USER_AGENT, HeaderValue::from_str(&user_agent())?);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!(r#"Snowflake Token="{token}""#))?,
        );
        if let Some(service) = self.parameters.service_name() {
            headers.insert(
                HeaderName::from_static(SERVICE_NAME_HEADER),
                HeaderValue::from_str(&service)?,
            );
        }
        Ok(headers)
    }

    /// Sends an authenticated request and parses the response envelope.
    ///
    /// Non-2xx statuses become errors numbered `failure_code`.
    pub(crate) async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        accept: &'static str,
        body: Option<&[u8]>,
        policy: &RetryPolicy,
        failure_code: i64,
    ) -> Result<SnowflakeResponse<T>> {
        let response = retry::execute(&self.http, method, url, policy, || {
            let mut parts = RequestParts::new(self.headers(accept)?);
            parts.body = body.map(<[u8]>::to_vec);
            Ok(parts)
        })
        .await?;
        let body = read_success_body(response, failure_code).await?;
        parse_body(body)
    }

    pub(crate) fn next_sequence_id(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn time_offset(&self) -> FixedOffset {
        self.config
            .time_offset
            .or_else(|| self.parameters.time_offset())
            .unwrap_or_else(|| Utc.fix())
    }

    pub(crate) fn row_schema(&self, data: &ExecResponseData, high_precision: bool) -> Arc<RowSchema> {
        Arc::new(RowSchema::new(
            data.columns(),
            self.time_offset(),
            high_precision,
        ))
    }

    pub(crate) fn query_context_snapshot(&self) -> Option<QueryContextDto> {
        if self.config.disable_query_context_cache {
            return None;
        }
        let cache = match self.query_context.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        Some(cache.snapshot())
    }

    /// Applies the session-level side effects of a successful response.
    pub(crate) fn absorb(&self, data: &ExecResponseData) {
        self.parameters.merge(&data.parameters);

        let current = self.names.load();
        let updated = SessionNames {
            database: data.final_database_name.clone().or_else(|| current.database.clone()),
            schema: data.final_schema_name.clone().or_else(|| current.schema.clone()),
            warehouse: data.final_warehouse_name.clone().or_else(|| current.warehouse.clone()),
            role: data.final_role_name.clone().or_else(|| current.role.clone()),
        };
        if updated != **current {
            debug!(?updated, "session names changed");
            self.names.store(Arc::new(updated));
        }

        if let (false, Some(context)) = (self.config.disable_query_context_cache, &data.query_context) {
            let mut cache = match self.query_context.lock() {
                Ok(cache) => cache,
                Err(poisoned) => poisoned.into_inner(),
            };
            cache.add(&context.entries, self.parameters.query_context_cache_size());
        }
    }

    pub(crate) fn names(&self) -> Arc<SessionNames> {
        self.names.load_full()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SnowflakeError::new(
                codes::FAILED_TO_CONNECT,
                sql_state::CONNECTION_WAS_NOT_ESTABLISHED,
                "session is closed",
            )
            .into());
        }
        Ok(())
    }
}

/// A logged-in Snowflake session.
///
/// Cloning is not supported; share a session behind an `Arc` instead. Result sets keep the
/// session state alive on their own, so dropping the session does not cut off rows that are
/// still being downloaded.
pub struct SnowflakeSession {
    pub(crate) inner: Arc<SessionInner>,
    heartbeat: Mutex<Option<Heartbeat>>,
}

impl SnowflakeSession {
    pub(crate) fn new(inner: Arc<SessionInner>) -> Self {
        let heartbeat = inner
            .config
            .keep_session_alive
            .then(|| Heartbeat::start(&inner));
        Self {
            inner,
            heartbeat: Mutex::new(heartbeat),
        }
    }

    /// Runs a statement and returns its rows.
    pub async fn query<Q: Into<QueryRequest>>(&self, request: Q) -> Result<SnowflakeRows> {
        crate::query::query(&self.inner, request.into()).await
    }

    /// Runs a statement and returns the number of affected rows.
    pub async fn exec<Q: Into<QueryRequest>>(&self, request: Q) -> Result<SnowflakeResult> {
        crate::query::exec(&self.inner, request.into()).await
    }

    /// Submits a statement without waiting for it to finish.
    ///
    /// The returned rows resolve in the background; every accessor waits for the result.
    pub async fn query_async<Q: Into<QueryRequest>>(&self, request: Q) -> Result<SnowflakeRows> {
        crate::query::query_async(&self.inner, request.into()).await
    }

    pub async fn exec_async<Q: Into<QueryRequest>>(&self, request: Q) -> Result<SnowflakeResult> {
        crate::query::exec_async(&self.inner, request.into()).await
    }

    /// Runs a statement and streams its rows one chunk at a time.
    pub async fn query_stream<Q: Into<QueryRequest>>(&self, request: Q) -> Result<SnowflakeRowStream> {
        crate::query::query_stream(&self.inner, request.into()).await
    }

    /// Rows of a statement that was submitted earlier, possibly by another session.
    pub async fn fetch_result_by_id(&self, query_id: &str) -> Result<SnowflakeRows> {
        crate::query::fetch_result_by_id(&self.inner, query_id).await
    }

    pub async fn query_status(&self, query_id: &str) -> Result<QueryStatusReport> {
        crate::query::status::query_status(&self.inner, query_id).await
    }

    /// Logs out. Errors reported by the server for an already expired session are ignored.
    pub async fn close(&self) -> Result<()> {
        self.stop_heartbeat();
        self.inner.close().await
    }

    fn stop_heartbeat(&self) {
        let mut heartbeat = match self.heartbeat.lock() {
            Ok(heartbeat) => heartbeat,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(heartbeat) = heartbeat.as_mut() {
            heartbeat.stop();
        }
    }

    pub fn session_id(&self) -> i64 {
        self.inner.tokens.get().session_id
    }

    pub fn token_accessor(&self) -> Arc<TokenAccessor> {
        Arc::clone(&self.inner.tokens)
    }

    pub fn database(&self) -> Option<String> {
        self.inner.names().database.clone()
    }

    pub fn schema(&self) -> Option<String> {
        self.inner.names().schema.clone()
    }

    pub fn warehouse(&self) -> Option<String> {
        self.inner.names().warehouse.clone()
    }

    pub fn role(&self) -> Option<String> {
        self.inner.names().role.clone()
    }

    /// Current value of a session parameter, as last reported by the server.
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.inner.parameters.get(name)
    }
}

impl Drop for SnowflakeSession {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}
