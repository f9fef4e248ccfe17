//! Statement submission, polling and result-set construction.

mod async_result;
mod multi_statement;
pub(crate) mod response;
pub(crate) mod status;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunk::{
    ChunkDecoder, ChunkDownloader, ChunkFormat, HttpChunkFetcher, SnowflakeRowStream,
    TimestampResolution,
};
use crate::error::{SnowflakeError, codes, sql_state};
use crate::parameters::MULTI_STATEMENT_COUNT;
use crate::retry::{QUERY_REQUEST_PATH, with_request_guid, with_request_ids};
use crate::row::{RowSchema, SnowflakeColumn, SnowflakeColumnType};
use crate::session::SessionInner;
use crate::types::{
    JSON_CONTENT, QUERY_IN_PROGRESS_ASYNC_CODE, QUERY_NOT_EXECUTING_CODE, SNOWFLAKE_ACCEPT,
    SnowflakeResponse,
};
use crate::{Error, Result, SnowflakeResult, SnowflakeRows};

pub(crate) use async_result::Pending;
pub(crate) use multi_statement::ResultSets;
use response::ExecResponseData;

const ABORT_REQUEST_PATH: &str = "/queries/v1/abort-request";
const POLL_SCHEDULE: [Duration; 7] = [
    Duration::from_millis(500),
    Duration::from_millis(500),
    Duration::from_millis(1000),
    Duration::from_millis(1500),
    Duration::from_millis(2000),
    Duration::from_millis(4000),
    Duration::from_millis(5000),
];
/// Consecutive session expiries tolerated while an async query is polled in the background.
const ASYNC_EXPIRY_CAP: u32 = 2;

/// A statement plus everything that shapes how it is submitted and how its result is read.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub sql_text: String,
    bindings: Vec<Binding>,
    describe_only: bool,
    multi_statement_count: Option<u32>,
    request_id: Option<Uuid>,
    high_precision: bool,
    arrow_batches: bool,
    timestamp_resolution: TimestampResolution,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
    query_id_sender: Option<mpsc::UnboundedSender<String>>,
}

impl QueryRequest {
    pub fn new(sql_text: impl Into<String>) -> Self {
        Self {
            sql_text: sql_text.into(),
            ..Default::default()
        }
    }

    /// Positional bind values, `?` or `:1`, `:2`, ... in the statement.
    pub fn with_bindings(mut self, bindings: Vec<Binding>) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn bind(mut self, binding: Binding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Ask the server for result metadata only.
    pub fn describe_only(mut self) -> Self {
        self.describe_only = true;
        self
    }

    /// Number of statements in a multi-statement request; `0` accepts any number.
    pub fn with_multi_statement_count(mut self, count: u32) -> Self {
        self.multi_statement_count = Some(count);
        self
    }

    /// Reuses a caller-chosen request id, e.g. to resubmit a statement idempotently.
    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Return NUMBER columns as exact decimals.
    pub fn with_high_precision(mut self) -> Self {
        self.high_precision = true;
        self
    }

    /// Hand out Arrow results as record batches instead of rows.
    pub fn with_arrow_batches(mut self) -> Self {
        self.arrow_batches = true;
        self
    }

    pub fn with_timestamp_resolution(mut self, resolution: TimestampResolution) -> Self {
        self.timestamp_resolution = resolution;
        self
    }

    /// Deadline for submitting the statement and waiting for it to finish.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Receives the query id as soon as the server assigns one.
    pub fn with_query_id_sender(mut self, sender: mpsc::UnboundedSender<String>) -> Self {
        self.query_id_sender = Some(sender);
        self
    }

    fn publish_query_id(&self, query_id: &str) {
        if let Some(sender) = &self.query_id_sender {
            let _ = sender.send(query_id.to_string());
        }
    }
}

impl From<&str> for QueryRequest {
    fn from(sql_text: &str) -> Self {
        Self::new(sql_text)
    }
}

impl From<String> for QueryRequest {
    fn from(sql_text: String) -> Self {
        Self::new(sql_text)
    }
}

impl From<&QueryRequest> for QueryRequest {
    fn from(request: &QueryRequest) -> Self {
        request.clone()
    }
}

/// A bind value in the server's text encoding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Binding {
    #[serde(rename = "type")]
    pub data_type: String,
    pub value: BindingValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BindingValue {
    Scalar(Option<String>),
    /// One value per row of an array bind.
    Array(Vec<Option<String>>),
}

impl Binding {
    fn scalar(data_type: &str, value: Option<String>) -> Self {
        Self {
            data_type: data_type.to_string(),
            value: BindingValue::Scalar(value),
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::scalar("TEXT", Some(value.into()))
    }

    pub fn fixed(value: i64) -> Self {
        Self::scalar("FIXED", Some(value.to_string()))
    }

    pub fn real(value: f64) -> Self {
        Self::scalar("REAL", Some(value.to_string()))
    }

    pub fn boolean(value: bool) -> Self {
        Self::scalar("BOOLEAN", Some(value.to_string()))
    }

    pub fn null(data_type: &str) -> Self {
        Self::scalar(data_type, None)
    }

    pub fn array(data_type: &str, values: Vec<Option<String>>) -> Self {
        Self {
            data_type: data_type.to_string(),
            value: BindingValue::Array(values),
        }
    }
}

fn array_bind_value_count(bindings: &[Binding]) -> usize {
    bindings
        .iter()
        .map(|b| match &b.value {
            BindingValue::Array(values) => values.len(),
            BindingValue::Scalar(_) => 0,
        })
        .sum()
}

fn inline_bindings(bindings: &[Binding]) -> Result<Value> {
    let mut out = Map::with_capacity(bindings.len());
    for (i, binding) in bindings.iter().enumerate() {
        out.insert((i + 1).to_string(), serde_json::to_value(binding)?);
    }
    Ok(Value::Object(out))
}

/// Uploads large array binds to a stage and returns the stage location.
#[async_trait]
pub trait BindUploader: Send + Sync {
    async fn upload(&self, request_id: &Uuid, bindings: &[Binding]) -> Result<String>;
}

/// Executes PUT and GET statements against object storage.
#[async_trait]
pub trait FileTransferAgent: Send + Sync {
    /// `response` is the `data` of the server's reply to the statement.
    async fn execute(&self, sql_text: &str, response: &Value) -> Result<TransferOutput>;
}

/// Per-file report of a PUT or GET, surfaced as text rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

/// PUT and GET are recognized by their first keyword, after any leading comments.
fn is_file_transfer(sql: &str) -> bool {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map_or("", |(_, r)| r).trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, r)| r).trim_start();
        } else {
            break;
        }
    }
    rest.split_whitespace()
        .next()
        .is_some_and(|word| word.eq_ignore_ascii_case("put") || word.eq_ignore_ascii_case("get"))
}

/// How a result set should be decoded.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResultOptions {
    pub(crate) high_precision: bool,
    pub(crate) raw_batches: Option<TimestampResolution>,
    pub(crate) custom_json_decoder: bool,
    pub(crate) max_workers: usize,
}

impl ResultOptions {
    pub(crate) fn new(session: &SessionInner, request: &QueryRequest) -> Self {
        Self {
            high_precision: request.high_precision,
            raw_batches: request.arrow_batches.then_some(request.timestamp_resolution),
            ..Self::defaults(session)
        }
    }

    pub(crate) fn defaults(session: &SessionInner) -> Self {
        Self {
            high_precision: false,
            raw_batches: None,
            custom_json_decoder: session.config.custom_json_decoder,
            max_workers: session.config.max_chunk_download_workers,
        }
    }
}

enum Submitted {
    Done(ExecResponseData),
    /// Accepted for asynchronous execution; the result is polled at `result_url`.
    Pending { query_id: String, result_url: String },
    Transfer { query_id: String, output: TransferOutput },
}

impl Submitted {
    fn query_id(&self) -> String {
        match self {
            Submitted::Done(data) => data.query_id.clone().unwrap_or_default(),
            Submitted::Pending { query_id, .. } | Submitted::Transfer { query_id, .. } => {
                query_id.clone()
            }
        }
    }
}

async fn submit(
    session: &Arc<SessionInner>,
    request: &QueryRequest,
    request_id: Uuid,
    async_exec: bool,
) -> Result<Submitted> {
    session.ensure_open()?;
    let mut body = json!({
        "sqlText": request.sql_text,
        "asyncExec": async_exec,
        "sequenceId": session.next_sequence_id(),
        "isInternal": false,
    });
    if request.describe_only {
        body["describeOnly"] = json!(true);
    }
    if let Some(count) = request.multi_statement_count {
        body["parameters"] = json!({ MULTI_STATEMENT_COUNT: count });
    }
    if let Some(context) = session
        .query_context_snapshot()
        .filter(|c| !c.entries.is_empty())
    {
        body["queryContextDTO"] = serde_json::to_value(context)?;
    }
    if !request.bindings.is_empty() {
        let threshold = session.parameters.array_binding_threshold();
        match (&session.bind_uploader, threshold) {
            (Some(uploader), Some(threshold))
                if array_bind_value_count(&request.bindings) >= threshold =>
            {
                let stage = uploader
                    .upload(&request_id, &request.bindings)
                    .await
                    .map_err(|err| {
                        SnowflakeError::new(codes::BIND_UPLOAD, sql_state::GENERAL_ERROR, "failed to upload bindings: {}")
                            .with_args([err])
                    })?;
                debug!(%request_id, %stage, "bindings uploaded to stage");
                body["bindStage"] = json!(stage);
            }
            _ => body["bindings"] = inline_bindings(&request.bindings)?,
        }
    }

    if is_file_transfer(&request.sql_text) {
        return submit_file_transfer(session, request, request_id, &body).await;
    }

    let response: SnowflakeResponse<ExecResponseData> =
        post_query(session, &body, &request_id, SNOWFLAKE_ACCEPT).await?;
    let query_id = response
        .data
        .as_ref()
        .and_then(|d| d.query_id.clone())
        .unwrap_or_default();
    if !query_id.is_empty() {
        request.publish_query_id(&query_id);
    }

    if response.is_in_progress() {
        let result_url = response
            .data
            .as_ref()
            .and_then(|d| d.get_result_url.clone())
            .ok_or(Error::NoPollingUrlAsyncQuery)?;
        if async_exec && response.code.as_deref() == Some(QUERY_IN_PROGRESS_ASYNC_CODE) {
            debug!(%query_id, "query accepted for asynchronous execution");
            return Ok(Submitted::Pending {
                query_id,
                result_url,
            });
        }
        debug!(%query_id, "query in progress, polling");
        return await_result(session, &result_url, None).await.map(Submitted::Done);
    }
    finish(session, response).await.map(Submitted::Done)
}

async fn submit_file_transfer(
    session: &Arc<SessionInner>,
    request: &QueryRequest,
    request_id: Uuid,
    body: &Value,
) -> Result<Submitted> {
    let agent = session.file_transfer.clone().ok_or_else(|| {
        SnowflakeError::new(
            codes::FILE_TRANSFER_NOT_CONFIGURED,
            sql_state::FEATURE_NOT_SUPPORTED,
            "PUT and GET require a file transfer agent",
        )
    })?;
    let response: SnowflakeResponse<Value> =
        post_query(session, body, &request_id, JSON_CONTENT).await?;
    if !response.success {
        let err = response.to_error(codes::FAILED_TO_POST_QUERY);
        session.report_error(&err).await;
        return Err(err.into());
    }
    let data = response.data.unwrap_or(Value::Null);
    let query_id = data["queryId"].as_str().unwrap_or_default().to_string();
    if !query_id.is_empty() {
        request.publish_query_id(&query_id);
    }
    let output = agent.execute(&request.sql_text, &data).await?;
    Ok(Submitted::Transfer { query_id, output })
}

/// POSTs a query request, renewing the session and resending once if it has expired.
async fn post_query<T: DeserializeOwned>(
    session: &SessionInner,
    body: &Value,
    request_id: &Uuid,
    accept: &'static str,
) -> Result<SnowflakeResponse<T>> {
    let body = serde_json::to_vec(body)?;
    let policy = session
        .retry_policy()
        .with_total_timeout(session.config.request_timeout);
    let mut renewed = false;
    loop {
        let token = session.tokens.session_token();
        let url = with_request_ids(session.url(QUERY_REQUEST_PATH)?, request_id);
        let response: SnowflakeResponse<T> = session
            .request(
                Method::POST,
                url,
                accept,
                Some(&body),
                &policy,
                codes::FAILED_TO_POST_QUERY,
            )
            .await?;
        if response.is_session_expired() && !renewed {
            info!(%request_id, "session expired while submitting, renewing");
            session.renew_expired(&token).await?;
            renewed = true;
            continue;
        }
        return Ok(response);
    }
}

/// GETs `path` until the query leaves the in-progress states.
///
/// A session expiry renews and retries the same URL. With an `expiry_cap`, that many
/// consecutive expiries are renewed and the next one is returned as an error.
async fn poll_result(
    session: &SessionInner,
    path: &str,
    expiry_cap: Option<u32>,
    sleep_first: bool,
) -> Result<SnowflakeResponse<ExecResponseData>> {
    let url = session.url(path)?;
    let mut attempt = 0;
    let mut expiries = 0;
    loop {
        if sleep_first || attempt > 0 {
            let delay = POLL_SCHEDULE[attempt.min(POLL_SCHEDULE.len() - 1)];
            tokio::time::sleep(delay).await;
        }
        attempt += 1;

        let token = session.tokens.session_token();
        let response: SnowflakeResponse<ExecResponseData> = session
            .request(
                Method::GET,
                with_request_guid(&url),
                SNOWFLAKE_ACCEPT,
                None,
                &session.retry_policy(),
                codes::FAILED_TO_POST_QUERY,
            )
            .await?;
        if response.is_session_expired() {
            expiries += 1;
            if expiry_cap.is_some_and(|cap| expiries > cap) {
                warn!(path, expiries, "session kept expiring while polling");
                return Err(response.to_error(codes::SESSION_EXPIRED).into());
            }
            session.renew_expired(&token).await?;
            continue;
        }
        expiries = 0;
        if !response.is_in_progress() {
            return Ok(response);
        }
        debug!(path, attempt, "query still in progress");
    }
}

/// Waits for a submitted query to finish.
async fn await_result(
    session: &SessionInner,
    path: &str,
    expiry_cap: Option<u32>,
) -> Result<ExecResponseData> {
    let response = poll_result(session, path, expiry_cap, true).await?;
    finish(session, response).await
}

/// Result of a query that may already be finished.
async fn fetch_result(session: &SessionInner, path: &str) -> Result<ExecResponseData> {
    let response = poll_result(session, path, None, false).await?;
    finish(session, response).await
}

fn result_path(query_id: &str) -> String {
    format!("/queries/{query_id}/result")
}

/// Turns a final response into its data, or into the server's error.
async fn finish(
    session: &SessionInner,
    response: SnowflakeResponse<ExecResponseData>,
) -> Result<ExecResponseData> {
    let SnowflakeResponse {
        data,
        code,
        message,
        success,
    } = response;
    let data = data.unwrap_or_default();
    if !success {
        let code = data.error_code.as_deref().or(code.as_deref());
        let mut err = SnowflakeError::from_server(
            code,
            data.sql_state.as_deref(),
            message.as_deref(),
            data.query_id.as_deref(),
        );
        if code.and_then(|c| c.parse::<i64>().ok()).is_none() {
            err.number = codes::FAILED_TO_POST_QUERY;
        }
        warn!(query_id = ?data.query_id, error = %err, "query failed");
        session.report_error(&err).await;
        return Err(err.into());
    }
    session.absorb(&data);
    Ok(data)
}

/// Runs `work` until it finishes, the request deadline passes or the request is cancelled.
///
/// The last two abort the statement on the server before returning.
async fn cancellable<T, F>(
    session: &SessionInner,
    request: &QueryRequest,
    request_id: Uuid,
    work: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let deadline = async {
        match request.timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };
    let cancelled = async {
        match &request.cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        result = work => result,
        _ = deadline => {
            abort(session, &request_id).await;
            Err(Error::DeadlineExceeded)
        }
        _ = cancelled => {
            abort(session, &request_id).await;
            Err(Error::Cancelled)
        }
    }
}

/// Best-effort abort of the statement submitted under `request_id`.
async fn abort(session: &SessionInner, request_id: &Uuid) {
    match send_abort(session, request_id).await {
        Ok(()) => info!(%request_id, "query aborted"),
        Err(err) => warn!(%request_id, error = %err, "failed to abort query"),
    }
}

async fn send_abort(session: &SessionInner, request_id: &Uuid) -> Result<()> {
    let body = serde_json::to_vec(&json!({
        "sqlText": "",
        "requestId": request_id.to_string(),
    }))?;
    let mut renewed = false;
    loop {
        let token = session.tokens.session_token();
        let url = with_request_ids(session.url(ABORT_REQUEST_PATH)?, &Uuid::new_v4());
        let response: SnowflakeResponse<Value> = session
            .request(
                Method::POST,
                url,
                JSON_CONTENT,
                Some(&body),
                &session.retry_policy(),
                codes::FAILED_TO_CANCEL_QUERY,
            )
            .await?;
        if response.is_session_expired() && !renewed {
            session.renew_expired(&token).await?;
            renewed = true;
            continue;
        }
        if response.success || response.code.as_deref() == Some(QUERY_NOT_EXECUTING_CODE) {
            return Ok(());
        }
        return Err(response.to_error(codes::FAILED_TO_CANCEL_QUERY).into());
    }
}

/// Builds the ordered chunk reader for one finished result.
pub(crate) fn result_set(
    session: &Arc<SessionInner>,
    mut data: ExecResponseData,
    options: ResultOptions,
) -> Result<ChunkDownloader> {
    let query_id = data.query_id.clone().unwrap_or_default();
    let format = if data.is_arrow() {
        ChunkFormat::Arrow
    } else {
        ChunkFormat::Json
    };
    if options.raw_batches.is_some() && format == ChunkFormat::Json {
        return Err(SnowflakeError::new(
            codes::NON_ARROW_RESPONSE_IN_ARROW_BATCHES,
            sql_state::FEATURE_NOT_SUPPORTED,
            "arrow batches were requested but the result is not in arrow format",
        )
        .with_query_id(Some(query_id))
        .into());
    }
    let schema = session.row_schema(&data, options.high_precision);
    let decoder = ChunkDecoder::new(format, schema, options.custom_json_decoder, options.raw_batches);
    let initial = decoder.initial(data.row_set.take(), data.row_set_base64.as_deref())?;
    let fetcher = HttpChunkFetcher::new(
        Arc::clone(session),
        data.chunk_headers.as_ref(),
        data.qrmk.as_deref(),
    )?;
    Ok(ChunkDownloader::start(
        Arc::new(fetcher),
        decoder,
        std::mem::take(&mut data.chunks),
        initial,
        options.max_workers,
        query_id,
    ))
}

fn transfer_schema(session: &SessionInner, output: &TransferOutput) -> Arc<RowSchema> {
    let columns = output
        .columns
        .iter()
        .enumerate()
        .map(|(index, name)| SnowflakeColumn {
            name: name.clone(),
            index,
            column_type: SnowflakeColumnType::new("text", true),
        })
        .collect();
    Arc::new(RowSchema::new(columns, session.time_offset(), false))
}

fn transfer_result_set(
    session: &Arc<SessionInner>,
    query_id: String,
    output: TransferOutput,
    options: ResultOptions,
) -> Result<ChunkDownloader> {
    let decoder = ChunkDecoder::new(
        ChunkFormat::Json,
        transfer_schema(session, &output),
        options.custom_json_decoder,
        None,
    );
    let initial = decoder.from_json_rows(output.rows);
    let fetcher = HttpChunkFetcher::new(Arc::clone(session), None, None)?;
    Ok(ChunkDownloader::start(
        Arc::new(fetcher),
        decoder,
        Vec::new(),
        initial,
        options.max_workers,
        query_id,
    ))
}

async fn result_sets(
    session: &Arc<SessionInner>,
    submitted: Submitted,
    expiry_cap: Option<u32>,
    options: ResultOptions,
) -> Result<ResultSets> {
    let data = match submitted {
        Submitted::Done(data) => data,
        Submitted::Pending { result_url, .. } => {
            await_result(session, &result_url, expiry_cap).await?
        }
        Submitted::Transfer { query_id, output } => {
            let current = transfer_result_set(session, query_id, output, options)?;
            return Ok(ResultSets::single(Arc::clone(session), current, options));
        }
    };
    ResultSets::from_response(session, data, options).await
}

async fn affected_rows(
    session: &Arc<SessionInner>,
    submitted: Submitted,
    expiry_cap: Option<u32>,
) -> Result<i64> {
    let data = match submitted {
        Submitted::Done(data) => data,
        Submitted::Pending { result_url, .. } => {
            await_result(session, &result_url, expiry_cap).await?
        }
        Submitted::Transfer { .. } => return Ok(0),
    };
    if data.is_multi_statement() {
        multi_statement::affected_rows(session, &data).await
    } else {
        dml_affected_rows(session, data).await
    }
}

/// Sum of the counters in the first row of a DML result; zero for anything else.
async fn dml_affected_rows(session: &Arc<SessionInner>, data: ExecResponseData) -> Result<i64> {
    if !data.is_dml() {
        return Ok(0);
    }
    let mut rows = result_set(session, data, ResultOptions::defaults(session))?;
    let Some(row) = rows.next_row().await? else {
        return Ok(0);
    };
    rows.close();
    Ok((0..row.len())
        .filter_map(|i| row.get_at::<i64>(i).ok())
        .sum())
}

fn request_id(request: &QueryRequest) -> Uuid {
    request.request_id.unwrap_or_else(Uuid::new_v4)
}

pub(crate) async fn query(session: &Arc<SessionInner>, request: QueryRequest) -> Result<SnowflakeRows> {
    let request_id = request_id(&request);
    let options = ResultOptions::new(session, &request);
    cancellable(session, &request, request_id, async {
        let submitted = submit(session, &request, request_id, false).await?;
        let query_id = submitted.query_id();
        let sets = result_sets(session, submitted, None, options).await?;
        Ok(SnowflakeRows::ready(query_id, sets))
    })
    .await
}

pub(crate) async fn exec(session: &Arc<SessionInner>, request: QueryRequest) -> Result<SnowflakeResult> {
    let request_id = request_id(&request);
    cancellable(session, &request, request_id, async {
        let submitted = submit(session, &request, request_id, false).await?;
        let query_id = submitted.query_id();
        let affected = affected_rows(session, submitted, None).await?;
        Ok(SnowflakeResult::ready(query_id, affected))
    })
    .await
}

/// Submits in async mode and finishes the work on a background task.
///
/// The returned receiver is completed exactly once, with the result or the first error.
async fn submit_async<T, F, Fut>(
    session: &Arc<SessionInner>,
    request: QueryRequest,
    complete: F,
) -> Result<(String, oneshot::Receiver<std::result::Result<T, SnowflakeError>>)>
where
    T: Send + 'static,
    F: FnOnce(Arc<SessionInner>, Submitted) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send,
{
    let request_id = request_id(&request);
    let submitted =
        cancellable(session, &request, request_id, submit(session, &request, request_id, true))
            .await?;
    let query_id = submitted.query_id();

    let (tx, rx) = oneshot::channel();
    let session = Arc::clone(session);
    let task_query_id = query_id.clone();
    tokio::spawn(async move {
        let work = complete(Arc::clone(&session), submitted);
        let result = cancellable(&session, &request, request_id, work)
            .await
            .map_err(|err| {
                err.into_snowflake_error(codes::ASYNC)
                    .with_query_id(Some(task_query_id.clone()))
            });
        if let Err(err) = &result {
            debug!(query_id = %task_query_id, error = %err, "async query failed");
        }
        let _ = tx.send(result);
    });
    Ok((query_id, rx))
}

pub(crate) async fn query_async(
    session: &Arc<SessionInner>,
    request: QueryRequest,
) -> Result<SnowflakeRows> {
    let options = ResultOptions::new(session, &request);
    let (query_id, rx) = submit_async(session, request, move |session, submitted| async move {
        result_sets(&session, submitted, Some(ASYNC_EXPIRY_CAP), options).await
    })
    .await?;
    Ok(SnowflakeRows::pending(query_id, rx))
}

pub(crate) async fn exec_async(
    session: &Arc<SessionInner>,
    request: QueryRequest,
) -> Result<SnowflakeResult> {
    let (query_id, rx) = submit_async(session, request, |session, submitted| async move {
        affected_rows(&session, submitted, Some(ASYNC_EXPIRY_CAP)).await
    })
    .await?;
    Ok(SnowflakeResult::pending(query_id, rx))
}

pub(crate) async fn query_stream(
    session: &Arc<SessionInner>,
    request: QueryRequest,
) -> Result<SnowflakeRowStream> {
    let request_id = request_id(&request);
    let options = ResultOptions::new(session, &request);
    cancellable(session, &request, request_id, async {
        let mut data = match submit(session, &request, request_id, false).await? {
            Submitted::Done(data) => data,
            Submitted::Pending { result_url, .. } => await_result(session, &result_url, None).await?,
            Submitted::Transfer { query_id, output } => {
                let decoder = ChunkDecoder::new(
                    ChunkFormat::Json,
                    transfer_schema(session, &output),
                    options.custom_json_decoder,
                    None,
                );
                let initial = decoder.from_json_rows(output.rows);
                let fetcher = HttpChunkFetcher::new(Arc::clone(session), None, None)?;
                return Ok(SnowflakeRowStream::start(
                    Arc::new(fetcher),
                    decoder,
                    initial,
                    Vec::new(),
                    query_id,
                ));
            }
        };
        if data.is_multi_statement() {
            let first = multi_statement::child_results(&data)?.remove(0);
            data = fetch_result(session, &result_path(&first.query_id)).await?;
        }
        let query_id = data.query_id.clone().unwrap_or_default();
        if data.is_arrow() {
            return Err(SnowflakeError::new(
                codes::ARROW_RESPONSE_IN_STREAM,
                sql_state::FEATURE_NOT_SUPPORTED,
                "arrow results cannot be streamed",
            )
            .with_query_id(Some(query_id))
            .into());
        }
        let schema = session.row_schema(&data, options.high_precision);
        let decoder = ChunkDecoder::new(ChunkFormat::Json, schema, options.custom_json_decoder, None);
        let initial = decoder.initial(data.row_set.take(), None)?;
        let fetcher = HttpChunkFetcher::new(
            Arc::clone(session),
            data.chunk_headers.as_ref(),
            data.qrmk.as_deref(),
        )?;
        Ok(SnowflakeRowStream::start(
            Arc::new(fetcher),
            decoder,
            initial,
            std::mem::take(&mut data.chunks),
            query_id,
        ))
    })
    .await
}

pub(crate) fn validate_query_id(query_id: &str) -> Result<()> {
    Uuid::parse_str(query_id).map_err(|_| {
        SnowflakeError::new(
            codes::QUERY_ID_FORMAT,
            sql_state::GENERAL_ERROR,
            "invalid query id: {}",
        )
        .with_args([query_id])
    })?;
    Ok(())
}

pub(crate) async fn fetch_result_by_id(
    session: &Arc<SessionInner>,
    query_id: &str,
) -> Result<SnowflakeRows> {
    session.ensure_open()?;
    validate_query_id(query_id)?;
    let options = ResultOptions::defaults(session);
    let data = fetch_result(session, &result_path(query_id)).await?;
    let sets = ResultSets::from_response(session, data, options).await?;
    Ok(SnowflakeRows::ready(query_id.to_string(), sets))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_file_transfer_statements() {
        assert!(is_file_transfer("PUT file:///tmp/a @~"));
        assert!(is_file_transfer("  get @~/a file:///tmp"));
        assert!(is_file_transfer("-- upload\n/* data */ put file:///tmp/a @~"));
        assert!(!is_file_transfer("SELECT 'put'"));
        assert!(!is_file_transfer("putative"));
        assert!(!is_file_transfer("-- put only a comment"));
    }

    #[test]
    fn inline_bindings_are_numbered_from_one() {
        let bindings = vec![
            Binding::fixed(1),
            Binding::text("a"),
            Binding::null("TEXT"),
            Binding::array("FIXED", vec![Some("1".into()), None]),
        ];
        let value = inline_bindings(&bindings).unwrap();
        assert_eq!(value["1"], json!({"type": "FIXED", "value": "1"}));
        assert_eq!(value["2"], json!({"type": "TEXT", "value": "a"}));
        assert_eq!(value["3"], json!({"type": "TEXT", "value": null}));
        assert_eq!(value["4"], json!({"type": "FIXED", "value": ["1", null]}));
        assert_eq!(array_bind_value_count(&bindings), 2);
    }

    #[test]
    fn query_ids_must_be_uuids() {
        assert!(validate_query_id("01b2c3d4-0000-1234-0000-000100020003").is_ok());
        let Err(Error::Snowflake(err)) = validate_query_id("not-a-query") else {
            panic!("expected a format error");
        };
        assert_eq!(err.number, codes::QUERY_ID_FORMAT);
    }

    #[test]
    fn request_options_shape_results() {
        let request = QueryRequest::new("select 1")
            .with_arrow_batches()
            .with_timestamp_resolution(TimestampResolution::Millisecond);
        assert_eq!(request.timestamp_resolution, TimestampResolution::Millisecond);
        assert!(request.arrow_batches);
        let cloned = QueryRequest::from(&request);
        assert_eq!(cloned.sql_text, "select 1");
    }
}
