use std::fmt;
use std::string::FromUtf8Error;

use arrow_schema::ArrowError;
use reqwest::header::{InvalidHeaderName, InvalidHeaderValue};
use tokio::task::JoinError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("communication error: {0}")]
    Communication(String),

    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),

    #[error("invalid header name: {0}")]
    InvalidHeaderName(#[from] InvalidHeaderName),

    #[error("http error: {0}")]
    Http(#[from] http::Error),

    #[error("url error: {0}")]
    Url(String),

    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("session expired")]
    SessionExpired,

    #[error("{0}")]
    Snowflake(#[from] SnowflakeError),

    #[error("corrupt chunk: {0}")]
    CorruptChunk(String),

    #[error("chunk download error: {0}")]
    ChunkDownload(String),

    #[error("io error: {0}")]
    IO(#[from] std::io::Error),

    #[error("json error: {0}, body: {1}")]
    Json(serde_json::Error, String),

    #[error("json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("utf-8 error: {0}")]
    Utf8Error(#[from] FromUtf8Error),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("timestamp is out of range for nanosecond precision: {0}")]
    TooHighTimestampPrecision(String),

    #[error("async query response doesn't contain a polling url")]
    NoPollingUrlAsyncQuery,

    #[error(
        "request timed out after {attempts} attempt(s), last status: {}",
        .last_status.map_or_else(|| "none".to_string(), |s| s.to_string())
    )]
    TimedOut {
        attempts: u32,
        last_status: Option<u16>,
    },

    #[error("query was cancelled")]
    Cancelled,

    #[error("query deadline exceeded")]
    DeadlineExceeded,

    #[error("future join error: {0}")]
    FutureJoin(#[from] JoinError),

    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("pkcs8 error: {0}")]
    Pkcs8(#[from] pkcs8::Error),

    #[error("public key error: {0}")]
    Spki(#[from] pkcs8::spki::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Converts into a cloneable [`SnowflakeError`], keeping server errors as-is and wrapping
    /// everything else under `fallback_number`.
    pub(crate) fn into_snowflake_error(self, fallback_number: i64) -> SnowflakeError {
        match self {
            Error::Snowflake(err) => err,
            other => SnowflakeError::new(fallback_number, sql_state::GENERAL_ERROR, other.to_string()),
        }
    }

    pub fn is_session_expired(&self) -> bool {
        match self {
            Error::SessionExpired => true,
            Error::Snowflake(err) => err.number == codes::SESSION_EXPIRED,
            _ => false,
        }
    }
}

/// A structured error carrying a Snowflake error number and SQL state.
///
/// Errors reported by the server keep the server's number verbatim; errors raised by the
/// driver itself use the numbers in [`codes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnowflakeError {
    pub number: i64,
    pub sql_state: String,
    pub message: String,
    pub message_args: Vec<String>,
    pub query_id: Option<String>,
    pub include_query_id: bool,
}

impl SnowflakeError {
    pub fn new(number: i64, sql_state: &str, message: impl Into<String>) -> Self {
        Self {
            number,
            sql_state: sql_state.to_string(),
            message: message.into(),
            message_args: Vec::new(),
            query_id: None,
            include_query_id: false,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.message_args = args.into_iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_query_id(mut self, query_id: Option<String>) -> Self {
        self.query_id = query_id;
        self
    }

    pub fn including_query_id(mut self) -> Self {
        self.include_query_id = true;
        self
    }

    /// Server error number parsed from the response `code`, falling back to a generic one.
    pub(crate) fn from_server(
        code: Option<&str>,
        sql_state: Option<&str>,
        message: Option<&str>,
        query_id: Option<&str>,
    ) -> Self {
        let number = code
            .and_then(|c| c.parse::<i64>().ok())
            .unwrap_or(codes::FAILED_TO_PARSE_RESPONSE);
        Self {
            number,
            sql_state: sql_state.unwrap_or_default().to_string(),
            message: message.unwrap_or_default().to_string(),
            message_args: Vec::new(),
            query_id: query_id.map(|q| q.to_string()),
            include_query_id: false,
        }
    }

    /// Message with `{}` placeholders filled from `message_args` in order.
    pub fn formatted_message(&self) -> String {
        if self.message_args.is_empty() {
            return self.message.clone();
        }
        let mut out = String::with_capacity(self.message.len());
        let mut args = self.message_args.iter();
        let mut rest = self.message.as_str();
        while let Some(pos) = rest.find("{}") {
            out.push_str(&rest[..pos]);
            match args.next() {
                Some(arg) => out.push_str(arg),
                None => out.push_str("{}"),
            }
            rest = &rest[pos + 2..];
        }
        out.push_str(rest);
        out
    }
}

impl fmt::Display for SnowflakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = self.formatted_message();
        let query_id = self
            .query_id
            .as_deref()
            .filter(|_| self.include_query_id);
        match (self.sql_state.is_empty(), query_id) {
            (false, Some(qid)) => write!(f, "{:06} ({}): {}: {}", self.number, self.sql_state, qid, message),
            (false, None) => write!(f, "{:06} ({}): {}", self.number, self.sql_state, message),
            (true, Some(qid)) => write!(f, "{:06}: {}: {}", self.number, qid, message),
            (true, None) => write!(f, "{:06}: {}", self.number, message),
        }
    }
}

impl std::error::Error for SnowflakeError {}

/// Driver-side error numbers, grouped by range.
pub mod codes {
    // 260000: connection / configuration
    pub const EMPTY_ACCOUNT: i64 = 260000;
    pub const EMPTY_USERNAME: i64 = 260001;
    pub const EMPTY_PASSWORD: i64 = 260002;
    pub const FAILED_TO_PARSE_HOST: i64 = 260003;
    pub const FAILED_TO_PARSE_PORT: i64 = 260004;
    pub const SERVICE_UNAVAILABLE: i64 = 260007;
    pub const FAILED_TO_CONNECT: i64 = 260008;
    pub const REGION_OVERLAP: i64 = 260009;
    pub const PRIVATE_KEY_PARSE_ERROR: i64 = 260010;
    pub const FAILED_TO_PARSE_AUTHENTICATOR: i64 = 260011;

    // 261000: network
    pub const FAILED_TO_POST_QUERY: i64 = 261000;
    pub const FAILED_TO_RENEW_SESSION: i64 = 261001;
    pub const FAILED_TO_CANCEL_QUERY: i64 = 261002;
    pub const FAILED_TO_CLOSE_SESSION: i64 = 261003;
    pub const FAILED_TO_AUTH: i64 = 261004;
    pub const FAILED_TO_PARSE_RESPONSE: i64 = 261008;
    pub const FAILED_TO_POST_TELEMETRY: i64 = 261009;
    pub const FAILED_TO_HEARTBEAT: i64 = 261010;

    // 262000: rows
    pub const FAILED_TO_GET_CHUNK: i64 = 262000;
    pub const NON_ARROW_RESPONSE_IN_ARROW_BATCHES: i64 = 262001;
    pub const ARROW_RESPONSE_IN_STREAM: i64 = 262002;
    pub const ROWS_CLOSED: i64 = 262003;
    pub const COLUMN_INDEX_OUT_OF_RANGE: i64 = 262004;
    pub const ROWS_IN_ARROW_BATCHES: i64 = 262005;

    // 263000: transactions
    pub const NO_READ_ONLY_TRANSACTION: i64 = 263000;

    // 264000: file transfer
    pub const FILE_TRANSFER_NOT_CONFIGURED: i64 = 264000;

    // 265000: binding
    pub const BIND_SERIALIZATION: i64 = 265001;
    pub const BIND_UPLOAD: i64 = 265002;

    // 266000: async
    pub const ASYNC: i64 = 266001;

    // 267000: multi-statement
    pub const NO_RESULT_IDS: i64 = 267001;
    pub const RESULT_IDS_MISMATCH: i64 = 267002;

    // 268000: conversion
    pub const INVALID_TIMESTAMP_TZ: i64 = 268000;
    pub const INVALID_OFFSET_STR: i64 = 268001;
    pub const TOO_HIGH_TIMESTAMP_PRECISION: i64 = 268003;
    pub const UNSUPPORTED_ARROW_TYPE: i64 = 268004;

    // 269000: OCSP
    pub const OCSP_STATUS_REVOKED: i64 = 269001;

    // 279000: query status
    pub const QUERY_STATUS: i64 = 279001;
    pub const QUERY_ID_FORMAT: i64 = 279101;
    pub const QUERY_REPORTED_ERROR: i64 = 279201;
    pub const QUERY_IS_RUNNING: i64 = 279301;

    // 390000: server-authoritative
    pub const SESSION_GONE: i64 = 390111;
    pub const SESSION_EXPIRED: i64 = 390112;
    pub const ROLE_NOT_EXIST: i64 = 390189;
    pub const OBJECT_NOT_EXIST_OR_AUTHORIZED: i64 = 390201;
}

pub mod sql_state {
    pub const CONNECTION_WAS_NOT_ESTABLISHED: &str = "08001";
    pub const CONNECTION_REJECTED: &str = "08004";
    pub const CONNECTION_FAILURE: &str = "08006";
    pub const FEATURE_NOT_SUPPORTED: &str = "0A000";
    pub const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";
    pub const INVALID_DATETIME_FORMAT: &str = "22007";
    pub const GENERAL_ERROR: &str = "HY000";
}
