use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use tracing::debug;
use url::Url;

use crate::error::codes;
use crate::query::response::ChunkDescriptor;
use crate::retry::{self, RequestParts, RetryPolicy};
use crate::session::SessionInner;
use crate::types::{SESSION_EXPIRED_CODE, http_status_error};
use crate::Result;

const SSE_C_ALGORITHM: &str = "x-amz-server-side-encryption-customer-algorithm";
const SSE_C_KEY: &str = "x-amz-server-side-encryption-customer-key";
const SSE_C_AES: &str = "AES256";

/// Source of remote chunk bodies.
#[async_trait]
pub(crate) trait ChunkFetcher: Send + Sync {
    async fn fetch(&self, descriptor: &ChunkDescriptor) -> Result<Bytes>;
}

/// Fetches chunks from object storage with the headers the server asked for.
pub(crate) struct HttpChunkFetcher {
    session: Arc<SessionInner>,
    headers: HeaderMap,
    policy: RetryPolicy,
}

impl HttpChunkFetcher {
    pub(crate) fn new(
        session: Arc<SessionInner>,
        chunk_headers: Option<&HashMap<String, String>>,
        qrmk: Option<&str>,
    ) -> Result<Self> {
        let headers = chunk_request_headers(chunk_headers, qrmk)?;
        let policy = session.retry_policy();
        Ok(Self {
            session,
            headers,
            policy,
        })
    }
}

/// Server-provided chunk headers win; otherwise the result master key becomes SSE-C headers.
pub(crate) fn chunk_request_headers(
    chunk_headers: Option<&HashMap<String, String>>,
    qrmk: Option<&str>,
) -> Result<HeaderMap> {
    match chunk_headers.filter(|h| !h.is_empty()) {
        Some(chunk_headers) => Ok(HeaderMap::try_from(chunk_headers)?),
        None => {
            let mut headers = HeaderMap::new();
            if let Some(qrmk) = qrmk {
                headers.insert(
                    HeaderName::from_static(SSE_C_ALGORITHM),
                    HeaderValue::from_static(SSE_C_AES),
                );
                headers.insert(HeaderName::from_static(SSE_C_KEY), HeaderValue::from_str(qrmk)?);
            }
            Ok(headers)
        }
    }
}

#[async_trait]
impl ChunkFetcher for HttpChunkFetcher {
    async fn fetch(&self, descriptor: &ChunkDescriptor) -> Result<Bytes> {
        let token = self.session.tokens.session_token();
        let url = Url::parse(&descriptor.url)?;
        let response = retry::execute(&self.session.http, Method::GET, url, &self.policy, || {
            Ok(RequestParts::new(self.headers.clone()))
        })
        .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.bytes().await?);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED && body.contains(SESSION_EXPIRED_CODE) {
            debug!("chunk request hit an expired session, renewing");
            self.session.renew_expired(&token).await?;
        }
        Err(http_status_error(codes::FAILED_TO_GET_CHUNK, status.as_u16(), &body).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_headers_take_precedence() {
        let mut server = HashMap::new();
        server.insert("x-amz-custom".to_string(), "v".to_string());
        let headers = chunk_request_headers(Some(&server), Some("key")).unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["x-amz-custom"], "v");
    }

    #[test]
    fn qrmk_becomes_sse_c_headers() {
        let headers = chunk_request_headers(None, Some("secret")).unwrap();
        assert_eq!(headers[SSE_C_ALGORITHM], SSE_C_AES);
        assert_eq!(headers[SSE_C_KEY], "secret");
        assert!(chunk_request_headers(None, None).unwrap().is_empty());
    }
}
