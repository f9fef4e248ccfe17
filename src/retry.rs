//! Retrying HTTP executor shared by every server interaction.
//!
//! Each attempt re-invokes the caller's request generator so that headers depending on the
//! current session token (or a freshly generated JWT) are rebuilt after a renewal. Retries
//! rewrite the URL query string the way the server expects: a fresh `request_guid` always,
//! plus `retryCount`, `retryReason` and `clientStartTime` on query submissions.

use std::time::{Duration, Instant};

use chrono::Utc;
use http::HeaderMap;
use rand::Rng;
use reqwest::{Client, Method, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::{Error, Result, SnowflakeClientConfig};

pub(crate) const REQUEST_ID_KEY: &str = "requestId";
pub(crate) const REQUEST_GUID_KEY: &str = "request_guid";
pub(crate) const RETRY_COUNT_KEY: &str = "retryCount";
pub(crate) const RETRY_REASON_KEY: &str = "retryReason";
pub(crate) const CLIENT_START_TIME_KEY: &str = "clientStartTime";

pub(crate) const QUERY_REQUEST_PATH: &str = "/queries/v1/query-request";
const AUTH_REQUEST_PATHS: [&str; 3] = [
    "/session/v1/login-request",
    "/session/token-request",
    "/session/authenticator-request",
];

pub(crate) const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(16);

/// Headers and body for a single attempt.
pub(crate) struct RequestParts {
    pub(crate) headers: HeaderMap,
    pub(crate) body: Option<Vec<u8>>,
}

impl RequestParts {
    pub(crate) fn new(headers: HeaderMap) -> Self {
        Self {
            headers,
            body: None,
        }
    }

    pub(crate) fn json<T: Serialize + ?Sized>(headers: HeaderMap, body: &T) -> Result<Self> {
        Ok(Self {
            headers,
            body: Some(serde_json::to_vec(body)?),
        })
    }
}

#[derive(Clone, Debug)]
pub(crate) struct RetryPolicy {
    pub(crate) max_retry_count: u32,
    /// Bound on the whole call, sleeps included. `None` means only `max_retry_count` applies.
    pub(crate) total_timeout: Option<Duration>,
    pub(crate) attempt_timeout: Option<Duration>,
    pub(crate) include_retry_reason: bool,
    pub(crate) base_delay: Duration,
    pub(crate) max_delay: Duration,
    /// Wall clock in epoch milliseconds, used for `clientStartTime`.
    pub(crate) clock: fn() -> i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_count: 7,
            total_timeout: None,
            attempt_timeout: None,
            include_retry_reason: true,
            base_delay: DEFAULT_RETRY_BASE_DELAY,
            max_delay: DEFAULT_RETRY_MAX_DELAY,
            clock: epoch_millis,
        }
    }
}

impl From<&SnowflakeClientConfig> for RetryPolicy {
    fn from(config: &SnowflakeClientConfig) -> Self {
        Self {
            max_retry_count: config.max_retry_count,
            attempt_timeout: Some(config.client_timeout),
            include_retry_reason: config.include_retry_reason,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
            ..Default::default()
        }
    }
}

impl RetryPolicy {
    pub(crate) fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub(crate) fn with_total_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.total_timeout = timeout;
        self
    }
}

pub(crate) fn epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Sends a request, retrying transport failures and 408/429/5xx responses.
///
/// Any other response is returned untouched, including failures the caller must inspect.
pub(crate) async fn execute<F>(
    http: &Client,
    method: Method,
    url: Url,
    policy: &RetryPolicy,
    make_request: F,
) -> Result<Response>
where
    F: Fn() -> Result<RequestParts>,
{
    let started = Instant::now();
    let client_start_time = (policy.clock)();
    let mut backoff = Backoff::for_url(&url, policy.base_delay, policy.max_delay);
    let mut url = url;
    let mut retry_count: u32 = 0;
    let mut last_status: Option<u16> = None;

    loop {
        let parts = make_request()?;
        let mut builder = http
            .request(method.clone(), url.clone())
            .headers(parts.headers);
        if let Some(body) = parts.body {
            builder = builder.body(body);
        }
        if let Some(timeout) = attempt_timeout(policy, started.elapsed()) {
            builder = builder.timeout(timeout);
        }

        match builder.send().await {
            Ok(response) if !is_retryable_status(response.status()) => return Ok(response),
            Ok(response) => {
                let status = response.status().as_u16();
                warn!(path = url.path(), status, retry_count, "retryable response status");
                last_status = Some(status);
            }
            Err(err) if err.is_builder() => return Err(err.into()),
            Err(err) => {
                warn!(path = url.path(), error = %err, retry_count, "transport error");
            }
        }

        if retry_count >= policy.max_retry_count {
            return Err(Error::TimedOut {
                attempts: retry_count + 1,
                last_status,
            });
        }
        let sleep = backoff.next_delay(retry_count + 1);
        if let Some(total) = policy.total_timeout {
            if started.elapsed() + sleep >= total {
                return Err(Error::TimedOut {
                    attempts: retry_count + 1,
                    last_status,
                });
            }
        }
        debug!(path = url.path(), ?sleep, "sleeping before retry");
        tokio::time::sleep(sleep).await;

        retry_count += 1;
        url = retry_url(
            &url,
            retry_count,
            last_status,
            client_start_time,
            policy.include_retry_reason,
        );
    }
}

fn attempt_timeout(policy: &RetryPolicy, elapsed: Duration) -> Option<Duration> {
    let remaining = policy
        .total_timeout
        .map(|total| total.saturating_sub(elapsed));
    match (policy.attempt_timeout, remaining) {
        (Some(a), Some(r)) => Some(a.min(r)),
        (a, r) => a.or(r),
    }
}

pub(crate) fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

pub(crate) fn is_query_request(url: &Url) -> bool {
    url.path().ends_with(QUERY_REQUEST_PATH)
}

fn is_auth_request(url: &Url) -> bool {
    AUTH_REQUEST_PATHS
        .iter()
        .any(|path| url.path().ends_with(path))
}

/// Appends `requestId` and a fresh `request_guid` to an endpoint URL.
pub(crate) fn with_request_ids(mut url: Url, request_id: &Uuid) -> Url {
    url.query_pairs_mut()
        .append_pair(REQUEST_ID_KEY, &request_id.to_string())
        .append_pair(REQUEST_GUID_KEY, &Uuid::new_v4().to_string());
    url
}

/// Replaces any `request_guid` with a fresh one, leaving the rest of the query untouched.
pub(crate) fn with_request_guid(url: &Url) -> Url {
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .into_owned()
        .filter(|(k, _)| k != REQUEST_GUID_KEY)
        .collect();
    let mut next = url.clone();
    next.query_pairs_mut()
        .clear()
        .extend_pairs(pairs)
        .append_pair(REQUEST_GUID_KEY, &Uuid::new_v4().to_string());
    next
}

/// Rewrites the query string for the next attempt.
pub(crate) fn retry_url(
    url: &Url,
    retry_count: u32,
    retry_reason: Option<u16>,
    client_start_time: i64,
    include_retry_reason: bool,
) -> Url {
    let is_query = is_query_request(url);
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .into_owned()
        .filter(|(k, _)| {
            k != REQUEST_GUID_KEY && !(is_query && (k == RETRY_COUNT_KEY || k == RETRY_REASON_KEY))
        })
        .collect();
    let has_start_time = pairs.iter().any(|(k, _)| k == CLIENT_START_TIME_KEY);

    pairs.push((REQUEST_GUID_KEY.to_string(), Uuid::new_v4().to_string()));
    if is_query {
        pairs.push((RETRY_COUNT_KEY.to_string(), retry_count.to_string()));
        if include_retry_reason {
            pairs.push((
                RETRY_REASON_KEY.to_string(),
                retry_reason.unwrap_or(0).to_string(),
            ));
        }
        if !has_start_time {
            pairs.push((
                CLIENT_START_TIME_KEY.to_string(),
                client_start_time.to_string(),
            ));
        }
    }

    let mut next = url.clone();
    next.query_pairs_mut().clear().extend_pairs(pairs);
    next
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BackoffKind {
    /// Auth endpoints: widening window around `2^attempt`.
    AttemptBased,
    Decorrelated,
}

#[derive(Debug)]
pub(crate) struct Backoff {
    kind: BackoffKind,
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    fn for_url(url: &Url, base: Duration, cap: Duration) -> Self {
        let kind = if is_auth_request(url) {
            BackoffKind::AttemptBased
        } else {
            BackoffKind::Decorrelated
        };
        Self {
            kind,
            base,
            cap,
            current: base,
        }
    }

    pub(crate) fn next_delay(&mut self, attempt: u32) -> Duration {
        let mut rng = rand::rng();
        let next = match self.kind {
            BackoffKind::Decorrelated => {
                let upper = self.current.mul_f64(3.0);
                if upper <= self.base {
                    self.base
                } else {
                    let span = (upper - self.base).as_secs_f64();
                    (self.base + Duration::from_secs_f64(span * rng.random::<f64>())).min(self.cap)
                }
            }
            BackoffKind::AttemptBased => {
                // Everything is measured in units of `base` (seconds with the default base).
                let unit = self.base.as_secs_f64();
                let cur = self.current.as_secs_f64() / unit;
                let jitter = 0.5 * cur * (rng.random::<f64>() * 2.0 - 1.0);
                let low = cur + jitter;
                let high = 2f64.powi(attempt.min(30) as i32) + jitter;
                let picked = low + (high - low) * rng.random::<f64>();
                Duration::from_secs_f64((picked * unit).max(0.0))
            }
        };
        self.current = next;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_url() -> Url {
        Url::parse("https://acct.snowflakecomputing.com/queries/v1/query-request?requestId=abc&request_guid=g0")
            .unwrap()
    }

    fn value(url: &Url, key: &str) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn retry_url_sets_query_retry_params() {
        let url = retry_url(&query_url(), 1, Some(503), 1_700_000_000_000, true);
        assert_eq!(value(&url, REQUEST_ID_KEY).as_deref(), Some("abc"));
        assert_ne!(value(&url, REQUEST_GUID_KEY).as_deref(), Some("g0"));
        assert_eq!(value(&url, RETRY_COUNT_KEY).as_deref(), Some("1"));
        assert_eq!(value(&url, RETRY_REASON_KEY).as_deref(), Some("503"));
        assert_eq!(
            value(&url, CLIENT_START_TIME_KEY).as_deref(),
            Some("1700000000000")
        );

        let again = retry_url(&url, 2, None, 42, true);
        assert_eq!(value(&again, RETRY_COUNT_KEY).as_deref(), Some("2"));
        assert_eq!(value(&again, RETRY_REASON_KEY).as_deref(), Some("0"));
        // preserved from the first retry
        assert_eq!(
            value(&again, CLIENT_START_TIME_KEY).as_deref(),
            Some("1700000000000")
        );
        assert_eq!(
            again
                .query_pairs()
                .filter(|(k, _)| k == RETRY_COUNT_KEY)
                .count(),
            1
        );
    }

    #[test]
    fn retry_reason_suppressed_when_disabled() {
        let url = retry_url(&query_url(), 1, Some(500), 1, false);
        assert_eq!(value(&url, RETRY_REASON_KEY), None);
        assert_eq!(value(&url, RETRY_COUNT_KEY).as_deref(), Some("1"));
    }

    #[test]
    fn non_query_urls_only_get_a_new_guid() {
        let url = Url::parse("https://acct.snowflakecomputing.com/session/heartbeat?request_guid=g0")
            .unwrap();
        let next = retry_url(&url, 3, Some(500), 1, true);
        assert_ne!(value(&next, REQUEST_GUID_KEY).as_deref(), Some("g0"));
        assert_eq!(value(&next, RETRY_COUNT_KEY), None);
        assert_eq!(value(&next, RETRY_REASON_KEY), None);
        assert_eq!(value(&next, CLIENT_START_TIME_KEY), None);
    }

    #[test]
    fn request_guid_is_replaced() {
        let url = with_request_guid(&query_url());
        assert_eq!(value(&url, REQUEST_ID_KEY).as_deref(), Some("abc"));
        assert_ne!(value(&url, REQUEST_GUID_KEY).as_deref(), Some("g0"));
        assert_eq!(url.query_pairs().filter(|(k, _)| k == REQUEST_GUID_KEY).count(), 1);
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::OK));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn decorrelated_backoff_stays_within_base_and_cap() {
        let url = query_url();
        let mut backoff = Backoff::for_url(&url, Duration::from_secs(1), Duration::from_secs(16));
        assert_eq!(backoff.kind, BackoffKind::Decorrelated);
        for attempt in 1..50 {
            let delay = backoff.next_delay(attempt);
            assert!(delay >= Duration::from_secs(1), "{delay:?}");
            assert!(delay <= Duration::from_secs(16), "{delay:?}");
        }
    }

    #[test]
    fn auth_endpoints_use_attempt_based_backoff() {
        let url = Url::parse("https://acct.snowflakecomputing.com/session/token-request").unwrap();
        let mut backoff = Backoff::for_url(&url, Duration::from_secs(1), Duration::from_secs(16));
        assert_eq!(backoff.kind, BackoffKind::AttemptBased);
        for attempt in 1..6 {
            let delay = backoff.next_delay(attempt);
            // window upper bound is 2^attempt plus at most half of the previous delay
            assert!(delay.as_secs_f64() <= 2f64.powi(attempt as i32) * 2.0 + 1.0);
        }
    }

    #[test]
    fn attempt_timeout_respects_remaining_total() {
        let policy = RetryPolicy {
            total_timeout: Some(Duration::from_secs(10)),
            attempt_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        assert_eq!(
            attempt_timeout(&policy, Duration::from_secs(4)),
            Some(Duration::from_secs(6))
        );
        let unlimited = RetryPolicy::default();
        assert_eq!(attempt_timeout(&unlimited, Duration::from_secs(4)), None);
    }
}
