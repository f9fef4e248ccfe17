mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::*;
use serde_json::json;
use snowflake_driver_core::{Error, Result, SnowflakeClientConfig};

const QUERY_ID: &str = "01b2c3d4-0000-1234-0000-000100020030";

#[tokio::test]
async fn test_query_retries_rewrite_the_url() -> Result<()> {
    // Arrange
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let server = MockServer::start(move |req| match req.path.as_str() {
        "/queries/v1/query-request" if counter.fetch_add(1, Ordering::SeqCst) < 2 => {
            MockResponse::status(503, "service unavailable")
        }
        "/queries/v1/query-request" => {
            success(result_data(QUERY_ID, vec![column("N", "fixed")], json!([["1"]])))
        }
        _ => MockResponse::status(404, "not found"),
    })
    .await;
    let session = server.session().await?;

    // Act
    let mut rows = session.query("SELECT 1").await?;

    // Assert
    assert_eq!(rows.fetch_all().await?.len(), 1);
    let submitted = server.requests_to("/queries/v1/query-request");
    assert_eq!(submitted.len(), 3);

    let request_ids: HashSet<_> = submitted.iter().map(|r| r.param("requestId")).collect();
    assert_eq!(request_ids.len(), 1);
    let guids: HashSet<_> = submitted.iter().map(|r| r.param("request_guid")).collect();
    assert_eq!(guids.len(), 3);

    assert_eq!(submitted[0].param("retryCount"), None);
    assert_eq!(submitted[1].param("retryCount"), Some("1"));
    assert_eq!(submitted[2].param("retryCount"), Some("2"));
    assert_eq!(submitted[2].param("retryReason"), Some("503"));
    assert_eq!(
        submitted[1].param("clientStartTime"),
        submitted[2].param("clientStartTime")
    );
    assert!(submitted[1].param("clientStartTime").is_some());

    Ok(())
}

#[tokio::test]
async fn test_zero_retries_means_one_attempt() -> Result<()> {
    // Arrange
    let server = MockServer::start(|req| match req.path.as_str() {
        "/queries/v1/query-request" => MockResponse::status(503, "service unavailable"),
        _ => MockResponse::status(404, "not found"),
    })
    .await;
    let session = server
        .client_with(SnowflakeClientConfig {
            max_retry_count: 0,
            ..Default::default()
        })
        .create_session()
        .await?;

    // Act
    let result = session.query("SELECT 1").await;

    // Assert
    assert!(matches!(
        result,
        Err(Error::TimedOut {
            attempts: 1,
            last_status: Some(503)
        })
    ));
    assert_eq!(server.requests_to("/queries/v1/query-request").len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_client_errors_are_not_retried() -> Result<()> {
    // Arrange
    let server = MockServer::start(|req| match req.path.as_str() {
        "/queries/v1/query-request" => MockResponse::status(403, "forbidden"),
        _ => MockResponse::status(404, "not found"),
    })
    .await;
    let session = server.session().await?;

    // Act
    let result = session.query("SELECT 1").await;

    // Assert
    let Err(Error::Snowflake(err)) = result else {
        panic!("expected a status error");
    };
    assert_eq!(err.formatted_message(), "HTTP status: 403, response body: forbidden");
    assert_eq!(server.requests_to("/queries/v1/query-request").len(), 1);

    Ok(())
}
