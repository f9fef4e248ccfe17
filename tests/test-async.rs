mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::*;
use serde_json::json;
use snowflake_driver_core::{Error, QueryRequest, Result};
use tokio::sync::mpsc;

const QUERY_ID: &str = "01b2c3d4-0000-1234-0000-000100020005";

fn result_path() -> String {
    format!("/queries/{QUERY_ID}/result")
}

#[tokio::test]
async fn test_async_query_resolves_in_background() -> Result<()> {
    // Arrange
    let polls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&polls);
    let server = MockServer::start(move |req| {
        if req.path == "/queries/v1/query-request" {
            return in_progress("333334", QUERY_ID);
        }
        if req.path == result_path() {
            return match counter.fetch_add(1, Ordering::SeqCst) {
                0 => in_progress("333333", QUERY_ID),
                _ => success(result_data(
                    QUERY_ID,
                    vec![column("SYSTEM$WAIT", "text")],
                    json!([["waited 1 seconds"]]),
                )),
            };
        }
        MockResponse::status(404, "not found")
    })
    .await;
    let session = server.session().await?;
    let (tx, mut query_ids) = mpsc::unbounded_channel();

    // Act
    let mut rows = session
        .query_async(QueryRequest::new("CALL SYSTEM$WAIT(1)").with_query_id_sender(tx))
        .await?;

    // Assert
    assert_eq!(rows.query_id(), QUERY_ID);
    assert_eq!(query_ids.recv().await.as_deref(), Some(QUERY_ID));
    let row = rows.next().await?.unwrap();
    assert_eq!(row.get::<String>("SYSTEM$WAIT")?, "waited 1 seconds");
    assert!(rows.next().await?.is_none());

    assert_eq!(polls.load(Ordering::SeqCst), 2);
    let submitted = server.requests_to("/queries/v1/query-request");
    assert_eq!(submitted[0].json()["asyncExec"], true);

    Ok(())
}

#[tokio::test]
async fn test_async_exec_reports_affected_rows() -> Result<()> {
    // Arrange
    let server = MockServer::start(|req| {
        if req.path == "/queries/v1/query-request" {
            return in_progress("333334", QUERY_ID);
        }
        if req.path == result_path() {
            let mut data = result_data(
                QUERY_ID,
                vec![column("number of rows inserted", "fixed")],
                json!([["3"]]),
            );
            data["statementTypeId"] = json!(0x3100);
            return success(data);
        }
        MockResponse::status(404, "not found")
    })
    .await;
    let session = server.session().await?;

    // Act
    let mut result = session.exec_async("INSERT INTO T VALUES (1), (2), (3)").await?;

    // Assert
    assert_eq!(result.query_id(), QUERY_ID);
    assert_eq!(result.rows_affected().await?, 3);
    assert_eq!(result.rows_affected().await?, 3);

    Ok(())
}

#[tokio::test]
async fn test_async_polling_renews_expired_session() -> Result<()> {
    // Arrange
    let server = MockServer::start(|req| {
        if req.path == "/queries/v1/query-request" {
            return in_progress("333334", QUERY_ID);
        }
        if req.path == result_path() {
            if req.has_token(SESSION_TOKEN) {
                return session_expired();
            }
            return success(result_data(QUERY_ID, vec![column("N", "fixed")], json!([["5"]])));
        }
        MockResponse::status(404, "not found")
    })
    .await;
    let session = server.session().await?;

    // Act
    let mut rows = session.query_async("SELECT 5").await?;

    // Assert
    assert_eq!(rows.next().await?.unwrap().get::<i64>("N")?, 5);
    assert_eq!(server.requests_to("/session/token-request").len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_async_failure_is_returned_on_every_read() -> Result<()> {
    // Arrange
    let server = MockServer::start(|req| {
        if req.path == "/queries/v1/query-request" {
            return in_progress("333334", QUERY_ID);
        }
        if req.path == result_path() {
            return MockResponse::json(json!({
                "data": {"queryId": QUERY_ID, "sqlState": "22012"},
                "code": "100051",
                "message": "Division by zero",
                "success": false
            }));
        }
        MockResponse::status(404, "not found")
    })
    .await;
    let session = server.session().await?;

    // Act
    let mut rows = session.query_async("SELECT 1/0").await?;
    let first = rows.next().await;
    let second = rows.columns().await;

    // Assert
    let Err(Error::Snowflake(first)) = first else {
        panic!("expected the server error");
    };
    assert_eq!(first.number, 100051);
    assert_eq!(first.query_id.as_deref(), Some(QUERY_ID));
    let Err(Error::Snowflake(second)) = second else {
        panic!("expected the same error again");
    };
    assert_eq!(second, first);
    assert!(rows.close().await.is_ok());

    Ok(())
}
