#![allow(dead_code)]

use std::convert::Infallible;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HOST, HeaderMap};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use snowflake_driver_core::{
    Result, SnowflakeAuthMethod, SnowflakeClient, SnowflakeClientConfig, SnowflakeSession,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

pub const SESSION_TOKEN: &str = "session-token-1";
pub const RENEWED_TOKEN: &str = "session-token-2";
pub const MASTER_TOKEN: &str = "master-token-1";

/// A request as the mock server saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Recorded {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }

    pub fn token(&self) -> &str {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }

    pub fn has_token(&self, token: &str) -> bool {
        self.token().contains(token)
    }

    /// `http://host:port` of the mock server, for URLs handed back to the client.
    pub fn origin(&self) -> String {
        let host = self
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        format!("http://{host}")
    }
}

pub struct MockResponse {
    pub status: u16,
    pub body: Bytes,
    pub delay: Option<Duration>,
}

impl MockResponse {
    pub fn json(body: Value) -> Self {
        Self {
            status: 200,
            body: Bytes::from(body.to_string()),
            delay: None,
        }
    }

    pub fn bytes(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            body: Bytes::from(body),
            delay: None,
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self {
            status,
            body: Bytes::from(body.to_string()),
            delay: None,
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

type Handler = Arc<dyn Fn(&Recorded) -> MockResponse + Send + Sync>;

pub struct MockServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Recorded>>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl MockServer {
    /// Serves every request with `handler`, after the login and logout endpoints.
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Recorded) -> MockResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler: Handler = Arc::new(move |req: &Recorded| {
            session_endpoints(req).unwrap_or_else(|| handler(req))
        });
        let requests = Arc::new(Mutex::new(Vec::new()));
        let (shutdown, mut stopped) = oneshot::channel();

        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else {
                            continue;
                        };
                        let handler = Arc::clone(&handler);
                        let recorded = Arc::clone(&recorded);
                        tokio::spawn(async move {
                            let svc = service_fn(move |req| {
                                serve(req, Arc::clone(&handler), Arc::clone(&recorded))
                            });
                            let _ = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), svc)
                                .await;
                        });
                    }
                    _ = &mut stopped => break,
                }
            }
        });

        Self {
            addr,
            requests,
            shutdown: Some(shutdown),
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }

    pub fn client(&self) -> SnowflakeClient {
        self.client_with(SnowflakeClientConfig::default())
    }

    pub fn client_with(&self, config: SnowflakeClientConfig) -> SnowflakeClient {
        let config = SnowflakeClientConfig {
            account: "testaccount".to_string(),
            database: Some("TESTDB".to_string()),
            warehouse: Some("TESTWH".to_string()),
            retry_base_delay: Duration::from_millis(5),
            retry_max_delay: Duration::from_millis(20),
            client_timeout: Duration::from_secs(10),
            ..config
        };
        SnowflakeClient::new(
            "tester",
            SnowflakeAuthMethod::Password("secret".to_string()),
            config,
        )
        .unwrap()
        .with_address(
            &self.addr.ip().to_string(),
            Some(self.addr.port()),
            Some("http".to_string()),
        )
        .unwrap()
    }

    pub async fn session(&self) -> Result<SnowflakeSession> {
        self.client().create_session().await
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn serve(
    req: Request<Incoming>,
    handler: Handler,
    recorded: Arc<Mutex<Vec<Recorded>>>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map(|b| b.to_bytes())
        .unwrap_or_default();
    let query = url::form_urlencoded::parse(parts.uri.query().unwrap_or_default().as_bytes())
        .into_owned()
        .collect();
    let request = Recorded {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query,
        headers: parts.headers,
        body,
    };
    recorded.lock().unwrap().push(request.clone());

    let response = handler(&request);
    if let Some(delay) = response.delay {
        tokio::time::sleep(delay).await;
    }
    Ok(Response::builder()
        .status(response.status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(response.body))
        .unwrap())
}

fn session_endpoints(req: &Recorded) -> Option<MockResponse> {
    match req.path.as_str() {
        "/session/v1/login-request" => Some(MockResponse::json(json!({
            "data": {
                "token": SESSION_TOKEN,
                "masterToken": MASTER_TOKEN,
                "sessionId": 4242,
                "parameters": [{"name": "TIMEZONE", "value": "UTC"}],
                "sessionInfo": {"databaseName": "TESTDB", "warehouseName": "TESTWH"}
            },
            "success": true
        }))),
        "/session/token-request" => Some(MockResponse::json(json!({
            "data": {"sessionToken": RENEWED_TOKEN, "masterToken": MASTER_TOKEN},
            "success": true
        }))),
        "/session" => Some(success(Value::Null)),
        "/telemetry/send" => Some(success(Value::Null)),
        _ => None,
    }
}

pub fn success(data: Value) -> MockResponse {
    MockResponse::json(json!({
        "data": data,
        "code": null,
        "message": null,
        "success": true
    }))
}

pub fn failure(code: &str, message: &str) -> MockResponse {
    MockResponse::json(json!({
        "data": null,
        "code": code,
        "message": message,
        "success": false
    }))
}

pub fn session_expired() -> MockResponse {
    failure("390112", "Session token expired")
}

pub fn in_progress(code: &str, query_id: &str) -> MockResponse {
    MockResponse::json(json!({
        "data": {
            "queryId": query_id,
            "getResultUrl": format!("/queries/{query_id}/result")
        },
        "code": code,
        "message": "query in progress",
        "success": false
    }))
}

pub fn column(name: &str, data_type: &str) -> Value {
    json!({"name": name, "type": data_type, "nullable": true, "precision": 38, "scale": 0})
}

/// `data` of a finished JSON result with the given inline rows.
pub fn result_data(query_id: &str, columns: Vec<Value>, rows: Value) -> Value {
    json!({
        "queryId": query_id,
        "rowtype": columns,
        "rowset": rows,
        "queryResultFormat": "json",
        "statementTypeId": 4096
    })
}

/// A remote chunk body: rows without the surrounding brackets, gzip-compressed.
pub fn gzip_chunk(rows: &[Value]) -> Vec<u8> {
    let body = rows
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join(",");
    gzip(&body)
}

pub fn gzip(body: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body.as_bytes()).unwrap();
    encoder.finish().unwrap()
}
