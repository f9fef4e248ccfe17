//! # Snowflake Driver Core
//!
//! Query lifecycle and result-set ingestion for Snowflake: statement submission with retries,
//! asynchronous and multi-statement queries, parallel chunk download, and row decoding from
//! both JSON and Arrow results.
//!
//! ```rust,no_run
//! # use snowflake_driver_core::{Result, SnowflakeAuthMethod, SnowflakeClient, SnowflakeClientConfig};
//! # async fn run() -> Result<()> {
//! let client = SnowflakeClient::new(
//!     "USERNAME",
//!     SnowflakeAuthMethod::Password("PASSWORD".to_string()),
//!     SnowflakeClientConfig {
//!         account: "ACCOUNT".to_string(),
//!         role: Some("ROLE".to_string()),
//!         warehouse: Some("WAREHOUSE".to_string()),
//!         database: Some("DATABASE".to_string()),
//!         schema: Some("SCHEMA".to_string()),
//!         ..Default::default()
//!     },
//! )?;
//! let session = client.create_session().await?;
//!
//! let mut result = session
//!     .exec("INSERT INTO example (id, value) VALUES (1, 'hello'), (2, 'world')")
//!     .await?;
//! assert_eq!(result.rows_affected().await?, 2);
//!
//! let mut rows = session.query("SELECT * FROM example ORDER BY id").await?;
//! while let Some(row) = rows.next().await? {
//!     let id: i64 = row.get("ID")?;
//!     let value: String = row.get("VALUE")?;
//!     println!("{id}: {value}");
//! }
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod chunk;
mod config;
mod error;
mod parameters;
mod query;
mod query_context;
mod retry;
mod row;
mod rows;
mod session;
mod telemetry;
mod token;
mod types;

use std::sync::Arc;

use reqwest::{Client, ClientBuilder, Proxy};
use tracing::debug;

pub use chunk::{SnowflakeRowStream, TimestampResolution};
pub use config::{Authenticator, SnowflakeClientConfig};
pub use error::{Error, Result, SnowflakeError, codes, sql_state};
pub use query::status::{QueryStatus, QueryStatusReport};
pub use query::{BindUploader, Binding, BindingValue, FileTransferAgent, QueryRequest, TransferOutput};
pub use row::{
    LogicalType, ScanType, SnowflakeColumn, SnowflakeColumnType, SnowflakeDecimal, SnowflakeDecode,
    SnowflakeRow, SnowflakeValue,
};
pub use rows::{SnowflakeArrowBatch, SnowflakeResult, SnowflakeRows};
pub use session::SnowflakeSession;
pub use token::{SessionTokens, TokenAccessor};
pub use tokio_util::sync::CancellationToken;

pub(crate) use config::SnowflakeConnectionConfig;

use auth::{get_base_url, login};
use parameters::SessionParameters;
use session::{SessionInner, SessionNames};

#[derive(Clone)]
pub struct SnowflakeClient {
    http: Client,

    username: String,
    auth: SnowflakeAuthMethod,
    config: SnowflakeClientConfig,
    connection_config: Option<SnowflakeConnectionConfig>,
    bind_uploader: Option<Arc<dyn BindUploader>>,
    file_transfer: Option<Arc<dyn FileTransferAgent>>,
}

#[derive(Clone)]
pub enum SnowflakeAuthMethod {
    Password(String),
    KeyPair {
        encrypted_pem: String,
        password: Vec<u8>,
    },
    Oauth {
        token: String,
    },
    /// Tokens of a session that is already logged in; no login request is sent.
    TokenAccessor(Arc<TokenAccessor>),
}

impl SnowflakeClient {
    pub fn new(
        username: &str,
        auth: SnowflakeAuthMethod,
        config: SnowflakeClientConfig,
    ) -> Result<Self> {
        let client = ClientBuilder::new().gzip(true).use_rustls_tls().build()?;
        Ok(Self {
            http: client,
            username: username.to_string(),
            auth,
            config,
            connection_config: None,
            bind_uploader: None,
            file_transfer: None,
        })
    }

    /// Builds a client from `user[:password]@account/database/schema?param=value`.
    pub fn from_dsn(dsn: &str) -> Result<Self> {
        let dsn = config::parse_dsn(dsn)?;
        let mut client = Self::new(&dsn.username, dsn.auth, dsn.config)?;
        client.connection_config = dsn.connection;
        Ok(client)
    }

    pub fn with_proxy(self, host: &str, port: u16, username: &str, password: &str) -> Result<Self> {
        let proxy =
            Proxy::all(format!("http://{host}:{port}").as_str())?.basic_auth(username, password);

        let client = ClientBuilder::new()
            .gzip(true)
            .use_rustls_tls()
            .proxy(proxy)
            .build()?;
        Ok(Self {
            http: client,
            ..self
        })
    }

    pub fn with_address(
        self,
        host: &str,
        port: Option<u16>,
        protocol: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            connection_config: Some(SnowflakeConnectionConfig {
                host: host.to_string(),
                port,
                protocol,
            }),
            ..self
        })
    }

    pub fn with_bind_uploader(self, uploader: Arc<dyn BindUploader>) -> Self {
        Self {
            bind_uploader: Some(uploader),
            ..self
        }
    }

    pub fn with_file_transfer_agent(self, agent: Arc<dyn FileTransferAgent>) -> Self {
        Self {
            file_transfer: Some(agent),
            ..self
        }
    }

    pub async fn create_session(&self) -> Result<SnowflakeSession> {
        let base_url = get_base_url(&self.config, self.connection_config.as_ref())?;
        let outcome = login(&self.http, &self.username, &self.auth, &self.config, &base_url).await?;

        let parameters = SessionParameters::new(&self.config.session_parameters);
        parameters.merge(&outcome.parameters);
        let info = outcome.session_info;
        let names = SessionNames {
            database: info.database_name.or_else(|| self.config.database.clone()),
            schema: info.schema_name.or_else(|| self.config.schema.clone()),
            warehouse: info.warehouse_name.or_else(|| self.config.warehouse.clone()),
            role: info.role_name.or_else(|| self.config.role.clone()),
        };
        debug!(%base_url, "creating session");

        let inner = SessionInner::new(
            self.http.clone(),
            base_url,
            self.config.clone(),
            outcome.tokens,
            parameters,
            names,
            self.bind_uploader.clone(),
            self.file_transfer.clone(),
        );
        Ok(SnowflakeSession::new(Arc::new(inner)))
    }
}
