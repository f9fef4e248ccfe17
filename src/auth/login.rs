use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use http::HeaderMap;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderValue, USER_AGENT};
use reqwest::{Client, Method, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{codes, sql_state};
use crate::retry::{self, RequestParts, RetryPolicy, with_request_ids};
use crate::token::TokenAccessor;
use crate::types::{
    JSON_CONTENT, NameValueParameter, SnowflakeResponse, parse_body, read_success_body,
};
use crate::{
    Error, Result, SnowflakeAuthMethod, SnowflakeClientConfig, SnowflakeConnectionConfig,
    SnowflakeError,
};

use super::client::{client_app_id, client_app_version, client_environment, user_agent};
use super::key_pair::generate_jwt_from_key_pair;

pub(crate) const LOGIN_REQUEST_PATH: &str = "session/v1/login-request";

pub(crate) fn get_base_url(
    config: &SnowflakeClientConfig,
    connection_config: Option<&SnowflakeConnectionConfig>,
) -> Result<Url> {
    if let Some(connection_config) = connection_config {
        let host = &connection_config.host;
        let protocol = connection_config.protocol.as_deref().unwrap_or("https");
        let mut url = Url::parse(&format!("{protocol}://{host}"))?;
        if let Some(port) = connection_config.port {
            url.set_port(Some(port))
                .map_err(|_| Error::Url("invalid base url port".to_string()))?;
        }
        return Ok(url);
    }
    if config.account.is_empty() {
        return Err(SnowflakeError::new(
            codes::EMPTY_ACCOUNT,
            sql_state::CONNECTION_WAS_NOT_ESTABLISHED,
            "account is empty",
        )
        .into());
    }
    let host = match config.region.as_deref() {
        Some(region) if region.starts_with("cn-") => {
            format!("{}.{region}.snowflakecomputing.cn", config.account)
        }
        Some(region) if !region.is_empty() && region != "us-west-2" => {
            format!("{}.{region}.snowflakecomputing.com", config.account)
        }
        _ => format!("{}.snowflakecomputing.com", config.account),
    };
    Ok(Url::parse(&format!("https://{host}"))?)
}

/// What a successful login hands to the new session.
pub(crate) struct LoginOutcome {
    pub(crate) tokens: Arc<TokenAccessor>,
    pub(crate) parameters: Vec<NameValueParameter>,
    pub(crate) session_info: SessionInfo,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionInfo {
    pub(crate) database_name: Option<String>,
    pub(crate) schema_name: Option<String>,
    pub(crate) warehouse_name: Option<String>,
    pub(crate) role_name: Option<String>,
}

/// Login to Snowflake and return the session token triple.
pub(crate) async fn login(
    http: &Client,
    username: &str,
    auth: &SnowflakeAuthMethod,
    config: &SnowflakeClientConfig,
    base_url: &Url,
) -> Result<LoginOutcome> {
    if let SnowflakeAuthMethod::TokenAccessor(accessor) = auth {
        if accessor.session_token().is_empty() {
            return Err(Error::Config(
                "token accessor holds no session token".to_string(),
            ));
        }
        debug!("reusing session tokens from the token accessor");
        return Ok(LoginOutcome {
            tokens: Arc::clone(accessor),
            parameters: Vec::new(),
            session_info: SessionInfo::default(),
        });
    }

    let mut url = with_request_ids(base_url.join(LOGIN_REQUEST_PATH)?, &Uuid::new_v4());
    {
        let mut queries = url.query_pairs_mut();
        if let Some(warehouse) = &config.warehouse {
            queries.append_pair("warehouse", warehouse);
        }
        if let Some(database) = &config.database {
            queries.append_pair("databaseName", database);
        }
        if let Some(schema) = &config.schema {
            queries.append_pair("schemaName", schema);
        }
        if let Some(role) = &config.role {
            queries.append_pair("roleName", role);
        }
    }

    let attempt_timeout = match auth {
        SnowflakeAuthMethod::KeyPair { .. } => config.jwt_client_timeout,
        _ => config.client_timeout,
    };
    let policy = RetryPolicy::from(config)
        .with_attempt_timeout(attempt_timeout)
        .with_total_timeout(Some(config.login_timeout));

    // The generator runs per attempt, so a key-pair login signs a fresh JWT each time.
    let response = retry::execute(http, Method::POST, url, &policy, || {
        let data = login_request_data(username, auth, config)?;
        RequestParts::json(login_headers()?, &json!({ "data": data }))
    })
    .await?;

    let body = read_success_body(response, codes::FAILED_TO_CONNECT).await?;
    let response: SnowflakeResponse<LoginResponseData> = parse_body(body)?;
    if !response.success {
        return Err(response.to_error(codes::FAILED_TO_AUTH).into());
    }
    let data = response
        .data
        .ok_or_else(|| Error::Communication("missing login-response data".to_string()))?;

    info!(session_id = data.session_id, "logged in");
    Ok(LoginOutcome {
        tokens: Arc::new(TokenAccessor::new(
            &data.token,
            &data.master_token,
            data.session_id,
        )),
        parameters: data.parameters,
        session_info: data.session_info.unwrap_or_default(),
    })
}

fn login_headers() -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(JSON_CONTENT));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT));
    headers.insert(USER_AGENT, HeaderValue::from_str(&user_agent())?);
    Ok(headers)
}

fn base_login_request_data(username: &str, config: &SnowflakeClientConfig) -> Value {
    let mut session_parameters: HashMap<&str, Value> = config
        .session_parameters
        .iter()
        .map(|(k, v)| (k.as_str(), json!(v)))
        .collect();
    if config.keep_session_alive {
        session_parameters.insert("CLIENT_SESSION_KEEP_ALIVE", json!(true));
    }
    json!({
        "CLIENT_APP_ID": client_app_id(),
        "CLIENT_APP_VERSION": client_app_version(),
        "ACCOUNT_NAME": config.account,
        "LOGIN_NAME": username,
        "CLIENT_ENVIRONMENT": client_environment(config),
        "SESSION_PARAMETERS": session_parameters,
    })
}

fn login_request_data(
    username: &str,
    auth: &SnowflakeAuthMethod,
    config: &SnowflakeClientConfig,
) -> Result<Value> {
    let mut data = base_login_request_data(username, config);
    let extra = match auth {
        SnowflakeAuthMethod::Password(password) => json!({ "PASSWORD": password }),
        SnowflakeAuthMethod::KeyPair {
            encrypted_pem,
            password,
        } => {
            let password = (!password.is_empty()).then_some(password.as_slice());
            let jwt = generate_jwt_from_key_pair(
                encrypted_pem,
                password,
                username,
                &config.account,
                Utc::now().timestamp(),
                config.jwt_expire_timeout,
            )?;
            json!({ "TOKEN": jwt, "AUTHENTICATOR": "SNOWFLAKE_JWT" })
        }
        SnowflakeAuthMethod::Oauth { token } => json!({ "TOKEN": token, "AUTHENTICATOR": "OAUTH" }),
        SnowflakeAuthMethod::TokenAccessor(_) => {
            return Err(Error::Config(
                "token accessor sessions do not log in".to_string(),
            ));
        }
    };
    if let (Some(obj), Value::Object(extra)) = (data.as_object_mut(), extra) {
        obj.extend(extra);
    }
    Ok(data)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponseData {
    token: String,
    master_token: String,
    session_id: i64,
    #[serde(default)]
    parameters: Vec<NameValueParameter>,
    session_info: Option<SessionInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(account: &str, region: Option<&str>) -> SnowflakeClientConfig {
        SnowflakeClientConfig {
            account: account.to_string(),
            region: region.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn base_url_from_account_and_region() {
        let url = get_base_url(&config("acct", None), None).unwrap();
        assert_eq!(url.as_str(), "https://acct.snowflakecomputing.com/");
        let url = get_base_url(&config("acct", Some("eu-central-1")), None).unwrap();
        assert_eq!(url.as_str(), "https://acct.eu-central-1.snowflakecomputing.com/");
        let url = get_base_url(&config("acct", Some("cn-north-1")), None).unwrap();
        assert_eq!(url.as_str(), "https://acct.cn-north-1.snowflakecomputing.cn/");
    }

    #[test]
    fn base_url_from_explicit_address() {
        let conn = SnowflakeConnectionConfig {
            host: "localhost".to_string(),
            port: Some(8080),
            protocol: Some("http".to_string()),
        };
        let url = get_base_url(&config("", None), Some(&conn)).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/");
    }

    #[test]
    fn password_login_body() {
        let mut cfg = config("acct", None);
        cfg.keep_session_alive = true;
        cfg.session_parameters
            .insert("QUERY_TAG".to_string(), "etl".to_string());
        let data =
            login_request_data("jane", &SnowflakeAuthMethod::Password("pw".into()), &cfg).unwrap();
        assert_eq!(data["LOGIN_NAME"], "jane");
        assert_eq!(data["ACCOUNT_NAME"], "acct");
        assert_eq!(data["PASSWORD"], "pw");
        assert_eq!(data["SESSION_PARAMETERS"]["QUERY_TAG"], "etl");
        assert_eq!(data["SESSION_PARAMETERS"]["CLIENT_SESSION_KEEP_ALIVE"], true);
        assert!(data.get("AUTHENTICATOR").is_none());
    }

    #[test]
    fn oauth_login_body() {
        let data = login_request_data(
            "jane",
            &SnowflakeAuthMethod::Oauth {
                token: "tok".into(),
            },
            &config("acct", None),
        )
        .unwrap();
        assert_eq!(data["AUTHENTICATOR"], "OAUTH");
        assert_eq!(data["TOKEN"], "tok");
    }
}
