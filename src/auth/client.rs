use serde_json::{Value, json};

use crate::SnowflakeClientConfig;

pub(crate) fn client_app_id() -> &'static str {
    env!("CARGO_PKG_NAME")
}

pub(crate) fn client_app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub(crate) fn user_agent() -> String {
    format!(
        "{}/{} ({})",
        client_app_id(),
        client_app_version(),
        std::env::consts::OS
    )
}

pub(super) fn client_environment(config: &SnowflakeClientConfig) -> Value {
    let ocsp_mode = if config.insecure_mode {
        "INSECURE"
    } else if config.ocsp_fail_open {
        "FAIL_OPEN"
    } else {
        "FAIL_CLOSED"
    };
    json!({
        "APPLICATION": config.application.as_deref().unwrap_or(client_app_id()),
        "OS": std::env::consts::OS,
        "OCSP_MODE": ocsp_mode,
        "LOGIN_TIMEOUT": config.login_timeout.as_secs(),
        "NETWORK_TIMEOUT": config.client_timeout.as_secs(),
        "JWT_CLIENT_TIMEOUT": config.jwt_client_timeout.as_secs(),
        "TRACING": "WARN",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_reports_ocsp_mode() {
        let mut config = SnowflakeClientConfig::default();
        assert_eq!(client_environment(&config)["OCSP_MODE"], "FAIL_OPEN");
        config.ocsp_fail_open = false;
        assert_eq!(client_environment(&config)["OCSP_MODE"], "FAIL_CLOSED");
        config.insecure_mode = true;
        config.application = Some("etl".to_string());
        let env = client_environment(&config);
        assert_eq!(env["OCSP_MODE"], "INSECURE");
        assert_eq!(env["APPLICATION"], "etl");
    }
}
