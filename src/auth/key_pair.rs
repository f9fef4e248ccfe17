use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::Result;
use crate::error::{SnowflakeError, codes, sql_state};

/// Builds the `SNOWFLAKE_JWT` login token, valid from `timestamp` for `lifetime`.
pub(super) fn generate_jwt_from_key_pair(
    pem: &str,
    password: Option<&[u8]>,
    username: &str,
    account: &str,
    timestamp: i64,
    lifetime: Duration,
) -> Result<String> {
    let account = account
        .split('.')
        .next()
        .map(|s| s.to_ascii_uppercase())
        .unwrap_or_default();
    let username = username.to_ascii_uppercase();

    let private = try_parse_private_key(pem, password)?;

    let public = private.to_public_key();
    let der = public.to_public_key_der()?;
    let mut hasher = Sha256::new();
    hasher.update(der.as_bytes());
    let fingerprint = STANDARD.encode(hasher.finalize());

    let payload = json!({
        "iss": format!("{account}.{username}.SHA256:{fingerprint}"),
        "sub": format!("{account}.{username}"),
        "iat": timestamp,
        "exp": timestamp + lifetime.as_secs() as i64,
    });
    let key = EncodingKey::from_rsa_pem(private.to_pkcs8_pem(LineEnding::LF)?.as_bytes())?;
    let jwt = jsonwebtoken::encode(
        &Header {
            alg: Algorithm::RS256,
            ..Default::default()
        },
        &payload,
        &key,
    )?;
    Ok(jwt)
}

fn try_parse_private_key(pem: &str, password: Option<&[u8]>) -> Result<RsaPrivateKey> {
    if let Some(password) = password {
        if let Ok(private) = RsaPrivateKey::from_pkcs8_encrypted_pem(pem, password) {
            return Ok(private);
        }
    }

    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| {
            SnowflakeError::new(
                codes::PRIVATE_KEY_PARSE_ERROR,
                sql_state::CONNECTION_WAS_NOT_ESTABLISHED,
                "failed to parse private key: {}",
            )
            .with_args([e])
            .into()
        })
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    use super::*;
    use crate::Error;

    const KEY: &str = include_str!("./test_snowflake_key.p8");

    fn claims(jwt: &str) -> serde_json::Value {
        let payload = jwt.split('.').nth(1).unwrap();
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap()
    }

    #[test]
    fn test_generate_jwt_from_key_pair() -> Result<()> {
        let jwt = generate_jwt_from_key_pair(
            KEY,
            Some("12345".as_bytes()),
            "user_name",
            "myaccount.ap-northeast-1.aws",
            1700746374,
            Duration::from_secs(60),
        )?;
        let claims = claims(&jwt);
        assert_eq!(claims["sub"], "MYACCOUNT.USER_NAME");
        assert!(
            claims["iss"]
                .as_str()
                .unwrap()
                .starts_with("MYACCOUNT.USER_NAME.SHA256:")
        );
        assert_eq!(claims["iat"], 1700746374);
        assert_eq!(claims["exp"], 1700746434);
        Ok(())
    }

    #[test]
    fn wrong_password_is_a_key_parse_error() {
        let err = generate_jwt_from_key_pair(
            KEY,
            Some("wrong".as_bytes()),
            "u",
            "acct",
            0,
            Duration::from_secs(60),
        )
        .unwrap_err();
        assert!(
            matches!(err, Error::Snowflake(ref e) if e.number == codes::PRIVATE_KEY_PARSE_ERROR)
        );
    }
}
