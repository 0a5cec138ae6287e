//! Authorization gate for protected gateway endpoints
//!
//! Two checks are available per endpoint: an HS256 bearer token or an API
//! key compared against the secret store. Each failure cause has its own
//! [`AuthError`] variant so operators can tell them apart in the logs.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::config::SecurityType;
use crate::gateway::secrets::SecretStore;
use crate::http::{Request, Response};

type HmacSha256 = Hmac<Sha256>;

/// Header stamped on every gateway response.
pub const PROXY_HEADER: &str = "X-Proxy";
pub const PROXY_HEADER_VALUE: &str = "Switchyard";

pub const API_KEY_HEADER: &str = "X-API-KEY";

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("authorization header must be of the form 'Bearer <token>'")]
    BearerTokenFormat,

    #[error("token is not a well-formed HS256 JWT")]
    MalformedToken,

    #[error("token signature failed HMAC validation")]
    TokenHmacValidation,

    #[error("token has expired")]
    TokenExpValidation,

    #[error("Invalid API KEY")]
    InvalidApiKey,
}

impl AuthError {
    /// Stable identifier for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::BearerTokenFormat => "bearer_token_format",
            AuthError::MalformedToken => "malformed_token",
            AuthError::TokenHmacValidation => "token_hmac_validation",
            AuthError::TokenExpValidation => "token_exp_validation",
            AuthError::InvalidApiKey => "invalid_api_key",
        }
    }
}

/// Runs the configured check for a protected endpoint.
pub struct AuthGate {
    jwt_secret: Vec<u8>,
    store: Arc<dyn SecretStore>,
    engine: String,
    key_name: String,
}

impl AuthGate {
    pub fn new(
        jwt_secret: impl Into<Vec<u8>>,
        store: Arc<dyn SecretStore>,
        engine: impl Into<String>,
        key_name: impl Into<String>,
    ) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            store,
            engine: engine.into(),
            key_name: key_name.into(),
        }
    }

    pub fn check(&self, request: &Request, security: SecurityType) -> Result<(), AuthError> {
        let verdict = match security {
            SecurityType::Jwt => check_jwt(request, &self.jwt_secret),
            SecurityType::Apikey => {
                check_api_key(request, self.store.as_ref(), &self.engine, &self.key_name)
            }
        };

        if let Err(e) = &verdict {
            tracing::warn!(
                kind = e.kind(),
                error = %e,
                path = %request.path,
                remote = ?request.remote_addr,
                "Authorization failed"
            );
        }
        verdict
    }
}

/// Validates `Authorization: Bearer <token>` against `secret` at the current time.
pub fn check_jwt(request: &Request, secret: &[u8]) -> Result<(), AuthError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();
    check_jwt_at(request, secret, now)
}

pub fn check_jwt_at(request: &Request, secret: &[u8], now: i64) -> Result<(), AuthError> {
    let token = request
        .header("Authorization")
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(AuthError::BearerTokenFormat)?;

    verify_hs256(token.trim(), secret, now).map(|_| ())
}

/// Verifies signature, then expiry, returning the claims.
///
/// A missing `exp` claim never expires.
pub fn verify_hs256(token: &str, secret: &[u8], now: i64) -> Result<Value, AuthError> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::MalformedToken);
    };

    let header: Value = decode_segment(header)?;
    if header.get("alg").and_then(Value::as_str) != Some("HS256") {
        return Err(AuthError::TokenHmacValidation);
    }

    let signature = BASE64_URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| AuthError::MalformedToken)?;
    let (signing_input, _) = token.rsplit_once('.').ok_or(AuthError::MalformedToken)?;
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| AuthError::TokenHmacValidation)?;
    mac.update(signing_input.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| AuthError::TokenHmacValidation)?;

    let claims: Value = decode_segment(payload)?;
    match claims.get("exp") {
        None | Some(Value::Null) => {}
        Some(exp) => {
            let exp = exp.as_f64().ok_or(AuthError::MalformedToken)?;
            if now as f64 >= exp {
                return Err(AuthError::TokenExpValidation);
            }
        }
    }

    Ok(claims)
}

/// Mints an HS256 token for `claims`.
pub fn encode_hs256(claims: &Value, secret: &[u8]) -> anyhow::Result<String> {
    let header = BASE64_URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = BASE64_URL_SAFE_NO_PAD.encode(claims.to_string());
    let signing_input = format!("{}.{}", header, payload);

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| anyhow::anyhow!("invalid HMAC key: {}", e))?;
    mac.update(signing_input.as_bytes());
    let signature = BASE64_URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{}.{}", signing_input, signature))
}

fn decode_segment(segment: &str) -> Result<Value, AuthError> {
    let bytes = BASE64_URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| AuthError::MalformedToken)?;
    serde_json::from_slice(&bytes).map_err(|_| AuthError::MalformedToken)
}

/// Compares `X-API-KEY` with the stored key for `(engine, key)`.
pub fn check_api_key(
    request: &Request,
    store: &dyn SecretStore,
    engine: &str,
    key: &str,
) -> Result<(), AuthError> {
    let expected = store.get(engine, key).map_err(|e| {
        tracing::error!(engine, key, error = %e, "API key lookup failed");
        AuthError::InvalidApiKey
    })?;
    let provided = request.header(API_KEY_HEADER).unwrap_or_default();

    if provided.is_empty() || !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        return Err(AuthError::InvalidApiKey);
    }

    tracing::debug!("API key check OK");
    Ok(())
}

/// Stamps the proxy header, then hands back the authorization verdict.
pub fn modify_response(
    response: &mut Response,
    verdict: Result<(), AuthError>,
) -> Result<(), AuthError> {
    response.set_header(PROXY_HEADER, PROXY_HEADER_VALUE);
    verdict
}
