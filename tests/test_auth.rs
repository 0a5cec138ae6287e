//! JWT and API-key checks of the authorization gate

use std::sync::Arc;

use serde_json::json;
use switchyard::config::SecurityType;
use switchyard::gateway::auth::{
    AuthError, AuthGate, PROXY_HEADER, PROXY_HEADER_VALUE, check_api_key, check_jwt,
    check_jwt_at, encode_hs256, modify_response,
};
use switchyard::gateway::secrets::{MemorySecretStore, SecretError, SecretStore};
use switchyard::http::{Method, Request, RequestBuilder, Response};

const SECRET: &[u8] = b"shared-secret";

fn with_header(name: &str, value: &str) -> Request {
    RequestBuilder::new()
        .method(Method::GET)
        .path("/orders")
        .header(name, value)
        .build()
        .unwrap()
}

fn bearer(token: &str) -> Request {
    with_header("Authorization", &format!("Bearer {}", token))
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[test]
fn test_valid_token_passes() {
    let token = encode_hs256(&json!({"sub": "alice", "exp": now() + 3600}), SECRET).unwrap();
    assert_eq!(check_jwt(&bearer(&token), SECRET), Ok(()));
}

#[test]
fn test_wrong_secret_fails_hmac() {
    let token = encode_hs256(&json!({"sub": "alice", "exp": now() + 3600}), b"other").unwrap();
    assert_eq!(
        check_jwt(&bearer(&token), SECRET),
        Err(AuthError::TokenHmacValidation)
    );
}

#[test]
fn test_expired_token_fails_exp() {
    let token = encode_hs256(&json!({"sub": "alice", "exp": now() - 10}), SECRET).unwrap();
    assert_eq!(
        check_jwt(&bearer(&token), SECRET),
        Err(AuthError::TokenExpValidation)
    );
}

#[test]
fn test_expiry_boundary() {
    let token = encode_hs256(&json!({"exp": 1_000}), SECRET).unwrap();
    assert_eq!(check_jwt_at(&bearer(&token), SECRET, 999), Ok(()));
    assert_eq!(
        check_jwt_at(&bearer(&token), SECRET, 1_000),
        Err(AuthError::TokenExpValidation)
    );
}

#[test]
fn test_missing_bearer_prefix_fails_format() {
    let token = encode_hs256(&json!({"exp": now() + 60}), SECRET).unwrap();

    assert_eq!(
        check_jwt(&with_header("Authorization", &token), SECRET),
        Err(AuthError::BearerTokenFormat)
    );
    assert_eq!(
        check_jwt(&with_header("Authorization", &format!("Basic {}", token)), SECRET),
        Err(AuthError::BearerTokenFormat)
    );
    assert_eq!(
        check_jwt(&with_header("X-Other", "x"), SECRET),
        Err(AuthError::BearerTokenFormat)
    );
}

#[test]
fn test_garbage_token_is_malformed() {
    assert_eq!(
        check_jwt(&bearer("not-a-jwt"), SECRET),
        Err(AuthError::MalformedToken)
    );
}

#[test]
fn test_error_kinds_are_distinct() {
    let kinds = [
        AuthError::BearerTokenFormat,
        AuthError::MalformedToken,
        AuthError::TokenHmacValidation,
        AuthError::TokenExpValidation,
        AuthError::InvalidApiKey,
    ]
    .map(|e| e.kind());
    let unique: std::collections::HashSet<_> = kinds.iter().collect();
    assert_eq!(unique.len(), kinds.len());
}

fn store_with_key() -> MemorySecretStore {
    let store = MemorySecretStore::new();
    store.save("local", "apikey", "k-123").unwrap();
    store
}

#[test]
fn test_matching_api_key_passes() {
    let store = store_with_key();
    let request = with_header("X-API-KEY", "k-123");
    assert_eq!(check_api_key(&request, &store, "local", "apikey"), Ok(()));
}

#[test]
fn test_api_key_header_is_case_insensitive() {
    let store = store_with_key();
    let request = with_header("x-api-key", "k-123");
    assert_eq!(check_api_key(&request, &store, "local", "apikey"), Ok(()));
}

#[test]
fn test_mismatched_or_empty_api_key_fails() {
    let store = store_with_key();

    for value in ["k-124", "k-12", "", "K-123"] {
        let request = with_header("X-API-KEY", value);
        assert_eq!(
            check_api_key(&request, &store, "local", "apikey"),
            Err(AuthError::InvalidApiKey),
            "value {:?}",
            value
        );
    }

    let no_header = with_header("X-Other", "k-123");
    assert_eq!(
        check_api_key(&no_header, &store, "local", "apikey"),
        Err(AuthError::InvalidApiKey)
    );
}

struct BrokenStore;

impl SecretStore for BrokenStore {
    fn get(&self, _engine: &str, _key: &str) -> Result<String, SecretError> {
        Err(SecretError::Unavailable("sealed".to_string()))
    }

    fn save(&self, _engine: &str, _key: &str, _value: &str) -> Result<String, SecretError> {
        Err(SecretError::Unavailable("sealed".to_string()))
    }
}

#[test]
fn test_lookup_failure_is_invalid_key() {
    let request = with_header("X-API-KEY", "");
    assert_eq!(
        check_api_key(&request, &BrokenStore, "local", "apikey"),
        Err(AuthError::InvalidApiKey)
    );
}

#[test]
fn test_gate_dispatches_on_security_type() {
    let gate = AuthGate::new(SECRET, Arc::new(store_with_key()), "local", "apikey");

    let keyed = with_header("X-API-KEY", "k-123");
    assert_eq!(gate.check(&keyed, SecurityType::Apikey), Ok(()));
    assert_eq!(
        gate.check(&keyed, SecurityType::Jwt),
        Err(AuthError::BearerTokenFormat)
    );
}

#[test]
fn test_modify_response_stamps_header_either_way() {
    let mut ok = Response::ok("fine");
    assert_eq!(modify_response(&mut ok, Ok(())), Ok(()));
    assert_eq!(ok.header(PROXY_HEADER), Some(PROXY_HEADER_VALUE));

    let mut rejected = Response::ok("upstream");
    assert_eq!(
        modify_response(&mut rejected, Err(AuthError::InvalidApiKey)),
        Err(AuthError::InvalidApiKey)
    );
    assert_eq!(rejected.header(PROXY_HEADER), Some(PROXY_HEADER_VALUE));
}
