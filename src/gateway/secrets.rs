//! Secret store consulted for API-key validation

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecretError {
    #[error("secret {engine}/{key} not found")]
    NotFound { engine: String, key: String },

    #[error("secret store unavailable: {0}")]
    Unavailable(String),
}

/// Key/value lookup by `(engine, key name)`.
pub trait SecretStore: Send + Sync {
    fn get(&self, engine: &str, key: &str) -> Result<String, SecretError>;

    /// Store `value`, returning a short description of what was written.
    fn save(&self, engine: &str, key: &str, value: &str) -> Result<String, SecretError>;
}

/// Process-local store, one map per engine.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    engines: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, engine: &str, key: &str) -> Result<String, SecretError> {
        self.engines
            .read()
            .get(engine)
            .and_then(|keys| keys.get(key))
            .cloned()
            .ok_or_else(|| SecretError::NotFound {
                engine: engine.to_string(),
                key: key.to_string(),
            })
    }

    fn save(&self, engine: &str, key: &str, value: &str) -> Result<String, SecretError> {
        self.engines
            .write()
            .entry(engine.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(format!("saved {}/{}", engine, key))
    }
}
