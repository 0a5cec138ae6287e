//! Configuration consumed by the serving modes.
//!
//! Loaded from YAML; every section has defaults so an empty file (or no
//! file at all) yields a runnable load-balancer configuration once a
//! backend list is supplied.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::proxy::backoff::BackoffPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub load_balancer: LoadBalancerConfig,
    pub gateway: GatewayConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// Comma-separated backend URLs, e.g. `http://10.0.0.1:3000,http://10.0.0.2:3000`
    pub backends: String,
    pub health_check_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub backoff: BackoffConfig,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            backends: String::new(),
            health_check_interval_secs: 20,
            probe_timeout_secs: 2,
            connect_timeout_ms: 2_000,
            request_timeout_ms: 30_000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl LoadBalancerConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            request: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

/// Connect and whole-exchange timeouts for a forwarding handle.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(2),
            request: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 100,
            max_ms: 10_000,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    pub fn policy(&self) -> BackoffPolicy {
        let base = Duration::from_millis(self.base_ms);
        let max = Duration::from_millis(self.max_ms);
        if self.jitter {
            BackoffPolicy::full_jitter(base, max)
        } else {
            BackoffPolicy::no_jitter(base, max)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Shared HMAC secret for `jwt` protected endpoints
    pub jwt_secret: String,
    pub api_key: ApiKeyConfig,
    pub services: Vec<ServiceConfig>,
}

/// Where the expected API key lives in the secret store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiKeyConfig {
    pub engine: String,
    pub key_name: String,
    /// Seeded into the secret store at startup when present
    pub value: Option<String>,
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            engine: "local".to_string(),
            key_name: "apikey".to_string(),
            value: None,
        }
    }
}

/// One logical upstream service and the endpoints exposed for it.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub host_uri: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Appended to `host_uri` to form the upstream target
    #[serde(default)]
    pub path_endpoint: String,
    /// Externally exposed prefix
    pub path_to_proxy: String,
    #[serde(default)]
    pub path_protected: bool,
    #[serde(default)]
    pub security_type: SecurityType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityType {
    #[default]
    Jwt,
    Apikey,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serves `/metrics` here when set
    pub listen_addr: Option<String>,
}

impl Config {
    /// Defaults plus the `LISTEN` environment override.
    pub fn load() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    /// Reads a YAML file, then applies environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut cfg = Self::from_yaml(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.apply_env();
        Ok(cfg)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    fn apply_env(&mut self) {
        if let Ok(listen) = std::env::var("LISTEN") {
            self.server.listen_addr = listen;
        }
    }

    /// Rejects gateway configurations that register a prefix twice.
    pub fn validate_gateway(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for service in &self.gateway.services {
            for endpoint in &service.endpoints {
                if !seen.insert(endpoint.path_to_proxy.as_str()) {
                    anyhow::bail!(
                        "path_to_proxy {} is registered more than once",
                        endpoint.path_to_proxy
                    );
                }
            }
        }
        Ok(())
    }
}
