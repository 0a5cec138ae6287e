//! Path-prefix router for the API gateway
//!
//! Every configured endpoint gets its own forwarding handle bound to
//! `host_uri + path_endpoint`. Requests are matched on the longest
//! registered prefix, stripped of it, optionally authorized, then relayed.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{error, info};
use url::Url;

use crate::config::{GatewayConfig, SecurityType, Timeouts};
use crate::gateway::auth::{AuthGate, modify_response};
use crate::http::{Handler, Request, Response, StatusCode};
use crate::metrics::MetricsSink;
use crate::proxy::forward::{Forwarder, HttpForwarder};

/// One exposed prefix and the upstream it maps to.
pub struct GatewayEndpoint {
    path_to_proxy: String,
    protected: bool,
    security: SecurityType,
    forwarder: Arc<dyn Forwarder>,
}

impl GatewayEndpoint {
    pub fn new(
        path_to_proxy: impl Into<String>,
        protected: bool,
        security: SecurityType,
        forwarder: Arc<dyn Forwarder>,
    ) -> Self {
        Self {
            path_to_proxy: path_to_proxy.into(),
            protected,
            security,
            forwarder,
        }
    }

    pub fn path_to_proxy(&self) -> &str {
        &self.path_to_proxy
    }

    pub fn target(&self) -> &Url {
        self.forwarder.target()
    }

    /// Path remaining after the prefix, if this endpoint claims `path`.
    fn strip<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(self.path_to_proxy.as_str())?;
        let on_boundary =
            self.path_to_proxy.ends_with('/') || rest.is_empty() || rest.starts_with('/');
        on_boundary.then_some(rest)
    }
}

pub struct GatewayRouter {
    /// Longest prefix first
    endpoints: Vec<GatewayEndpoint>,
    gate: AuthGate,
    metrics: Arc<dyn MetricsSink>,
}

impl GatewayRouter {
    pub fn new(gate: AuthGate, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            endpoints: Vec::new(),
            gate,
            metrics,
        }
    }

    /// Build a forwarding handle per configured endpoint.
    ///
    /// Endpoints whose target URL does not parse are logged and skipped;
    /// a prefix registered twice is an error.
    pub fn from_config(
        config: &GatewayConfig,
        gate: AuthGate,
        metrics: Arc<dyn MetricsSink>,
        timeouts: Timeouts,
    ) -> Result<Self> {
        let mut router = Self::new(gate, metrics);

        for service in &config.services {
            for endpoint in &service.endpoints {
                let forwarder = endpoint_target(&service.host_uri, &endpoint.path_endpoint)
                    .and_then(|target| HttpForwarder::new(target, timeouts));

                let forwarder = match forwarder {
                    Ok(forwarder) => forwarder,
                    Err(e) => {
                        error!(
                            path = %endpoint.path_to_proxy,
                            error = %format!("{:#}", e),
                            "Skipping endpoint with invalid target"
                        );
                        continue;
                    }
                };

                router.register(GatewayEndpoint::new(
                    endpoint.path_to_proxy.clone(),
                    endpoint.path_protected,
                    endpoint.security_type,
                    Arc::new(forwarder),
                ))?;
            }
        }

        Ok(router)
    }

    pub fn register(&mut self, endpoint: GatewayEndpoint) -> Result<()> {
        if self
            .endpoints
            .iter()
            .any(|e| e.path_to_proxy == endpoint.path_to_proxy)
        {
            anyhow::bail!("path {} is already registered", endpoint.path_to_proxy);
        }

        info!(
            path = %endpoint.path_to_proxy,
            upstream = %endpoint.target(),
            protected = endpoint.protected,
            "Registered endpoint"
        );
        self.endpoints.push(endpoint);
        self.endpoints
            .sort_by(|a, b| b.path_to_proxy.len().cmp(&a.path_to_proxy.len()));
        Ok(())
    }

    pub fn endpoints(&self) -> &[GatewayEndpoint] {
        &self.endpoints
    }

    fn route<'a>(&self, path: &'a str) -> Option<(&GatewayEndpoint, &'a str)> {
        self.endpoints
            .iter()
            .find_map(|endpoint| endpoint.strip(path).map(|rest| (endpoint, rest)))
    }

    async fn relay(&self, endpoint: &GatewayEndpoint, request: &Request, rest: &str) -> Response {
        let mut upstream = request.clone();
        upstream.path = match request.query() {
            Some(query) => format!("{}?{}", rest, query),
            None => rest.to_string(),
        };

        match endpoint.forwarder.forward(&upstream).await {
            Ok(response) => response,
            Err(e) => {
                error!(
                    upstream = %endpoint.target(),
                    path = %request.path,
                    remote = ?request.remote_addr,
                    error = %format!("{:#}", e),
                    "Upstream request failed"
                );
                Response::bad_gateway()
            }
        }
    }
}

#[async_trait]
impl Handler for GatewayRouter {
    async fn handle(&self, request: Request) -> Response {
        let started = Instant::now();

        let Some((endpoint, rest)) = self.route(request.path_only()) else {
            let mut response = Response::not_found();
            let _ = modify_response(&mut response, Ok(()));
            return response;
        };

        let ip_addr = extract_ip_addr(&request);
        self.metrics.record_endpoint_request(
            &request.path,
            endpoint.target().as_str(),
            &ip_addr,
            request.method.as_str(),
        );
        self.metrics.record_request(&request.path, "proxy");

        let verdict = if endpoint.protected {
            self.gate.check(&request, endpoint.security)
        } else {
            Ok(())
        };

        let mut response = match verdict {
            Ok(()) => self.relay(endpoint, &request, rest).await,
            Err(e) => Response::text(StatusCode::Unauthorized, e.to_string()),
        };

        if let Err(e) = modify_response(&mut response, verdict) {
            tracing::debug!(kind = e.kind(), path = %request.path, "Response rejected");
        }

        self.metrics.observe_latency(started.elapsed().as_secs_f64());
        response
    }
}

/// Client IP for metrics labels.
///
/// Prefers the first `X-Forwarded-For` entry over the socket peer, then
/// drops any port suffix; the IPv6 loopback becomes `localhost`.
pub fn extract_ip_addr(request: &Request) -> String {
    let forwarded = request
        .header("X-Forwarded-For")
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());

    let address = forwarded
        .or_else(|| request.remote_addr.map(|a| a.to_string()))
        .unwrap_or_default();

    if let Some(rest) = address.strip_prefix('[') {
        let host = rest.split(']').next().unwrap_or_default();
        return if host == "::1" {
            "localhost".to_string()
        } else {
            host.to_string()
        };
    }

    match address.matches(':').count() {
        1 => address.split(':').next().unwrap_or_default().to_string(),
        _ => address,
    }
}

/// Upstream URL for an endpoint: `host_uri` followed by `path_endpoint`.
pub fn endpoint_target(host_uri: &str, path_endpoint: &str) -> Result<Url> {
    let raw = format!("{}{}", host_uri, path_endpoint);
    Url::parse(&raw).with_context(|| format!("invalid endpoint target {}", raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Method, RequestBuilder};

    fn request(xff: Option<&str>, remote: &str) -> Request {
        let mut builder = RequestBuilder::new()
            .method(Method::GET)
            .path("/")
            .remote_addr(remote.parse().unwrap());
        if let Some(xff) = xff {
            builder = builder.header("X-Forwarded-For", xff);
        }
        builder.build().unwrap()
    }

    #[test]
    fn ip_prefers_first_forwarded_entry() {
        let req = request(Some("203.0.113.7, 10.0.0.1"), "127.0.0.1:5555");
        assert_eq!(extract_ip_addr(&req), "203.0.113.7");
    }

    #[test]
    fn ip_strips_port_and_loopback() {
        assert_eq!(extract_ip_addr(&request(None, "192.168.1.4:40000")), "192.168.1.4");
        assert_eq!(extract_ip_addr(&request(None, "[::1]:40000")), "localhost");
    }
}
