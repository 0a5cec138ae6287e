//! Request metrics
//!
//! The routers push counter increments through [`MetricsSink`];
//! [`PrometheusMetrics`] backs it with a private registry that the optional
//! metrics listener renders in the text exposition format.

use anyhow::{Context, Result};
use async_trait::async_trait;
use prometheus::{
    CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder, exponential_buckets,
};

use crate::http::{Handler, Method, Request, Response, ResponseBuilder, StatusCode};

const NAMESPACE: &str = "switchyard";

/// Receiver for labelled request counters.
pub trait MetricsSink: Send + Sync {
    /// `requests_total{path, service}`
    fn record_request(&self, path: &str, service: &str);

    /// `requests_by_endpoint{proxyPath, endpointPath, ipAddr, method}`
    fn record_endpoint_request(
        &self,
        proxy_path: &str,
        endpoint_path: &str,
        ip_addr: &str,
        method: &str,
    );

    /// Proxy-path request latency
    fn observe_latency(&self, seconds: f64);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_request(&self, _path: &str, _service: &str) {}

    fn record_endpoint_request(&self, _: &str, _: &str, _: &str, _: &str) {}

    fn observe_latency(&self, _seconds: f64) {}
}

pub struct PrometheusMetrics {
    registry: Registry,
    requests_total: CounterVec,
    requests_by_endpoint: CounterVec,
    request_latency: Histogram,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("requests_total", "Number of requests").namespace(NAMESPACE),
            &["path", "service"],
        )
        .context("requests_total")?;

        let requests_by_endpoint = CounterVec::new(
            Opts::new("requests_by_endpoint", "Number of requests per proxied endpoint")
                .namespace(NAMESPACE),
            &["proxyPath", "endpointPath", "ipAddr", "method"],
        )
        .context("requests_by_endpoint")?;

        let request_latency = Histogram::with_opts(
            HistogramOpts::new("request_latency_seconds", "Request Latency")
                .namespace(NAMESPACE)
                .buckets(exponential_buckets(0.0001, 2.0, 50).context("latency buckets")?),
        )
        .context("request_latency_seconds")?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(requests_by_endpoint.clone()))?;
        registry.register(Box::new(request_latency.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            requests_by_endpoint,
            request_latency,
        })
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_request(&self, path: &str, service: &str) {
        self.requests_total.with_label_values(&[path, service]).inc();
    }

    fn record_endpoint_request(
        &self,
        proxy_path: &str,
        endpoint_path: &str,
        ip_addr: &str,
        method: &str,
    ) {
        self.requests_by_endpoint
            .with_label_values(&[proxy_path, endpoint_path, ip_addr, method])
            .inc();
    }

    fn observe_latency(&self, seconds: f64) {
        self.request_latency.observe(seconds);
    }
}

/// Serves `GET /metrics` from a [`PrometheusMetrics`] registry.
pub struct MetricsEndpoint {
    metrics: std::sync::Arc<PrometheusMetrics>,
}

impl MetricsEndpoint {
    pub fn new(metrics: std::sync::Arc<PrometheusMetrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl Handler for MetricsEndpoint {
    async fn handle(&self, request: Request) -> Response {
        if request.path_only() != "/metrics" {
            return Response::not_found();
        }
        if request.method != Method::GET {
            return Response::text(StatusCode::MethodNotAllowed, "405 Method Not Allowed");
        }

        match self.metrics.render() {
            Ok(text) => ResponseBuilder::new(StatusCode::Ok)
                .header("Content-Type", TextEncoder::new().format_type())
                .body(text.into_bytes())
                .build(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to render metrics");
                Response::internal_error()
            }
        }
    }
}
