//! Load-balancing router with per-request retry and reroute
//!
//! Each request walks a small state machine:
//!
//! ```text
//! Selecting ──(no alive peer)──────────────────────────▶ Failed (503)
//!     │
//!     ▼
//! Forwarding ──ok──▶ Succeeded
//!     │ error, retry < 3
//!     ├──▶ RetryingSameBackend ── backoff(retry) ──▶ Forwarding
//!     │ error, retry == 3
//!     └──▶ ReroutingNewBackend ── mark dead ──▶ Selecting
//! ```
//!
//! Reroutes are capped at the pool size so a backend that flaps back to
//! life mid-request cannot keep one request cycling forever.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::http::{Handler, Request, Response};
use crate::metrics::MetricsSink;
use crate::proxy::backend::ServerPool;
use crate::proxy::backoff::BackoffPolicy;

/// Same-backend retries before a backend is given up on.
pub const MAX_RETRIES: u32 = 3;

/// Per-request retry bookkeeping.
///
/// `retry` counts attempts against the current backend and resets when a
/// new one is selected; `attempt` counts reroutes to a different backend.
/// Each step derives a new value instead of mutating shared state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryContext {
    pub retry: u32,
    pub attempt: u32,
}

impl RetryContext {
    /// Context for the next try against the same backend.
    pub fn next_retry(self) -> Self {
        Self {
            retry: self.retry + 1,
            ..self
        }
    }

    /// Context after giving up on a backend.
    pub fn rerouted(self) -> Self {
        Self {
            retry: 0,
            attempt: self.attempt + 1,
        }
    }
}

pub struct LoadBalancer {
    pool: Arc<ServerPool>,
    backoff: BackoffPolicy,
    metrics: Arc<dyn MetricsSink>,
}

impl LoadBalancer {
    pub fn new(
        pool: Arc<ServerPool>,
        backoff: BackoffPolicy,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            pool,
            backoff,
            metrics,
        }
    }

    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }

    /// Serve `request` starting from a fresh context.
    pub async fn serve(&self, request: &Request) -> Response {
        self.serve_with(request, RetryContext::default()).await
    }

    /// Serve `request` from an existing context.
    pub async fn serve_with(&self, request: &Request, mut ctx: RetryContext) -> Response {
        let remote = request
            .remote_addr
            .map(|a| a.to_string())
            .unwrap_or_default();

        loop {
            if ctx.attempt as usize >= self.pool.len().max(1) {
                warn!(
                    remote = %remote,
                    path = %request.path,
                    attempt = ctx.attempt,
                    "Max attempts reached, terminating"
                );
                return Response::service_unavailable();
            }

            let Some(backend) = self.pool.next_peer() else {
                warn!(remote = %remote, path = %request.path, "No alive backend");
                return Response::service_unavailable();
            };

            loop {
                match backend.forward(request).await {
                    Ok(response) => return response,
                    Err(e) => {
                        warn!(
                            backend = %backend.address(),
                            retry = ctx.retry,
                            error = %format!("{:#}", e),
                            "Forwarding failed"
                        );

                        if ctx.retry < MAX_RETRIES {
                            tokio::time::sleep(self.backoff.duration(ctx.retry)).await;
                            ctx = ctx.next_retry();
                            continue;
                        }

                        self.pool.mark_backend_status(backend.address(), false);
                        info!(
                            remote = %remote,
                            path = %request.path,
                            attempt = ctx.attempt,
                            "Attempting retry"
                        );
                        ctx = ctx.rerouted();
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Handler for LoadBalancer {
    async fn handle(&self, request: Request) -> Response {
        self.metrics.record_request(request.path_only(), "balancer");
        self.serve(&request).await
    }
}
