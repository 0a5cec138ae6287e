//! Background liveness probing

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use tokio::net::TcpStream;
use tokio::time::{MissedTickBehavior, interval, timeout};

use crate::proxy::backend::{Backend, ServerPool};

/// Opens (and immediately drops) a connection to `host:port`.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, authority: &str) -> Result<()>;
}

/// Real TCP connect.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, authority: &str) -> Result<()> {
        TcpStream::connect(authority)
            .await
            .with_context(|| format!("TCP connection to {} failed", authority))?;
        Ok(())
    }
}

/// Whether `backend` accepted a connection within `probe_timeout`.
pub async fn probe(dialer: &dyn Dialer, backend: &Backend, probe_timeout: Duration) -> bool {
    let authority = backend.authority();
    match timeout(probe_timeout, dialer.dial(&authority)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(backend = %backend.address(), error = %e, "Probe failed");
            false
        }
        Err(_) => {
            tracing::debug!(backend = %backend.address(), "Probe timed out");
            false
        }
    }
}

/// Probes every backend concurrently and records the results in `pool`.
pub async fn check_once(pool: &ServerPool, dialer: &dyn Dialer, probe_timeout: Duration) {
    let probes = pool.backends().iter().map(|backend| async move {
        let alive = probe(dialer, backend, probe_timeout).await;
        pool.mark_backend_status(backend.address(), alive);
        (backend.address().as_str(), alive)
    });

    for (address, alive) in join_all(probes).await {
        tracing::debug!(backend = address, alive, "Health check");
    }
}

/// Runs [`check_once`] every `every` for the life of the process.
pub async fn run(
    pool: Arc<ServerPool>,
    dialer: Arc<dyn Dialer>,
    every: Duration,
    probe_timeout: Duration,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The pool starts out all-alive; the first probe waits a full period.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        tracing::info!("Starting health check...");
        check_once(&pool, dialer.as_ref(), probe_timeout).await;
        tracing::info!(
            alive = pool.available_count(),
            total = pool.len(),
            "Health check completed"
        );
    }
}
