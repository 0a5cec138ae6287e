//! Backend server management
//!
//! This module manages the pool of backend servers, tracking their liveness
//! and selecting backends for incoming requests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Result;
use url::Url;

use crate::config::Timeouts;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::proxy::forward::{Forwarder, HttpForwarder};

/// One upstream server: its address, liveness and forwarding handle.
///
/// The address is taken from the forwarder, so the two always agree.
pub struct Backend {
    address: Url,
    alive: AtomicBool,
    forwarder: Arc<dyn Forwarder>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("address", &self.address.as_str())
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Backend {
    /// Create a backend with a plain HTTP forwarder bound to `address`
    pub fn new(address: Url, timeouts: Timeouts) -> Result<Self> {
        let forwarder = HttpForwarder::new(address, timeouts)?;
        Ok(Self::with_forwarder(Arc::new(forwarder)))
    }

    /// Create a backend around an existing forwarding handle
    pub fn with_forwarder(forwarder: Arc<dyn Forwarder>) -> Self {
        Self {
            address: forwarder.target().clone(),
            alive: AtomicBool::new(true),
            forwarder,
        }
    }

    pub fn address(&self) -> &Url {
        &self.address
    }

    /// `host:port` used by the health probe
    pub fn authority(&self) -> String {
        let host = self.address.host_str().unwrap_or_default();
        let port = self.address.port_or_known_default().unwrap_or(80);
        format!("{}:{}", host, port)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Sets liveness, returning the previous value.
    pub fn set_alive(&self, alive: bool) -> bool {
        self.alive.swap(alive, Ordering::AcqRel)
    }

    pub async fn forward(&self, request: &Request) -> Result<Response> {
        self.forwarder.forward(request).await
    }
}

/// Ordered pool of backends with a round-robin cursor.
///
/// The backend list is only appended to during startup; afterwards the
/// liveness flags and the cursor are the only shared mutable state.
#[derive(Debug, Default)]
pub struct ServerPool {
    backends: Vec<Arc<Backend>>,
    cursor: AtomicUsize,
}

impl ServerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool from a comma-separated URL list.
    ///
    /// Malformed entries are logged and skipped; an empty result is an error.
    pub fn from_backend_list(list: &str, timeouts: Timeouts) -> Result<Self> {
        let mut pool = Self::new();

        for token in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let backend = Url::parse(token)
                .map_err(anyhow::Error::from)
                .and_then(|url| Backend::new(url, timeouts));

            match backend {
                Ok(backend) => {
                    tracing::info!(backend = %backend.address(), "Configured server");
                    pool.add_backend(backend);
                }
                Err(e) => {
                    tracing::error!(backend = token, error = %e, "Skipping malformed backend");
                }
            }
        }

        if pool.is_empty() {
            anyhow::bail!("Please provide one or more backends to load balance");
        }
        Ok(pool)
    }

    /// Append a backend. Startup only.
    pub fn add_backend(&mut self, backend: Backend) {
        self.backends.push(Arc::new(backend));
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Set liveness of the backend at `address`; no-op if it is not pooled.
    pub fn mark_backend_status(&self, address: &Url, alive: bool) {
        if let Some(backend) = self.find(address) {
            let was_alive = backend.set_alive(alive);
            if was_alive != alive {
                if alive {
                    tracing::info!(backend = %address, "Backend is up");
                } else {
                    tracing::warn!(backend = %address, "Backend is down");
                }
            }
        }
    }

    /// Liveness of the backend at `address`; unknown addresses are not alive.
    pub fn is_backend_alive(&self, address: &Url) -> bool {
        self.find(address).map(|b| b.is_alive()).unwrap_or(false)
    }

    /// Select the next alive backend, round-robin.
    ///
    /// The cursor is a monotonically increasing counter; the next scan
    /// starts at `cursor % len`. It is advanced on every call and a scan
    /// covers at most one full lap. When dead backends were skipped the
    /// cursor is raised past the chosen position with `fetch_max`, so
    /// concurrent callers can never move it backwards.
    pub fn next_peer(&self) -> Option<Arc<Backend>> {
        let len = self.backends.len();
        if len == 0 {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..len {
            let position = start.wrapping_add(offset);
            let backend = &self.backends[position % len];
            if backend.is_alive() {
                if offset != 0 {
                    self.cursor
                        .fetch_max(position.wrapping_add(1), Ordering::Relaxed);
                }
                return Some(backend.clone());
            }
        }

        None
    }

    pub fn available_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_alive()).count()
    }

    fn find(&self, address: &Url) -> Option<&Arc<Backend>> {
        self.backends.iter().find(|b| b.address() == address)
    }
}
