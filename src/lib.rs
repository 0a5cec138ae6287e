//! Switchyard - Reverse Proxy Gateway
//!
//! Core library for the liveness-aware load balancer and the authenticated
//! API gateway. Both modes share the same HTTP layer and forwarding handle.

pub mod config;
pub mod gateway;
pub mod http;
pub mod metrics;
pub mod proxy;
pub mod server;
