//! Reverse proxy functionality
//!
//! Backend pool management, liveness probing, peer selection with
//! retry/backoff, and the single-target forwarding handle both serving
//! modes rely on.

pub mod backend;
pub mod backoff;
pub mod balancer;
pub mod forward;
pub mod health;

pub use backend::{Backend, ServerPool};
pub use backoff::BackoffPolicy;
pub use balancer::{LoadBalancer, RetryContext};
pub use forward::{Forwarder, HttpForwarder};
