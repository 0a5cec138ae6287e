//! Authenticated API gateway
//!
//! Maps external path prefixes onto per-endpoint upstreams and runs the
//! authorization gate in front of protected ones.

pub mod auth;
pub mod router;
pub mod secrets;

pub use auth::{AuthError, AuthGate};
pub use router::{GatewayEndpoint, GatewayRouter};
pub use secrets::{MemorySecretStore, SecretError, SecretStore};
