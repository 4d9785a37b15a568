//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Listener handed over by net::handoff
//!     → server.rs (axum-server, optional TLS, drain handle)
//!     → middleware (trace, request id, generation header, timeout)
//!     → /, /ping, /metrics          service routes
//!     → /healthz, /readiness, ...    probes.rs
//!     → application routes          merged from the caller
//! ```

pub mod probes;
pub mod server;

pub use probes::ProbeEndpoints;
pub use server::{HttpServer, GENERATION_HEADER};
