//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     CheckDescriptor (name, probe, delay, period, timeout, critical)
//!     → registry.rs (one task + timer per check)
//!
//! Each execution:
//!     probe (check.rs, probes.rs)
//!     → timeout / panic isolation
//!     → CheckResult swapped in atomically (status.rs)
//!
//! Readers:
//!     registry.snapshot()
//!     → HealthSnapshot (aggregate, readiness, verdict derived on read)
//!     → /healthz, /readiness, /health
//! ```
//!
//! # Design Decisions
//! - Checks fail independently; one stuck probe never delays another
//! - Readiness follows checks explicitly tagged critical
//! - Snapshots never wait for a running probe

pub mod check;
pub mod probes;
pub mod registry;
pub mod status;

pub use check::{CheckDescriptor, CheckError, Probe, ProbeOutput};
pub use registry::{HealthRegistry, RegistryError};
pub use status::{CheckResult, CheckState, CheckStatus, HealthSnapshot, Verdict};
