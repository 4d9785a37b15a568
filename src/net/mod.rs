//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Predecessor generation (optional)
//!     → inherit.rs (LIFELINE_LISTEN_FDS / LIFELINE_READY_FD)
//!     → handoff.rs (adopt inherited socket, or bind a fresh one)
//!     → tls.rs (optional TLS material)
//!     → HTTP layer serves on the handle
//!
//! Upgrade:
//!     handoff.rs spawns successor with fds 3.. → waits for readiness byte
//!     → this generation drains
//! ```
//!
//! # Design Decisions
//! - The socket is never closed during an upgrade; only duplicated
//! - Exactly one exit reason per generation, first one wins
//! - Unix only: descriptor passing relies on fork/exec semantics

pub mod handoff;
pub mod inherit;
pub mod tls;

pub use handoff::{ExitReason, HandoffError, ListenerHandle, Successor, SupervisorState, Upgrader, UpgraderOptions};
