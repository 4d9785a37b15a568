//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     listen → serve → ping collaborators → Ready → register checks → signal ready
//!
//! Running:
//!     signals.rs (SIGTERM/SIGINT/SIGQUIT → terminate, SIGHUP → upgrade)
//!     → Upgrader::await_exit
//!
//! Shutdown (shutdown.rs):
//!     stop accepting → drain → deregister checks → close collaborators → release listener
//! ```
//!
//! # Design Decisions
//! - One deadline for the whole shutdown; each step is cut off at it
//! - Shutdown is entered once and never aborts half way
//! - Errors are returned to the binary, which picks the exit code

pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod state;

pub use shutdown::{ShutdownBudget, ShutdownError, ShutdownReport, StepOutcome};
pub use signals::spawn_signal_listener;
pub use startup::{ManagedCollaborator, Orchestrator, Service, StartupError};
pub use state::{Lifecycle, LifecycleState};
