//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! defaults
//!     → config file (TOML)
//!     → environment overlay file (config.<env>.toml)
//!     → LIFELINE__* environment variables
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServiceConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; a new generation picks up changes
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, load_from_env, ConfigError};
pub use schema::{
    AppConfig, CollaboratorConfig, ExternalCheckConfig, HealthConfig, ListenerConfig,
    ObservabilityConfig, ServiceConfig, TimeoutConfig, TlsConfig,
};
pub use validation::{validate_config, ValidationError};
