//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the service.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// Application identity and shutdown budget.
    pub app: AppConfig,

    /// Listener configuration (bind address, TLS, upgrades).
    pub listener: ListenerConfig,

    /// Health check settings.
    pub health: HealthConfig,

    /// Primary datastore collaborator.
    pub database: CollaboratorConfig,

    /// Cache collaborator.
    pub redis: CollaboratorConfig,

    /// Timeout configuration for request handling.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl ServiceConfig {
    /// Budget for the whole shutdown sequence.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.app.shutdown_timeout_secs)
    }
}

/// Application identity.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    /// Service name, reported on `/`.
    pub name: String,

    /// Service version, reported on `/`.
    pub version: String,

    /// Deployment environment (development, staging, production).
    pub environment: String,

    /// Shutdown budget in seconds.
    pub shutdown_timeout_secs: u64,

    /// File that receives the PID of the generation currently serving.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid_file: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "lifeline".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
            shutdown_timeout_secs: 30,
            pid_file: None,
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Network type. Only "tcp" is supported.
    pub network: String,

    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    /// How long a successor generation may take to signal readiness.
    pub upgrade_timeout_secs: u64,
}

impl ListenerConfig {
    pub fn upgrade_timeout(&self) -> Duration {
        Duration::from_secs(self.upgrade_timeout_secs)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            network: "tcp".to_string(),
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
            upgrade_timeout_secs: 60,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Register health checks at all.
    pub enabled: bool,

    /// Execution period of every built-in check, in seconds.
    pub check_interval_secs: u64,

    /// Per-execution timeout, in seconds.
    pub timeout_secs: u64,

    /// Delay before the first run of collaborator checks, in seconds.
    pub initial_delay_secs: u64,

    /// Delay before the first run of external URL checks, in seconds.
    pub external_initial_delay_secs: u64,

    /// Ping the database collaborator periodically.
    pub database_check: bool,

    /// Ping the cache collaborator periodically.
    pub redis_check: bool,

    /// Additional URL checks.
    pub external_checks: Vec<ExternalCheckConfig>,

    /// Hold back the ready signal until critical checks ran once.
    pub await_first_pass: bool,

    /// Upper bound for `await_first_pass`, in seconds.
    pub first_pass_timeout_secs: u64,
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn external_initial_delay(&self) -> Duration {
        Duration::from_secs(self.external_initial_delay_secs)
    }

    pub fn first_pass_timeout(&self) -> Duration {
        Duration::from_secs(self.first_pass_timeout_secs)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: 30,
            timeout_secs: 5,
            initial_delay_secs: 2,
            external_initial_delay_secs: 5,
            database_check: true,
            redis_check: true,
            external_checks: Vec::new(),
            await_first_pass: false,
            first_pass_timeout_secs: 10,
        }
    }
}

/// An HTTP endpoint probed with GET.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExternalCheckConfig {
    /// URL to probe. 2xx counts as healthy.
    pub url: String,

    /// Whether a failure takes the service out of rotation.
    #[serde(default)]
    pub critical: bool,
}

/// A backing service reached through ping/close only.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CollaboratorConfig {
    /// Use this collaborator at all.
    pub enabled: bool,

    /// Address pinged for reachability (e.g., "localhost:5432").
    pub address: String,

    /// Abort startup when the first ping fails.
    pub startup_blocking: bool,

    /// Whether the health check blocks readiness.
    pub critical: bool,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            startup_blocking: true,
            critical: true,
        }
    }
}

/// Timeout configuration for request handling.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 60 }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log format: "pretty" or "json".
    pub log_format: String,

    /// Serve Prometheus metrics on `/metrics`.
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "json".to_string(),
            metrics_enabled: true,
        }
    }
}
