//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, addresses parse)
//! - Check that enabled features carry the data they need
//!
//! Returns all validation errors, not just the first.

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ServiceConfig;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("app.name is required")]
    MissingName,

    #[error("listener.network '{0}' is not supported (expected \"tcp\")")]
    UnsupportedNetwork(String),

    #[error("listener.bind_address '{0}' is not a socket address")]
    InvalidBindAddress(String),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("listener.tls cert_path and key_path are required when TLS is enabled")]
    IncompleteTls,

    #[error("health.external_checks url '{url}' is invalid: {reason}")]
    InvalidCheckUrl { url: String, reason: String },

    #[error("{0}.address is required when {0} is enabled")]
    MissingCollaboratorAddress(&'static str),
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.app.name.trim().is_empty() {
        errors.push(ValidationError::MissingName);
    }

    if config.listener.network != "tcp" {
        errors.push(ValidationError::UnsupportedNetwork(
            config.listener.network.clone(),
        ));
    }

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(
            config.listener.bind_address.clone(),
        ));
    }

    if let Some(tls) = &config.listener.tls {
        if tls.cert_path.is_empty() || tls.key_path.is_empty() {
            errors.push(ValidationError::IncompleteTls);
        }
    }

    let durations = [
        ("app.shutdown_timeout_secs", config.app.shutdown_timeout_secs),
        ("listener.upgrade_timeout_secs", config.listener.upgrade_timeout_secs),
        ("health.check_interval_secs", config.health.check_interval_secs),
        ("health.timeout_secs", config.health.timeout_secs),
        ("timeouts.request_secs", config.timeouts.request_secs),
    ];
    for (field, value) in durations {
        if value == 0 {
            errors.push(ValidationError::ZeroDuration(field));
        }
    }

    for check in &config.health.external_checks {
        match url::Url::parse(&check.url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            Ok(parsed) => errors.push(ValidationError::InvalidCheckUrl {
                url: check.url.clone(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            }),
            Err(e) => errors.push(ValidationError::InvalidCheckUrl {
                url: check.url.clone(),
                reason: e.to_string(),
            }),
        }
    }

    for (section, collaborator) in [("database", &config.database), ("redis", &config.redis)] {
        if collaborator.enabled && collaborator.address.trim().is_empty() {
            errors.push(ValidationError::MissingCollaboratorAddress(section));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{ExternalCheckConfig, TlsConfig};

    #[test]
    fn defaults_are_valid() {
        assert_eq!(validate_config(&ServiceConfig::default()), Ok(()));
    }

    #[test]
    fn collects_every_error() {
        let mut config = ServiceConfig::default();
        config.app.name = "  ".into();
        config.listener.bind_address = "not-an-address".into();
        config.app.shutdown_timeout_secs = 0;
        config.listener.tls = Some(TlsConfig {
            cert_path: String::new(),
            key_path: "key.pem".into(),
        });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.contains(&ValidationError::MissingName));
        assert!(errors.contains(&ValidationError::IncompleteTls));
        assert!(errors.contains(&ValidationError::ZeroDuration("app.shutdown_timeout_secs")));
    }

    #[test]
    fn rejects_non_http_check_urls() {
        let mut config = ServiceConfig::default();
        config.health.external_checks.push(ExternalCheckConfig {
            url: "ftp://example.com/status".into(),
            critical: false,
        });
        config.health.external_checks.push(ExternalCheckConfig {
            url: "http://example.com/status".into(),
            critical: true,
        });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ValidationError::InvalidCheckUrl { .. }));
    }

    #[test]
    fn enabled_collaborator_needs_address() {
        let mut config = ServiceConfig::default();
        config.database.enabled = true;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors, vec![ValidationError::MissingCollaboratorAddress("database")]);
    }
}
