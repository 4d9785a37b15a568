//! Check descriptors and the probe abstraction.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// What a single probe execution produces: opaque details or an error.
pub type ProbeOutput = Result<serde_json::Value, CheckError>;

/// Why a probe execution counts as unhealthy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckError {
    #[error("{0}")]
    Failed(String),

    #[error("check timed out after {0:?}")]
    Timeout(Duration),

    #[error("check panicked: {0}")]
    Panicked(String),
}

impl CheckError {
    pub fn failed(reason: impl fmt::Display) -> Self {
        CheckError::Failed(reason.to_string())
    }
}

/// A unit of health evaluation.
///
/// The token is cancelled when the check is deregistered or the registry
/// shuts down; probes may use it to stop early.
pub trait Probe: Send + Sync + 'static {
    fn check(&self, token: CancellationToken) -> BoxFuture<'static, ProbeOutput>;
}

impl<F, Fut> Probe for F
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProbeOutput> + Send + 'static,
{
    fn check(&self, token: CancellationToken) -> BoxFuture<'static, ProbeOutput> {
        Box::pin(self(token))
    }
}

/// Named, independently scheduled check.
///
/// Immutable once handed to the registry.
#[derive(Clone)]
pub struct CheckDescriptor {
    name: String,
    probe: Arc<dyn Probe>,
    initial_delay: Duration,
    period: Duration,
    timeout: Duration,
    critical: bool,
}

impl CheckDescriptor {
    pub fn new(name: impl Into<String>, probe: impl Probe) -> Self {
        Self {
            name: name.into(),
            probe: Arc::new(probe),
            initial_delay: Duration::ZERO,
            period: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            critical: false,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Mark the check as readiness-blocking.
    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }

    pub(crate) fn probe(&self) -> &Arc<dyn Probe> {
        &self.probe
    }
}

impl fmt::Debug for CheckDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckDescriptor")
            .field("name", &self.name)
            .field("initial_delay", &self.initial_delay)
            .field("period", &self.period)
            .field("timeout", &self.timeout)
            .field("critical", &self.critical)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closures_are_probes() {
        let descriptor = CheckDescriptor::new("custom_check", |_token: CancellationToken| async {
            Ok::<_, CheckError>(serde_json::json!({"status": "healthy"}))
        })
        .with_period(Duration::from_secs(5))
        .critical(true);

        assert_eq!(descriptor.name(), "custom_check");
        assert_eq!(descriptor.period(), Duration::from_secs(5));
        assert!(descriptor.is_critical());

        let details = descriptor.probe().check(CancellationToken::new()).await.unwrap();
        assert_eq!(details["status"], "healthy");
    }

    #[test]
    fn error_messages() {
        assert_eq!(CheckError::failed("redis ping failed").to_string(), "redis ping failed");
        assert_eq!(
            CheckError::Timeout(Duration::from_secs(2)).to_string(),
            "check timed out after 2s"
        );
    }
}
