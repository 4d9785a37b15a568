//! Built-in probes: collaborator pings and external URL checks.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::check::{CheckDescriptor, CheckError, Probe, ProbeOutput};
use crate::collaborators::Collaborator;
use crate::config::HealthConfig;

/// Probe that pings a collaborator.
pub struct CollaboratorProbe {
    collaborator: Arc<dyn Collaborator>,
}

impl CollaboratorProbe {
    pub fn new(collaborator: Arc<dyn Collaborator>) -> Self {
        Self { collaborator }
    }
}

impl Probe for CollaboratorProbe {
    fn check(&self, token: CancellationToken) -> BoxFuture<'static, ProbeOutput> {
        let collaborator = Arc::clone(&self.collaborator);
        Box::pin(async move {
            collaborator
                .ping(token)
                .await
                .map(|()| json!({"status": "healthy"}))
                .map_err(|e| CheckError::failed(format!("{} ping failed: {e}", collaborator.name())))
        })
    }
}

/// Probe that GETs a URL; any 2xx is healthy.
pub struct HttpProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

impl Probe for HttpProbe {
    fn check(&self, token: CancellationToken) -> BoxFuture<'static, ProbeOutput> {
        let request = self.client.get(&self.url);
        let url = self.url.clone();
        Box::pin(async move {
            let response = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(CheckError::failed("check cancelled")),
                response = request.send() => response,
            };
            let response = response.map_err(|e| CheckError::failed(format!("GET {url} failed: {e}")))?;
            let status = response.status();
            if status.is_success() {
                Ok(json!({"status_code": status.as_u16()}))
            } else {
                Err(CheckError::failed(format!("GET {url} returned {status}")))
            }
        })
    }
}

/// Descriptor for a collaborator ping, named after the collaborator.
pub fn collaborator_check(
    collaborator: Arc<dyn Collaborator>,
    critical: bool,
    config: &HealthConfig,
) -> CheckDescriptor {
    let name = collaborator.name().to_string();
    CheckDescriptor::new(name, CollaboratorProbe::new(collaborator))
        .with_initial_delay(config.initial_delay())
        .with_period(config.check_interval())
        .with_timeout(config.timeout())
        .critical(critical)
}

/// Descriptor for an external URL, named `http_<url>`.
pub fn http_check(url: &str, critical: bool, client: reqwest::Client, config: &HealthConfig) -> CheckDescriptor {
    CheckDescriptor::new(format!("http_{url}"), HttpProbe::new(url, client))
        .with_initial_delay(config.external_initial_delay())
        .with_period(config.check_interval())
        .with_timeout(config.timeout())
        .critical(critical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::TcpCollaborator;
    use std::time::Duration;

    #[tokio::test]
    async fn collaborator_probe_reports_ping_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let redis: Arc<dyn Collaborator> = Arc::new(TcpCollaborator::new("redis", address, Duration::from_secs(1)));
        let err = CollaboratorProbe::new(redis).check(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().starts_with("redis ping failed: "));
    }

    #[test]
    fn descriptors_follow_config() {
        let config = HealthConfig::default();
        let db: Arc<dyn Collaborator> = Arc::new(TcpCollaborator::new("database", "localhost:5432", Duration::from_secs(1)));

        let check = collaborator_check(db, true, &config);
        assert_eq!(check.name(), "database");
        assert_eq!(check.initial_delay(), Duration::from_secs(2));
        assert_eq!(check.period(), Duration::from_secs(30));
        assert!(check.is_critical());

        let check = http_check("http://billing.local/health", false, reqwest::Client::new(), &config);
        assert_eq!(check.name(), "http_http://billing.local/health");
        assert_eq!(check.initial_delay(), Duration::from_secs(5));
        assert!(!check.is_critical());
    }
}
