//! Probe endpoints for orchestrators.
//!
//! # Endpoints
//! - `/healthz`: aggregate health, 200 or 503
//! - `/readiness`: critical checks healthy and lifecycle `Ready`, 200 or 503
//! - `/liveness`: process reached `Ready` and is not stopped, 200 or 503
//! - `/health`: full snapshot; 200 while healthy or degraded, 503 otherwise
//!
//! Every endpoint answers from the latest snapshot and never waits on a probe.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::health::{CheckState, CheckStatus, HealthRegistry, Verdict};
use crate::lifecycle::{Lifecycle, LifecycleState};

#[derive(Debug, Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub checks: BTreeMap<String, CheckStatus>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: Verdict,
    pub lifecycle: &'static str,
    pub timestamp: DateTime<Utc>,
    pub checks: BTreeMap<String, CheckState>,
}

/// Read-only view over the registry and lifecycle state.
#[derive(Clone)]
pub struct ProbeEndpoints {
    registry: Arc<HealthRegistry>,
    lifecycle: Arc<LifecycleState>,
}

impl ProbeEndpoints {
    pub fn new(registry: Arc<HealthRegistry>, lifecycle: Arc<LifecycleState>) -> Self {
        Self { registry, lifecycle }
    }

    pub fn liveness(&self) -> bool {
        self.lifecycle.is_alive()
    }

    pub fn is_healthy(&self) -> bool {
        self.registry.snapshot().is_healthy()
    }

    pub fn readiness(&self) -> ReadinessReport {
        let snapshot = self.registry.snapshot();
        ReadinessReport {
            ready: self.lifecycle.current() == Lifecycle::Ready && snapshot.is_ready(),
            checks: snapshot
                .checks
                .iter()
                .map(|(name, state)| (name.clone(), state.result.status))
                .collect(),
        }
    }

    pub fn health(&self) -> HealthReport {
        let snapshot = self.registry.snapshot();
        HealthReport {
            status: snapshot.verdict(),
            lifecycle: self.lifecycle.current().as_str(),
            timestamp: snapshot.taken_at,
            checks: snapshot.checks,
        }
    }

    /// Routes for the four probe endpoints.
    pub fn router(self) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .route("/readiness", get(readiness))
            .route("/liveness", get(liveness))
            .route("/health", get(health))
            .with_state(self)
    }
}

fn status_code(ok: bool) -> StatusCode {
    if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn healthz(State(probes): State<ProbeEndpoints>) -> impl IntoResponse {
    let healthy = probes.is_healthy();
    let status = if healthy { "healthy" } else { "unhealthy" };
    (status_code(healthy), Json(serde_json::json!({ "status": status })))
}

async fn readiness(State(probes): State<ProbeEndpoints>) -> impl IntoResponse {
    let report = probes.readiness();
    if !report.ready {
        tracing::debug!(lifecycle = probes.lifecycle.current().as_str(), "Readiness probe failing");
    }
    (status_code(report.ready), Json(report))
}

async fn liveness(State(probes): State<ProbeEndpoints>) -> impl IntoResponse {
    let alive = probes.liveness();
    (status_code(alive), Json(serde_json::json!({ "alive": alive })))
}

async fn health(State(probes): State<ProbeEndpoints>) -> impl IntoResponse {
    let report = probes.health();
    (status_code(report.status != Verdict::Unhealthy), Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{CheckDescriptor, CheckError};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    async fn get_json(router: Router, path: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn probe(healthy: bool) -> impl Fn(CancellationToken) -> futures_util::future::Ready<crate::health::ProbeOutput> + Send + Sync + 'static {
        move |_token| {
            futures_util::future::ready(if healthy {
                Ok(json!({"status": "healthy"}))
            } else {
                Err(CheckError::failed("unreachable"))
            })
        }
    }

    fn endpoints() -> (ProbeEndpoints, Arc<HealthRegistry>, Arc<LifecycleState>) {
        let registry = Arc::new(HealthRegistry::new());
        let lifecycle = Arc::new(LifecycleState::new());
        (ProbeEndpoints::new(registry.clone(), lifecycle.clone()), registry, lifecycle)
    }

    #[tokio::test]
    async fn liveness_follows_lifecycle() {
        let (probes, _, lifecycle) = endpoints();

        let (status, body) = get_json(probes.clone().router(), "/liveness").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, json!({"alive": false}));

        lifecycle.mark_ready();
        let (status, body) = get_json(probes.clone().router(), "/liveness").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"alive": true}));

        lifecycle.begin_shutdown();
        let (status, _) = get_json(probes.clone().router(), "/liveness").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = get_json(probes.router(), "/readiness").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test(start_paused = true)]
    async fn non_critical_failure_degrades_but_stays_ready() {
        let (probes, registry, lifecycle) = endpoints();
        lifecycle.mark_ready();
        registry
            .register(CheckDescriptor::new("database", probe(true)).critical(true))
            .unwrap();
        registry
            .register(CheckDescriptor::new("http_http://billing.local", probe(false)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (status, body) = get_json(probes.clone().router(), "/healthz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, json!({"status": "unhealthy"}));

        let (status, body) = get_json(probes.clone().router(), "/readiness").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
        assert_eq!(body["checks"]["database"], "healthy");
        assert_eq!(body["checks"]["http_http://billing.local"], "unhealthy");

        let (status, body) = get_json(probes.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["lifecycle"], "ready");
        assert_eq!(body["checks"]["http_http://billing.local"]["error"], "unreachable");
        assert_eq!(body["checks"]["http_http://billing.local"]["critical"], false);
        assert_eq!(body["checks"]["database"]["contiguous_failures"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn critical_failure_fails_everything_but_liveness() {
        let (probes, registry, lifecycle) = endpoints();
        lifecycle.mark_ready();
        registry
            .register(CheckDescriptor::new("database", probe(false)).critical(true))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (status, body) = get_json(probes.clone().router(), "/readiness").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, json!({"ready": false, "checks": {"database": "unhealthy"}}));

        let (status, body) = get_json(probes.clone().router(), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");

        let (status, _) = get_json(probes.router(), "/liveness").await;
        assert_eq!(status, StatusCode::OK);
    }
}
