//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router: service routes, probe routes, application routes
//! - Wire up middleware (timeout, request id, generation header, tracing)
//! - Serve on a handed-off std listener, plain or TLS
//! - Expose a `Handle` so the lifecycle can drain and count connections

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderName, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::http::probes::ProbeEndpoints;

/// Response header naming the generation that served the request.
pub const GENERATION_HEADER: &str = "x-lifeline-generation";

/// Application state injected into service handlers.
#[derive(Clone)]
pub struct AppState {
    pub name: Arc<str>,
    pub version: Arc<str>,
    pub metrics: Option<PrometheusHandle>,
}

/// HTTP server bound to the generation's listener.
pub struct HttpServer {
    router: Router,
    handle: Handle,
}

impl HttpServer {
    /// Build the server. `app_routes` are merged under the same middleware.
    pub fn new(
        config: &ServiceConfig,
        probes: ProbeEndpoints,
        generation: Uuid,
        metrics: Option<PrometheusHandle>,
        app_routes: Router,
    ) -> Self {
        let state = AppState {
            name: Arc::from(config.app.name.as_str()),
            version: Arc::from(config.app.version.as_str()),
            metrics,
        };
        let router = Self::build_router(config, state, probes, generation, app_routes);
        Self {
            router,
            handle: Handle::new(),
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(
        config: &ServiceConfig,
        state: AppState,
        probes: ProbeEndpoints,
        generation: Uuid,
        app_routes: Router,
    ) -> Router {
        let generation = HeaderValue::from_str(&generation.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("unknown"));

        Router::new()
            .route("/", get(root))
            .route("/ping", get(ping))
            .route("/metrics", get(render_metrics))
            .with_state(state)
            .merge(probes.router())
            .merge(app_routes)
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(SetResponseHeaderLayer::overriding(
                HeaderName::from_static(GENERATION_HEADER),
                generation,
            ))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Handle used to stop accepting, drain, and count connections.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Serve until the handle shuts the server down.
    pub async fn serve(self, listener: std::net::TcpListener, tls: Option<RustlsConfig>) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        let app = self.router.into_make_service();

        match tls {
            Some(tls) => {
                tracing::info!(address = %addr, "HTTPS server starting");
                axum_server::from_tcp_rustls(listener, tls)
                    .handle(self.handle)
                    .serve(app)
                    .await?;
            }
            None => {
                tracing::info!(address = %addr, "HTTP server starting");
                axum_server::from_tcp(listener).handle(self.handle).serve(app).await?;
            }
        }

        tracing::info!(address = %addr, "HTTP server stopped");
        Ok(())
    }
}

async fn ping() -> &'static str {
    "."
}

async fn root(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "message": format!("Welcome to {}", state.name),
        "version": state.version.as_ref(),
    }))
}

async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthRegistry;
    use crate::lifecycle::LifecycleState;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn server(app_routes: Router) -> (HttpServer, Uuid) {
        let probes = ProbeEndpoints::new(Arc::new(HealthRegistry::new()), Arc::new(LifecycleState::new()));
        let generation = Uuid::new_v4();
        (
            HttpServer::new(&ServiceConfig::default(), probes, generation, None, app_routes),
            generation,
        )
    }

    #[tokio::test]
    async fn ping_and_generation_header() {
        let (server, generation) = server(Router::new());
        let response = server
            .router()
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(GENERATION_HEADER).unwrap(),
            generation.to_string().as_str()
        );
        assert!(response.headers().contains_key("x-request-id"));
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b".");
    }

    #[tokio::test]
    async fn root_and_app_routes() {
        let (server, _) = server(Router::new().route("/orders", get(|| async { "orders" })));

        let response = server
            .router()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["message"], "Welcome to lifeline");

        let response = server
            .router()
            .oneshot(Request::builder().uri("/orders").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = server
            .router()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
