//! Startup orchestration.
//!
//! # Steps, in order
//! 1. acquire the listener (inherited or fresh)
//! 2. start serving traffic on it
//! 3. ping collaborators, then enter `Ready`
//! 4. register health checks (failures are logged, not fatal)
//! 5. signal readiness to the predecessor generation
//!
//! Failures in steps 1-3 and 5 abort startup with the originating error after
//! releasing whatever was already acquired. Nothing here exits the process.
//!
//! If an exit was requested while starting, step 5 is skipped and the
//! returned `Service` shuts down as soon as `run_until_exit` is called.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum_server::Handle;
use metrics_exporter_prometheus::PrometheusHandle;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::shutdown::ShutdownReport;
use super::state::LifecycleState;
use crate::collaborators::{Collaborator, CollaboratorError};
use crate::config::{CollaboratorConfig, ServiceConfig};
use crate::health::probes::{collaborator_check, http_check};
use crate::health::{CheckDescriptor, HealthRegistry};
use crate::http::{HttpServer, ProbeEndpoints};
use crate::net::tls::load_tls_config;
use crate::net::{ExitReason, HandoffError, Upgrader};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to acquire listener: {0}")]
    Listen(#[source] HandoffError),

    #[error("failed to load TLS material: {0}")]
    Tls(#[source] std::io::Error),

    #[error("server failed to start: {0}")]
    Serve(String),

    #[error("collaborator {name} unavailable at startup: {source}")]
    Collaborator {
        name: String,
        #[source]
        source: CollaboratorError,
    },

    #[error("failed to signal readiness: {0}")]
    Ready(#[source] HandoffError),
}

/// A collaborator together with its startup and health policy.
#[derive(Clone)]
pub struct ManagedCollaborator {
    pub collaborator: Arc<dyn Collaborator>,
    /// Unreachable at startup aborts startup.
    pub startup_blocking: bool,
    /// The health check gates readiness.
    pub critical: bool,
    /// Register a periodic health check.
    pub health_check: bool,
}

impl ManagedCollaborator {
    pub fn new(collaborator: Arc<dyn Collaborator>) -> Self {
        Self {
            collaborator,
            startup_blocking: true,
            critical: true,
            health_check: true,
        }
    }

    pub fn from_config(collaborator: Arc<dyn Collaborator>, config: &CollaboratorConfig, health_check: bool) -> Self {
        Self {
            collaborator,
            startup_blocking: config.startup_blocking,
            critical: config.critical,
            health_check,
        }
    }

    pub fn startup_blocking(mut self, blocking: bool) -> Self {
        self.startup_blocking = blocking;
        self
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }
}

/// Dependencies of one generation, assembled before `startup`.
pub struct Orchestrator {
    config: Arc<ServiceConfig>,
    upgrader: Upgrader,
    collaborators: Vec<ManagedCollaborator>,
    checks: Vec<CheckDescriptor>,
    routes: Router,
    metrics: Option<PrometheusHandle>,
    http_client: reqwest::Client,
}

impl Orchestrator {
    pub fn new(config: Arc<ServiceConfig>, upgrader: Upgrader) -> Self {
        Self {
            config,
            upgrader,
            collaborators: Vec::new(),
            checks: Vec::new(),
            routes: Router::new(),
            metrics: None,
            http_client: reqwest::Client::new(),
        }
    }

    pub fn with_collaborator(mut self, collaborator: ManagedCollaborator) -> Self {
        self.collaborators.push(collaborator);
        self
    }

    /// Register an extra check alongside the built-in ones.
    pub fn with_check(mut self, check: CheckDescriptor) -> Self {
        self.checks.push(check);
        self
    }

    /// Application routes served next to the probe endpoints.
    pub fn with_routes(mut self, routes: Router) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = client;
        self
    }

    pub async fn startup(self) -> Result<Service, StartupError> {
        let Orchestrator {
            config,
            upgrader,
            collaborators,
            checks,
            routes,
            metrics,
            http_client,
        } = self;
        let lifecycle = Arc::new(LifecycleState::new());
        let registry = Arc::new(HealthRegistry::new());

        // 1
        let listener = upgrader
            .listen(&config.listener.network, &config.listener.bind_address)
            .map_err(StartupError::Listen)?;
        let address = listener.address;
        let generation = listener.generation;

        // 2
        let tls = match &config.listener.tls {
            Some(tls) => match load_tls_config(tls).await {
                Ok(tls) => Some(tls),
                Err(error) => {
                    abandon(&upgrader, &lifecycle);
                    return Err(StartupError::Tls(error));
                }
            },
            None => None,
        };

        let probes = ProbeEndpoints::new(registry.clone(), lifecycle.clone());
        let server = HttpServer::new(&config, probes, generation, metrics.clone(), routes);
        let server_handle = server.handle();
        let fatal = upgrader.clone();
        let mut server_task = tokio::spawn(async move {
            let result = server.serve(listener.listener, tls).await;
            if let Err(error) = &result {
                tracing::error!(error = %error, "Server failed");
                fatal.report_fatal(format!("server error: {error}"));
            }
            result
        });

        if server_handle.listening().await.is_none() {
            let reason = match (&mut server_task).await {
                Ok(Err(error)) => error.to_string(),
                Ok(Ok(())) => "server stopped before listening".to_string(),
                Err(join) => join.to_string(),
            };
            abandon(&upgrader, &lifecycle);
            return Err(StartupError::Serve(reason));
        }

        let service = Service {
            config: config.clone(),
            upgrader: upgrader.clone(),
            registry: registry.clone(),
            lifecycle: lifecycle.clone(),
            collaborators: collaborators.clone(),
            server_handle,
            server_task,
            address,
            generation,
        };

        // 3
        for managed in &collaborators {
            let name = managed.collaborator.name().to_string();
            match ping_once(managed.collaborator.as_ref(), &config).await {
                Ok(()) => tracing::info!(collaborator = %name, "Collaborator reachable"),
                Err(source) if managed.startup_blocking => {
                    tracing::error!(collaborator = %name, error = %source, "Collaborator unreachable, aborting startup");
                    service.teardown(format!("collaborator {name} unavailable")).await;
                    return Err(StartupError::Collaborator { name, source });
                }
                Err(error) => {
                    tracing::warn!(collaborator = %name, error = %error, "Collaborator unreachable, continuing");
                }
            }
        }
        lifecycle.mark_ready();

        // 4
        if config.health.enabled {
            let builtin = collaborators
                .iter()
                .filter(|managed| managed.health_check)
                .map(|managed| collaborator_check(managed.collaborator.clone(), managed.critical, &config.health));
            let external = config
                .health
                .external_checks
                .iter()
                .map(|check| http_check(&check.url, check.critical, http_client.clone(), &config.health));

            for descriptor in builtin.chain(external).chain(checks) {
                let name = descriptor.name().to_string();
                if let Err(error) = registry.register(descriptor) {
                    tracing::warn!(check = %name, error = %error, "Failed to register health check");
                }
            }
        } else {
            tracing::info!("Health checks disabled");
        }

        // 5
        if config.health.await_first_pass && !registry.wait_for_first_pass(config.health.first_pass_timeout()).await {
            tracing::warn!(
                timeout = ?config.health.first_pass_timeout(),
                "Critical checks did not complete a first pass, signalling ready anyway"
            );
        }
        if let Some(reason) = upgrader.exit_reason() {
            tracing::info!(reason = %reason, "Exit requested during startup, not signalling readiness");
            return Ok(service);
        }
        if let Err(error) = upgrader.signal_ready() {
            service.teardown(format!("ready signal failed: {error}")).await;
            return Err(StartupError::Ready(error));
        }

        tracing::info!(
            address = %address,
            generation = %generation,
            checks = registry.len(),
            "Startup complete"
        );
        Ok(service)
    }
}

async fn ping_once(collaborator: &dyn Collaborator, config: &ServiceConfig) -> Result<(), CollaboratorError> {
    let timeout = config.health.timeout();
    match time::timeout(timeout, collaborator.ping(CancellationToken::new())).await {
        Ok(result) => result,
        Err(_) => Err(CollaboratorError::Timeout {
            name: collaborator.name().to_string(),
            after: timeout,
        }),
    }
}

/// Release a listener that never started serving.
fn abandon(upgrader: &Upgrader, lifecycle: &LifecycleState) {
    lifecycle.begin_shutdown();
    upgrader.stop();
    lifecycle.mark_stopped();
}

/// A generation that completed startup and is serving.
pub struct Service {
    pub(super) config: Arc<ServiceConfig>,
    pub(super) upgrader: Upgrader,
    pub(super) registry: Arc<HealthRegistry>,
    pub(super) lifecycle: Arc<LifecycleState>,
    pub(super) collaborators: Vec<ManagedCollaborator>,
    pub(super) server_handle: Handle,
    pub(super) server_task: JoinHandle<std::io::Result<()>>,
    pub(super) address: SocketAddr,
    pub(super) generation: Uuid,
}

impl Service {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn generation(&self) -> Uuid {
        self.generation
    }

    pub fn upgrader(&self) -> &Upgrader {
        &self.upgrader
    }

    pub fn registry(&self) -> &Arc<HealthRegistry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleState> {
        &self.lifecycle
    }

    /// Open connections on this generation's listener.
    pub fn connection_count(&self) -> usize {
        self.server_handle.connection_count()
    }

    /// Block until termination, upgrade completion or a fatal serving error,
    /// then shut down.
    pub async fn run_until_exit(self) -> Result<ShutdownReport, super::shutdown::ShutdownError> {
        let reason = self.upgrader.await_exit().await;
        self.shutdown(reason).await
    }

    async fn teardown(self, reason: String) {
        if let Err(error) = self.shutdown(ExitReason::Fatal(reason)).await {
            tracing::warn!(error = %error, "Teardown after failed startup was incomplete");
        }
    }
}
