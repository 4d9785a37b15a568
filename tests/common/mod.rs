//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use lifeline::collaborators::{Collaborator, CollaboratorError};
use lifeline::config::ServiceConfig;
use lifeline::net::UpgraderOptions;

/// Config for a generation on an ephemeral loopback port with short timeouts.
pub fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.app.name = "lifeline-test".into();
    config.app.shutdown_timeout_secs = 5;
    config.listener.bind_address = "127.0.0.1:0".into();
    config.listener.upgrade_timeout_secs = 5;
    config.health.initial_delay_secs = 0;
    config.health.check_interval_secs = 1;
    config.health.timeout_secs = 1;
    config.timeouts.request_secs = 10;
    config
}

/// Successor program that signals readiness and exits.
pub fn ready_successor() -> UpgraderOptions {
    shell_successor("printf r >&3")
}

pub fn shell_successor(script: &str) -> UpgraderOptions {
    UpgraderOptions::new("/bin/sh")
        .with_args(["-c", script])
        .with_ready_timeout(Duration::from_secs(5))
}

/// Scriptable collaborator that counts calls.
pub struct ScriptedCollaborator {
    name: String,
    reachable: bool,
    hang_on_close: bool,
    pub pings: AtomicUsize,
    pub closes: AtomicUsize,
}

impl ScriptedCollaborator {
    pub fn reachable(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, true, false))
    }

    pub fn unreachable(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, false, false))
    }

    /// Pings fine but never finishes closing.
    pub fn hanging(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, true, true))
    }

    fn build(name: &str, reachable: bool, hang_on_close: bool) -> Self {
        Self {
            name: name.to_string(),
            reachable,
            hang_on_close,
            pings: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }
}

impl Collaborator for ScriptedCollaborator {
    fn name(&self) -> &str {
        &self.name
    }

    fn ping(&self, _token: CancellationToken) -> BoxFuture<'_, Result<(), CollaboratorError>> {
        Box::pin(async move {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.reachable {
                Ok(())
            } else {
                Err(CollaboratorError::Other {
                    name: self.name.clone(),
                    reason: "connection refused".into(),
                })
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), CollaboratorError>> {
        Box::pin(async move {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.hang_on_close {
                std::future::pending::<()>().await;
            }
            Ok(())
        })
    }
}

/// Start a programmable HTTP backend on an ephemeral port.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let (status, body) = f().await;
                        let status_text = match status {
                            200 => "200 OK",
                            404 => "404 Not Found",
                            500 => "500 Internal Server Error",
                            503 => "503 Service Unavailable",
                            _ => "200 OK",
                        };

                        let response_str = format!(
                            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response_str.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Client that opens a fresh connection per request.
pub fn fresh_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}
