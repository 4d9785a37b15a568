//! OS signal handling.
//!
//! # Signals
//! - SIGINT, SIGTERM, SIGQUIT: request termination of this generation
//! - SIGHUP: spawn a successor generation and hand the listener over
//!
//! The listener keeps running after a failed upgrade so the operator can
//! retry; it stops once a termination is requested or the token fires.

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::net::Upgrader;

/// Route process signals to the supervisor until `token` is cancelled.
pub fn spawn_signal_listener(upgrader: Upgrader, token: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sighup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = token.cancelled() => return,
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
                _ = sigquit.recv() => "SIGQUIT",
                _ = sighup.recv() => {
                    tracing::info!(signal = "SIGHUP", "Upgrade requested");
                    match upgrader.trigger_handoff() {
                        Ok(successor) => {
                            tracing::info!(successor_pid = successor.pid(), "Waiting for successor readiness");
                        }
                        Err(error) => {
                            tracing::warn!(error = %error, "Upgrade not started");
                        }
                    }
                    continue;
                }
            };

            tracing::info!(signal = name, "Termination signal received");
            upgrader.request_termination(name);
            return;
        }
    }))
}
