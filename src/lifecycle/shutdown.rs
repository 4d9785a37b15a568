//! Shutdown sequencing under a single deadline.
//!
//! # Steps, in order
//! 1. stop accepting new connections
//! 2. drain in-flight requests
//! 3. deregister every health check
//! 4. close external collaborators
//! 5. release the listener
//!
//! Every step is time-boxed against the same deadline. A step that fails or
//! times out is logged and the next one still runs.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::time::{self, Instant};

use super::startup::Service;
use crate::net::ExitReason;
use crate::observability::metrics;

/// Absolute deadline shared read-only by every teardown step.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownBudget {
    deadline: Instant,
}

impl ShutdownBudget {
    pub fn starting_now(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Run one step, cut off at the deadline.
    pub async fn run_step<F, E>(&self, step: &'static str, work: F) -> StepOutcome
    where
        F: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        let started = Instant::now();
        let outcome = match time::timeout_at(self.deadline, work).await {
            Ok(Ok(())) => StepOutcome::Completed,
            Ok(Err(error)) => StepOutcome::Failed(error.to_string()),
            Err(_) => StepOutcome::TimedOut,
        };
        record_step(step, &outcome, started.elapsed());
        outcome
    }
}

fn record_step(step: &'static str, outcome: &StepOutcome, elapsed: Duration) {
    match outcome {
        StepOutcome::Completed => {
            tracing::info!(step, ?elapsed, "Shutdown step completed");
        }
        StepOutcome::Failed(error) => {
            tracing::error!(step, error = %error, "Shutdown step failed");
        }
        StepOutcome::TimedOut => {
            tracing::warn!(step, "Shutdown step cut off at deadline");
        }
    }
    metrics::record_shutdown_step(step, outcome.as_str());
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Failed(String),
    TimedOut,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Completed => "completed",
            StepOutcome::Failed(_) => "failed",
            StepOutcome::TimedOut => "timed_out",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, StepOutcome::Completed)
    }
}

#[derive(Debug)]
pub struct ShutdownReport {
    pub reason: ExitReason,
    pub steps: Vec<(&'static str, StepOutcome)>,
    /// Health checks still executing when the deadline hit.
    pub stragglers: Vec<String>,
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.steps.iter().all(|(_, outcome)| outcome.is_completed())
    }

    pub fn outcome(&self, step: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|(name, _)| *name == step).map(|(_, outcome)| outcome)
    }
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("shutdown already in progress")]
    AlreadyStopping,

    #[error("shutdown incomplete: {}", failed_steps(.0))]
    Incomplete(ShutdownReport),
}

fn failed_steps(report: &ShutdownReport) -> String {
    report
        .steps
        .iter()
        .filter(|(_, outcome)| !outcome.is_completed())
        .map(|(step, outcome)| format!("{step} {}", outcome.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Service {
    /// Tear this generation down within the configured shutdown timeout.
    pub async fn shutdown(self, reason: ExitReason) -> Result<ShutdownReport, ShutdownError> {
        if !self.lifecycle.begin_shutdown() {
            return Err(ShutdownError::AlreadyStopping);
        }
        let started = Instant::now();
        let budget = ShutdownBudget::starting_now(self.config.shutdown_timeout());
        tracing::info!(
            reason = %reason,
            generation = %self.generation,
            budget = ?self.config.shutdown_timeout(),
            connections = self.server_handle.connection_count(),
            "Shutting down"
        );

        let Service {
            upgrader,
            registry,
            lifecycle,
            collaborators,
            server_handle,
            mut server_task,
            ..
        } = self;
        let mut steps = Vec::with_capacity(5);

        upgrader.begin_drain();
        server_handle.graceful_shutdown(Some(budget.remaining()));
        record_step("stop_accepting", &StepOutcome::Completed, Duration::ZERO);
        steps.push(("stop_accepting", StepOutcome::Completed));

        let drain = budget
            .run_step("drain", async {
                match (&mut server_task).await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(join) => Err(join.to_string()),
                }
            })
            .await;
        if !drain.is_completed() {
            server_handle.shutdown();
            server_task.abort();
        }
        steps.push(("drain", drain));

        let step_started = Instant::now();
        let stragglers = registry.deregister_all(budget.deadline()).await;
        let deregister = if stragglers.is_empty() {
            StepOutcome::Completed
        } else {
            StepOutcome::TimedOut
        };
        record_step("deregister_checks", &deregister, step_started.elapsed());
        steps.push(("deregister_checks", deregister));

        let close = budget
            .run_step("close_collaborators", async {
                let results = join_all(collaborators.iter().map(|managed| {
                    let collaborator = managed.collaborator.clone();
                    async move {
                        let name = collaborator.name().to_string();
                        collaborator.close().await.map_err(|e| format!("{name}: {e}"))
                    }
                }))
                .await;
                let errors: Vec<String> = results.into_iter().filter_map(Result::err).collect();
                if errors.is_empty() {
                    Ok(())
                } else {
                    Err(errors.join("; "))
                }
            })
            .await;
        steps.push(("close_collaborators", close));

        upgrader.stop();
        record_step("release_listener", &StepOutcome::Completed, Duration::ZERO);
        steps.push(("release_listener", StepOutcome::Completed));

        lifecycle.mark_stopped();
        let report = ShutdownReport {
            reason,
            steps,
            stragglers,
            elapsed: started.elapsed(),
        };

        if report.is_clean() {
            tracing::info!(elapsed = ?report.elapsed, "Shutdown complete");
            Ok(report)
        } else {
            tracing::warn!(elapsed = ?report.elapsed, "Shutdown finished with errors");
            Err(ShutdownError::Incomplete(report))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn steps_are_cut_off_at_the_shared_deadline() {
        let budget = ShutdownBudget::starting_now(Duration::from_secs(2));

        let first = budget
            .run_step("fast", async { Ok::<_, String>(()) })
            .await;
        let second = budget
            .run_step("hang", async {
                time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, String>(())
            })
            .await;
        let third = budget
            .run_step("after_deadline", async { Err::<(), _>("refused") })
            .await;

        assert_eq!(first, StepOutcome::Completed);
        assert_eq!(second, StepOutcome::TimedOut);
        assert_eq!(third, StepOutcome::Failed("refused".into()));
        assert_eq!(budget.remaining(), Duration::ZERO);
    }

    #[test]
    fn report_lists_unfinished_steps() {
        let report = ShutdownReport {
            reason: ExitReason::Terminated("SIGTERM".into()),
            steps: vec![
                ("drain", StepOutcome::Completed),
                ("close_collaborators", StepOutcome::TimedOut),
            ],
            stragglers: Vec::new(),
            elapsed: Duration::from_secs(1),
        };
        assert!(!report.is_clean());
        assert_eq!(report.outcome("close_collaborators"), Some(&StepOutcome::TimedOut));
        assert_eq!(
            ShutdownError::Incomplete(report).to_string(),
            "shutdown incomplete: close_collaborators timed_out"
        );
    }
}
