//! Metrics collection and exposition.
//!
//! # Metrics
//! - `lifeline_check_executions_total` (counter): probe executions by check, status
//! - `lifeline_check_duration_seconds` (histogram): probe latency by check
//! - `lifeline_check_healthy` (gauge): 1=healthy, 0=unhealthy
//! - `lifeline_shutdown_steps_total` (counter): teardown steps by step, outcome
//! - `lifeline_handoffs_total` (counter): upgrade attempts by outcome
//!
//! The Prometheus recorder is rendered on the main listener (`/metrics`), so
//! the endpoint moves with the socket across generations.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::health::CheckStatus;

/// Install the global Prometheus recorder and return a handle for rendering.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    tracing::info!("Prometheus recorder installed");
    Ok(handle)
}

pub fn record_check(check: &str, status: CheckStatus, elapsed: Duration) {
    counter!(
        "lifeline_check_executions_total",
        "check" => check.to_string(),
        "status" => status.as_str()
    )
    .increment(1);
    histogram!("lifeline_check_duration_seconds", "check" => check.to_string())
        .record(elapsed.as_secs_f64());
    gauge!("lifeline_check_healthy", "check" => check.to_string())
        .set(if status == CheckStatus::Healthy { 1.0 } else { 0.0 });
}

pub fn record_shutdown_step(step: &str, outcome: &'static str) {
    counter!(
        "lifeline_shutdown_steps_total",
        "step" => step.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_handoff(outcome: &'static str) {
    counter!("lifeline_handoffs_total", "outcome" => outcome).increment(1);
}
