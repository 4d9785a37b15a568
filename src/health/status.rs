//! Check results and point-in-time snapshots.
//!
//! # States
//! - Pending: registered, first execution not finished yet
//! - Healthy: last execution succeeded
//! - Unhealthy: last execution failed, timed out or panicked
//!
//! A `Pending` check only counts against aggregate health once it is overdue,
//! i.e. `initial_delay + period` has elapsed since registration.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::check::ProbeOutput;

/// Status of the latest execution of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pending,
    Healthy,
    Unhealthy,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Pending => "pending",
            CheckStatus::Healthy => "healthy",
            CheckStatus::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest result of one check.
///
/// Replaced wholesale on every execution, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub status: CheckStatus,

    /// Opaque payload returned by the probe on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// When the latest execution finished. `None` while pending.
    pub observed_at: Option<DateTime<Utc>>,

    /// Wall time of the latest execution, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Failed executions in a row, reset by the next success.
    pub contiguous_failures: u32,

    /// Start of the current failure streak.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_failure_at: Option<DateTime<Utc>>,
}

impl CheckResult {
    pub fn pending() -> Self {
        Self {
            status: CheckStatus::Pending,
            details: None,
            error: None,
            observed_at: None,
            duration_ms: None,
            contiguous_failures: 0,
            first_failure_at: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == CheckStatus::Healthy
    }

    /// Build the result that follows `self` after an execution finished at `now`.
    ///
    /// `observed_at` never moves backwards, even if the wall clock does.
    pub(crate) fn advance(&self, outcome: ProbeOutput, elapsed: Duration, now: DateTime<Utc>) -> Self {
        let observed_at = match self.observed_at {
            Some(previous) if previous > now => previous,
            _ => now,
        };
        let duration_ms = Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));

        match outcome {
            Ok(details) => Self {
                status: CheckStatus::Healthy,
                details: Some(details),
                error: None,
                observed_at: Some(observed_at),
                duration_ms,
                contiguous_failures: 0,
                first_failure_at: None,
            },
            Err(error) => Self {
                status: CheckStatus::Unhealthy,
                details: None,
                error: Some(error.to_string()),
                observed_at: Some(observed_at),
                duration_ms,
                contiguous_failures: self.contiguous_failures.saturating_add(1),
                first_failure_at: self.first_failure_at.or(Some(observed_at)),
            },
        }
    }
}

/// One check as seen by a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckState {
    /// Whether this check gates readiness.
    pub critical: bool,

    /// Pending past `initial_delay + period`.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub overdue: bool,

    #[serde(flatten)]
    pub result: CheckResult,
}

impl CheckState {
    /// Counts against aggregate health.
    pub fn is_failing(&self) -> bool {
        self.result.status == CheckStatus::Unhealthy || self.overdue
    }
}

/// Overall verdict for the detailed health report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Healthy,
    /// Only non-critical checks are failing.
    Degraded,
    /// At least one critical check is failing.
    Unhealthy,
}

/// Point-in-time view of every registered check.
///
/// Aggregates are derived on read, never stored.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub checks: BTreeMap<String, CheckState>,
    pub taken_at: DateTime<Utc>,
}

impl HealthSnapshot {
    /// False if any check is unhealthy or overdue on its first run.
    pub fn is_healthy(&self) -> bool {
        !self.checks.values().any(CheckState::is_failing)
    }

    /// True iff every critical check is healthy.
    pub fn is_ready(&self) -> bool {
        self.checks
            .values()
            .filter(|c| c.critical)
            .all(|c| c.result.is_healthy())
    }

    pub fn verdict(&self) -> Verdict {
        let mut degraded = false;
        for check in self.checks.values().filter(|c| c.is_failing()) {
            if check.critical {
                return Verdict::Unhealthy;
            }
            degraded = true;
        }
        if degraded {
            Verdict::Degraded
        } else {
            Verdict::Healthy
        }
    }

    pub fn get(&self, name: &str) -> Option<&CheckState> {
        self.checks.get(name)
    }

    pub fn status_of(&self, name: &str) -> Option<CheckStatus> {
        self.get(name).map(|c| c.result.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::check::CheckError;

    fn state(status: CheckStatus, critical: bool) -> CheckState {
        let mut result = CheckResult::pending();
        result.status = status;
        CheckState {
            critical,
            overdue: false,
            result,
        }
    }

    fn snapshot(checks: Vec<(&str, CheckState)>) -> HealthSnapshot {
        HealthSnapshot {
            checks: checks.into_iter().map(|(n, s)| (n.to_string(), s)).collect(),
            taken_at: Utc::now(),
        }
    }

    #[test]
    fn failure_streak_tracks_first_failure() {
        let start = Utc::now();
        let first = CheckResult::pending().advance(
            Err(CheckError::Failed("refused".into())),
            Duration::from_millis(5),
            start,
        );
        let second = first.advance(
            Err(CheckError::Timeout(Duration::from_secs(1))),
            Duration::from_secs(1),
            start + chrono::Duration::seconds(5),
        );

        assert_eq!(second.status, CheckStatus::Unhealthy);
        assert_eq!(second.contiguous_failures, 2);
        assert_eq!(second.first_failure_at, Some(start));
        assert_eq!(
            second.error,
            Some(CheckError::Timeout(Duration::from_secs(1)).to_string())
        );

        let recovered = second.advance(Ok(serde_json::json!({"ok": true})), Duration::ZERO, start + chrono::Duration::seconds(10));
        assert_eq!(recovered.contiguous_failures, 0);
        assert_eq!(recovered.first_failure_at, None);
        assert!(recovered.error.is_none());
    }

    #[test]
    fn observed_at_never_goes_backwards() {
        let now = Utc::now();
        let first = CheckResult::pending().advance(Ok(serde_json::Value::Null), Duration::ZERO, now);
        let second = first.advance(
            Ok(serde_json::Value::Null),
            Duration::ZERO,
            now - chrono::Duration::seconds(30),
        );
        assert_eq!(second.observed_at, Some(now));
    }

    #[test]
    fn pending_within_grace_is_not_failing() {
        let snap = snapshot(vec![("db", state(CheckStatus::Pending, true))]);
        assert!(snap.is_healthy());
        assert!(!snap.is_ready());
        assert_eq!(snap.verdict(), Verdict::Healthy);
    }

    #[test]
    fn overdue_pending_fails_aggregate() {
        let mut db = state(CheckStatus::Pending, true);
        db.overdue = true;
        let snap = snapshot(vec![("db", db)]);
        assert!(!snap.is_healthy());
        assert_eq!(snap.verdict(), Verdict::Unhealthy);
    }

    #[test]
    fn non_critical_failure_degrades() {
        let snap = snapshot(vec![
            ("db", state(CheckStatus::Healthy, true)),
            ("http_billing", state(CheckStatus::Unhealthy, false)),
        ]);
        assert!(!snap.is_healthy());
        assert!(snap.is_ready());
        assert_eq!(snap.verdict(), Verdict::Degraded);
    }

    #[test]
    fn critical_failure_blocks_readiness() {
        let snap = snapshot(vec![
            ("db", state(CheckStatus::Unhealthy, true)),
            ("redis", state(CheckStatus::Healthy, true)),
        ]);
        assert!(!snap.is_ready());
        assert_eq!(snap.verdict(), Verdict::Unhealthy);
    }

    #[test]
    fn empty_snapshot_is_healthy_and_ready() {
        let snap = snapshot(Vec::new());
        assert!(snap.is_healthy());
        assert!(snap.is_ready());
    }
}
