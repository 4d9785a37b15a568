//! Health registry and per-check scheduler.
//!
//! # Responsibilities
//! - Own every registered check and its latest result
//! - Run each check on its own task and timer
//! - Isolate probe faults (errors, timeouts, panics) as `Unhealthy` results
//! - Serve lock-free snapshots while probes are executing
//! - Tear everything down within a deadline on shutdown
//!
//! # Scheduling
//! ```text
//! register ─▶ sleep(initial_delay) ─▶ execute ─▶ record ─▶ sleep(period) ─┐
//!                                        ▲                                │
//!                                        └────────────────────────────────┘
//! ```
//! The next execution is armed from the end of the previous one, so a slow or
//! timed-out run delays only its own check.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use super::check::{CheckDescriptor, CheckError, ProbeOutput};
use super::status::{CheckResult, CheckState, CheckStatus, HealthSnapshot};
use crate::observability::metrics;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("check `{0}` is already registered")]
    DuplicateName(String),

    #[error("check `{0}` is not registered")]
    NotFound(String),

    #[error("check `{0}` must have a non-zero period")]
    InvalidPeriod(String),

    #[error("registry is closed")]
    Closed,
}

struct Entry {
    descriptor: CheckDescriptor,
    result: ArcSwap<CheckResult>,
    token: CancellationToken,
    registered_at: Instant,
}

impl Entry {
    fn state(&self, now: Instant) -> CheckState {
        let result = CheckResult::clone(&self.result.load());
        let grace = self.descriptor.initial_delay() + self.descriptor.period();
        CheckState {
            critical: self.descriptor.is_critical(),
            overdue: result.status == CheckStatus::Pending && now >= self.registered_at + grace,
            result,
        }
    }

    /// Only the entry's own task writes, so load-then-store cannot race.
    fn record(&self, outcome: ProbeOutput, elapsed: Duration) {
        let name = self.descriptor.name();
        let previous = self.result.load();
        let next = previous.advance(outcome, elapsed, Utc::now());

        match (previous.status, next.status) {
            (CheckStatus::Healthy, CheckStatus::Unhealthy) | (CheckStatus::Pending, CheckStatus::Unhealthy) => {
                tracing::warn!(
                    check = %name,
                    error = next.error.as_deref().unwrap_or_default(),
                    critical = self.descriptor.is_critical(),
                    "Check failed"
                );
            }
            (CheckStatus::Unhealthy, CheckStatus::Healthy) => {
                tracing::info!(
                    check = %name,
                    failures = previous.contiguous_failures,
                    "Check recovered"
                );
            }
            _ => {
                tracing::debug!(check = %name, status = %next.status, ?elapsed, "Check executed");
            }
        }

        metrics::record_check(name, next.status, elapsed);
        self.result.store(Arc::new(next));
    }
}

/// Marks a check as executing for as long as it lives.
struct InFlight<'a> {
    map: &'a DashMap<String, usize>,
    name: &'a str,
}

impl<'a> InFlight<'a> {
    fn enter(map: &'a DashMap<String, usize>, name: &'a str) -> Self {
        *map.entry(name.to_string()).or_insert(0) += 1;
        Self { map, name }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(mut count) = self.map.get_mut(self.name) {
            *count = count.saturating_sub(1);
        }
        self.map.remove_if(self.name, |_, count| *count == 0);
    }
}

/// Registry of named, independently scheduled health checks.
///
/// Constructed explicitly and shared through `Arc`; there is no global
/// instance. Must be used from within a tokio runtime.
pub struct HealthRegistry {
    checks: DashMap<String, Arc<Entry>>,
    in_flight: Arc<DashMap<String, usize>>,
    tasks: Mutex<JoinSet<()>>,
    updates: Arc<watch::Sender<u64>>,
    root: CancellationToken,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        let (updates, _) = watch::channel(0);
        Self {
            checks: DashMap::new(),
            in_flight: Arc::new(DashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
            updates: Arc::new(updates),
            root: CancellationToken::new(),
        }
    }

    /// Register a check and schedule its first execution after its initial delay.
    pub fn register(&self, descriptor: CheckDescriptor) -> Result<(), RegistryError> {
        if self.root.is_cancelled() {
            return Err(RegistryError::Closed);
        }
        if descriptor.period().is_zero() {
            return Err(RegistryError::InvalidPeriod(descriptor.name().to_string()));
        }

        let entry = match self.checks.entry(descriptor.name().to_string()) {
            MapEntry::Occupied(_) => {
                return Err(RegistryError::DuplicateName(descriptor.name().to_string()));
            }
            MapEntry::Vacant(slot) => {
                let entry = Arc::new(Entry {
                    descriptor,
                    result: ArcSwap::from_pointee(CheckResult::pending()),
                    token: self.root.child_token(),
                    registered_at: Instant::now(),
                });
                slot.insert(Arc::clone(&entry));
                entry
            }
        };
        // deregister_all may have cleared the map between the first check and the insert
        if self.root.is_cancelled() {
            self.checks
                .remove_if(entry.descriptor.name(), |_, current| Arc::ptr_eq(current, &entry));
            return Err(RegistryError::Closed);
        }

        tracing::info!(
            check = %entry.descriptor.name(),
            initial_delay = ?entry.descriptor.initial_delay(),
            period = ?entry.descriptor.period(),
            timeout = ?entry.descriptor.timeout(),
            critical = entry.descriptor.is_critical(),
            "Health check registered"
        );

        let mut tasks = self.lock_tasks();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(run_check(entry, Arc::clone(&self.in_flight), Arc::clone(&self.updates)));
        Ok(())
    }

    /// Cancel future executions of a check and drop it from snapshots.
    ///
    /// An execution already in flight finishes but its result is discarded.
    pub fn deregister(&self, name: &str) -> Result<(), RegistryError> {
        let (_, entry) = self
            .checks
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        entry.token.cancel();
        tracing::info!(check = %name, "Health check deregistered");
        Ok(())
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let now = Instant::now();
        HealthSnapshot {
            checks: self
                .checks
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().state(now)))
                .collect(),
            taken_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Names of checks whose probe is currently executing.
    pub fn in_flight(&self) -> Vec<String> {
        let mut names: Vec<String> = self.in_flight.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Wait until every critical check has finished at least one execution.
    ///
    /// Returns false if `timeout` elapses first.
    pub async fn wait_for_first_pass(&self, timeout: Duration) -> bool {
        let mut updates = self.updates.subscribe();
        let settled = time::timeout(timeout, async {
            loop {
                let pending = self
                    .checks
                    .iter()
                    .any(|e| e.descriptor.is_critical() && e.result.load().status == CheckStatus::Pending);
                if !pending {
                    return true;
                }
                if updates.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        settled.unwrap_or(false)
    }

    /// Cancel every check and wait for in-flight executions until `deadline`.
    ///
    /// Executions still running at the deadline are aborted and their names
    /// returned. The registry rejects registrations afterwards.
    pub async fn deregister_all(&self, deadline: Instant) -> Vec<String> {
        self.root.cancel();
        self.checks.clear();
        let mut tasks = std::mem::take(&mut *self.lock_tasks());

        let drained = time::timeout_at(deadline, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_ok() {
            tracing::info!("All health checks stopped");
            return Vec::new();
        }

        let stragglers = self.in_flight();
        tracing::warn!(
            stragglers = ?stragglers,
            "Health checks still executing at deadline, abandoning"
        );
        tasks.abort_all();
        stragglers
    }

    fn lock_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_check(entry: Arc<Entry>, in_flight: Arc<DashMap<String, usize>>, updates: Arc<watch::Sender<u64>>) {
    let descriptor = &entry.descriptor;

    tokio::select! {
        biased;
        _ = entry.token.cancelled() => return,
        _ = time::sleep(descriptor.initial_delay()) => {}
    }

    loop {
        let (outcome, elapsed) = {
            let _guard = InFlight::enter(&in_flight, descriptor.name());
            execute(descriptor, entry.token.child_token()).await
        };

        if entry.token.is_cancelled() {
            tracing::debug!(check = %descriptor.name(), "Discarding result of deregistered check");
            return;
        }
        entry.record(outcome, elapsed);
        updates.send_modify(|generation| *generation = generation.wrapping_add(1));

        tokio::select! {
            biased;
            _ = entry.token.cancelled() => return,
            _ = time::sleep(descriptor.period()) => {}
        }
    }
}

async fn execute(descriptor: &CheckDescriptor, token: CancellationToken) -> (ProbeOutput, Duration) {
    let started = Instant::now();
    let probe = descriptor.probe();

    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| probe.check(token))) {
        Ok(future) => future,
        Err(payload) => {
            return (Err(CheckError::Panicked(panic_message(payload.as_ref()))), started.elapsed());
        }
    };

    let outcome = match time::timeout(descriptor.timeout(), AssertUnwindSafe(future).catch_unwind()).await {
        Ok(Ok(output)) => output,
        Ok(Err(payload)) => Err(CheckError::Panicked(panic_message(payload.as_ref()))),
        Err(_) => Err(CheckError::Timeout(descriptor.timeout())),
    };
    (outcome, started.elapsed())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
