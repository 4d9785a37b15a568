//! Orchestrator state machine.
//!
//! ```text
//! Init → Ready → ShuttingDown → Stopped
//!   └──────────────┘
//! ```
//! `ShuttingDown` is entered at most once. Startup failures go straight from
//! `Init` to `ShuttingDown` so `Ready` is never observed externally.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Init = 0,
    Ready = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl From<u8> for Lifecycle {
    fn from(val: u8) -> Self {
        match val {
            1 => Lifecycle::Ready,
            2 => Lifecycle::ShuttingDown,
            3 => Lifecycle::Stopped,
            _ => Lifecycle::Init,
        }
    }
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Init => "init",
            Lifecycle::Ready => "ready",
            Lifecycle::ShuttingDown => "shutting_down",
            Lifecycle::Stopped => "stopped",
        }
    }
}

/// Shared, lock-free lifecycle state read by the probe endpoints.
#[derive(Debug)]
pub struct LifecycleState {
    state: AtomicU8,
    reached_ready: AtomicBool,
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleState {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(Lifecycle::Init as u8),
            reached_ready: AtomicBool::new(false),
        }
    }

    pub fn current(&self) -> Lifecycle {
        Lifecycle::from(self.state.load(Ordering::Acquire))
    }

    /// `Init → Ready`. False if startup already moved on.
    pub fn mark_ready(&self) -> bool {
        let moved = self.transition(Lifecycle::Init, Lifecycle::Ready);
        if moved {
            self.reached_ready.store(true, Ordering::Release);
        }
        moved
    }

    /// Enter `ShuttingDown` from `Init` or `Ready`. True only for the first caller.
    pub fn begin_shutdown(&self) -> bool {
        self.transition(Lifecycle::Ready, Lifecycle::ShuttingDown)
            || self.transition(Lifecycle::Init, Lifecycle::ShuttingDown)
    }

    pub fn mark_stopped(&self) {
        self.state.store(Lifecycle::Stopped as u8, Ordering::Release);
    }

    /// Alive from `Ready` until `Stopped`.
    pub fn is_alive(&self) -> bool {
        self.reached_ready.load(Ordering::Acquire)
            && matches!(self.current(), Lifecycle::Ready | Lifecycle::ShuttingDown)
    }

    fn transition(&self, from: Lifecycle, to: Lifecycle) -> bool {
        let moved = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            tracing::info!(from = from.as_str(), to = to.as_str(), "Lifecycle transition");
        }
        moved
    }
}
