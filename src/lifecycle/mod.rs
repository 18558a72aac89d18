// Lifecycle state machine shared by every long-lived component.

use std::sync::atomic::{AtomicU8, Ordering};

/// States a long-lived component moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Stopped = 0,
    Starting = 1,
    Started = 2,
    Stopping = 3,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LifecycleState::Starting,
            2 => LifecycleState::Started,
            3 => LifecycleState::Stopping,
            _ => LifecycleState::Stopped,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Started => "started",
            LifecycleState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Atomic four-state lifecycle with idempotent transitions.
///
/// `begin_start` succeeds only from `Stopped` and `begin_stop` only from
/// `Started`, so concurrent or repeated start/stop calls collapse into
/// no-ops on all but the first caller.
#[derive(Debug)]
pub struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub fn new() -> Self {
        Self(AtomicU8::new(LifecycleState::Stopped as u8))
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn is(&self, state: LifecycleState) -> bool {
        self.state() == state
    }

    pub fn is_started(&self) -> bool {
        self.is(LifecycleState::Started)
    }

    /// Tries the `Stopped -> Starting` transition. Returns false when the
    /// component is anywhere else in its lifecycle.
    pub fn begin_start(&self) -> bool {
        self.0
            .compare_exchange(
                LifecycleState::Stopped as u8,
                LifecycleState::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Tries the `Started -> Stopping` transition.
    pub fn begin_stop(&self) -> bool {
        self.0
            .compare_exchange(
                LifecycleState::Started as u8,
                LifecycleState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn set_started(&self) {
        self.0.store(LifecycleState::Started as u8, Ordering::Release);
    }

    pub fn set_stopped(&self) {
        self.0.store(LifecycleState::Stopped as u8, Ordering::Release);
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
