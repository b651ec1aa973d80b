//! Per-device transition state machine.
//!
//! `idle -> {increase,decrease}_pending -> debounce -> idle`, with two
//! distinct timeouts: `transition` models physical settling time before a
//! new reading is trustworthy, `debounce` models the minimum interval
//! between successive commands. The state machine itself is pure and
//! synchronous — it stores absolute deadlines and is advanced by the
//! caller handing it the current time (`poll`) — so it is testable
//! without a running timer and without pausing any runtime clock. The
//! owning [`crate::service::Service`] is responsible for actually waking
//! up close to those deadlines.

use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors this state machine refuses to silently swallow.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    #[error("transition re-entry: device is not idle")]
    Reentrant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Increase,
    Decrease,
}

/// The device's transition state, read-only to everything but the owning
/// device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransitionState {
    Idle,
    Pending {
        kind: PendingKind,
        expected_future_consumption: f64,
    },
    Debounce,
}

impl TransitionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, TransitionState::Idle)
    }

    /// `true` for any non-absent state — the load manager must skip a
    /// device for which this returns `true`.
    pub fn is_in_flight(&self) -> bool {
        !self.is_idle()
    }

    pub fn pending_kind(&self) -> Option<PendingKind> {
        match self {
            TransitionState::Pending { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn expected_future_consumption(&self) -> Option<f64> {
        match self {
            TransitionState::Pending {
                expected_future_consumption,
                ..
            } => Some(*expected_future_consumption),
            _ => None,
        }
    }
}

/// The timer-bearing half of the state machine.
#[derive(Debug, Clone)]
pub struct Transition {
    state: TransitionState,
    transition_deadline: Option<Instant>,
    debounce_deadline: Option<Instant>,
}

impl Default for Transition {
    fn default() -> Self {
        Self::new()
    }
}

impl Transition {
    pub fn new() -> Self {
        Self {
            state: TransitionState::Idle,
            transition_deadline: None,
            debounce_deadline: None,
        }
    }

    pub fn state(&self) -> TransitionState {
        self.state
    }

    /// Enter `{increase,decrease}_pending`. Refused (no-op, logged by the
    /// caller) if not currently idle — re-entry is a programming error
    /// re-entry is a programming error.
    pub fn begin_pending(
        &mut self,
        kind: PendingKind,
        expected_future_consumption: f64,
        now: Instant,
        transition_ms: u64,
        debounce_ms: u64,
    ) -> Result<(), TransitionError> {
        if !self.state.is_idle() {
            return Err(TransitionError::Reentrant);
        }
        self.state = TransitionState::Pending {
            kind,
            expected_future_consumption,
        };
        self.transition_deadline = Some(now + Duration::from_millis(transition_ms));
        self.debounce_deadline = Some(now + Duration::from_millis(transition_ms + debounce_ms));
        Ok(())
    }

    /// Cancel any outstanding timers and return to idle.
    pub fn reset(&mut self) {
        self.state = TransitionState::Idle;
        self.transition_deadline = None;
        self.debounce_deadline = None;
    }

    /// Advance state for elapsed deadlines. Idempotent; safe to call on
    /// every scheduler wakeup regardless of whether this device's
    /// deadline was the one that fired. Returns `true` if state changed.
    pub fn poll(&mut self, now: Instant) -> bool {
        let mut changed = false;
        if matches!(self.state, TransitionState::Pending { .. }) {
            if let Some(deadline) = self.transition_deadline {
                if now >= deadline {
                    self.state = TransitionState::Debounce;
                    self.transition_deadline = None;
                    changed = true;
                }
            }
        }
        if matches!(self.state, TransitionState::Debounce) {
            if let Some(deadline) = self.debounce_deadline {
                if now >= deadline {
                    self.state = TransitionState::Idle;
                    self.debounce_deadline = None;
                    changed = true;
                }
            }
        }
        changed
    }

    /// The next instant this machine needs to be polled, if any — used by
    /// the scheduler to compute how long it may sleep.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.transition_deadline.or(self.debounce_deadline)
    }
}
