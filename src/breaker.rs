//! Per-client circuit breaker.
//!
//! ```text
//! Closed --threshold failures--> Open --reset elapsed--> HalfOpen
//! HalfOpen --success--> Closed
//! HalfOpen --failure--> Open (reset timer restarts)
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Externally visible breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    failures: u32,
    last_failure: Option<Instant>,
    open: bool,
    // Only ever true while `open` is true.
    half_open: bool,
    threshold: u32,
    reset_after: Duration,
}

/// Counts consecutive final failures and gates new attempts.
///
/// All reads and updates go through one lock that is never held across a
/// network call. In the half-open window every caller is admitted until the
/// probe result is recorded; strict single admission is not enforced.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// A closed breaker. A threshold of zero behaves like one.
    pub fn new(threshold: u32, reset_after: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState {
                failures: 0,
                last_failure: None,
                open: false,
                half_open: false,
                threshold: threshold.max(1),
                reset_after,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Closes the circuit and clears the failure count.
    pub fn record_success(&self) {
        let mut state = self.lock();
        state.failures = 0;
        state.open = false;
        state.half_open = false;
    }

    /// Records a final failure. Returns `true` when this call opened the
    /// circuit or re-opened it after a failed half-open probe.
    pub fn record_failure(&self) -> bool {
        self.record_failure_at(Instant::now())
    }

    pub(crate) fn record_failure_at(&self, now: Instant) -> bool {
        let mut state = self.lock();
        state.failures = state.failures.saturating_add(1);
        state.last_failure = Some(now);

        if state.half_open {
            state.half_open = false;
            state.open = true;
            return true;
        }
        if !state.open && state.failures >= state.threshold {
            state.open = true;
            return true;
        }
        false
    }

    /// Whether a new attempt must be rejected.
    ///
    /// Once the reset duration has passed since the last failure the breaker
    /// moves to half-open and starts admitting a probe.
    pub fn is_open(&self) -> bool {
        self.is_open_at(Instant::now())
    }

    pub(crate) fn is_open_at(&self, now: Instant) -> bool {
        let mut state = self.lock();
        if !state.open || state.half_open {
            return false;
        }
        let elapsed = state
            .last_failure
            .map_or(Duration::MAX, |last| now.saturating_duration_since(last));
        if elapsed >= state.reset_after {
            state.half_open = true;
            return false;
        }
        true
    }

    /// Forces the closed state and discards failure history.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.failures = 0;
        state.last_failure = None;
        state.open = false;
        state.half_open = false;
    }

    pub fn state(&self) -> CircuitState {
        let state = self.lock();
        match (state.open, state.half_open) {
            (false, _) => CircuitState::Closed,
            (true, false) => CircuitState::Open,
            (true, true) => CircuitState::HalfOpen,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }
}
