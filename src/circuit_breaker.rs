// src/circuit_breaker.rs

use crate::key_state::{CircuitState, KeyState};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Per-key circuit breaker policy.
///
/// The state itself lives in each [`KeyState`]; this type holds the shared
/// thresholds and drives transitions. Open→half-open happens lazily: the
/// next read of the state past the reset timer performs the transition.
///
/// Mutating methods return whether the circuit transitioned into open so the
/// caller can fire the circuit-open hook outside its own locks; the hook must
/// fire exactly on closed→open and half-open→open, never on an already-open
/// key.
#[derive(Debug, Clone)]
pub struct CircuitBreakerPolicy {
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreakerPolicy {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
        }
    }

    /// Current state after applying the lazy open→half-open transition.
    pub fn current_state(&self, state: &mut KeyState, now: Instant) -> CircuitState {
        if state.circuit == CircuitState::Open {
            if let Some(open_until) = state.circuit_open_until {
                if now >= open_until {
                    debug!("circuit transitioning to half-open");
                    state.circuit = CircuitState::HalfOpen;
                    state.circuit_open_until = None;
                }
            }
        }
        state.circuit
    }

    /// Record a failed attempt. Returns true when this call opened the circuit.
    pub fn record_failure(&self, key_id: &str, state: &mut KeyState, now: Instant) -> bool {
        let observed = self.current_state(state, now);
        state.consecutive_failures += 1;

        match observed {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.failure_threshold {
                    warn!(
                        key.id = %key_id,
                        failures = state.consecutive_failures,
                        threshold = self.failure_threshold,
                        "circuit opening due to consecutive failures"
                    );
                    self.open(state, now);
                    return true;
                }
                false
            }
            CircuitState::HalfOpen => {
                warn!(key.id = %key_id, "circuit reopening after failed probe");
                self.open(state, now);
                true
            }
            // Already failing fast; just count.
            CircuitState::Open => false,
        }
    }

    /// Record a successful attempt.
    pub fn record_success(&self, key_id: &str, state: &mut KeyState, now: Instant) {
        let observed = self.current_state(state, now);
        match observed {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                info!(key.id = %key_id, "circuit closing after successful probe");
                state.circuit = CircuitState::Closed;
                state.circuit_open_until = None;
                state.consecutive_failures = 0;
            }
            CircuitState::Open => {
                // Only reachable through operator overrides racing a dispatch.
                warn!(key.id = %key_id, "success recorded while circuit open");
            }
        }
    }

    /// Operator override: open the circuit now. Returns true unless it was
    /// already open.
    pub fn force_open(&self, key_id: &str, state: &mut KeyState, now: Instant) -> bool {
        if self.current_state(state, now) == CircuitState::Open {
            return false;
        }
        warn!(key.id = %key_id, "circuit forced open");
        self.open(state, now);
        true
    }

    /// Operator override: close the circuit and clear the failure counter.
    pub fn force_close(&self, key_id: &str, state: &mut KeyState) {
        info!(key.id = %key_id, "circuit forced closed");
        state.circuit = CircuitState::Closed;
        state.circuit_open_until = None;
        state.consecutive_failures = 0;
    }

    /// Time left on the reset timer, if the circuit is open.
    pub fn remaining_open(&self, state: &KeyState, now: Instant) -> Option<Duration> {
        match (state.circuit, state.circuit_open_until) {
            (CircuitState::Open, Some(until)) => {
                Some(until.saturating_duration_since(now))
            }
            _ => None,
        }
    }

    fn open(&self, state: &mut KeyState, now: Instant) {
        state.circuit = CircuitState::Open;
        state.circuit_open_until = Some(now + self.reset_timeout);
    }
}
