// src/key_state.rs

use crate::config::KeyConfig;
use crate::rate_limiter::TokenBucket;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;

/// Circuit breaker state of a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast; no attempts until the reset timer elapses.
    Open,
    /// Probing: one failure reopens, one success closes.
    HalfOpen,
}

/// Mutable runtime state of a single key.
///
/// Nothing here references the components that operate on it; the components
/// are handed `&mut KeyState` by the pool, which owns the collection.
#[derive(Debug, Clone)]
pub struct KeyState {
    /// Requests counted against the quota in the current period.
    pub quota_used: u64,
    /// When the current quota period began (UTC).
    pub period_start: DateTime<Utc>,
    /// Whether the warning hook already fired this period.
    pub warned: bool,
    /// Token bucket; absent when the key has no configured rps.
    pub bucket: Option<TokenBucket>,
    /// Temporary exclusion window set from 429-class responses.
    pub rate_limited_until: Option<DateTime<Utc>>,
    pub circuit: CircuitState,
    /// Set while the circuit is open; cleared on every other transition.
    pub circuit_open_until: Option<Instant>,
    pub consecutive_failures: u32,
    /// Last successful attempt.
    pub last_used: Option<DateTime<Utc>>,
}

impl KeyState {
    pub fn new(rps: Option<f64>) -> Self {
        Self {
            quota_used: 0,
            period_start: Utc::now(),
            warned: false,
            bucket: rps.map(TokenBucket::new),
            rate_limited_until: None,
            circuit: CircuitState::Closed,
            circuit_open_until: None,
            consecutive_failures: 0,
            last_used: None,
        }
    }

    /// Whether the temporary rate-limit window is active.
    pub fn is_rate_limited(&self, now: DateTime<Utc>) -> bool {
        self.rate_limited_until.is_some_and(|until| until > now)
    }
}

/// A registered key: immutable config plus mutable runtime state. The pool
/// owns a vector of these in registration order.
#[derive(Debug, Clone)]
pub struct KeyEntry {
    pub config: KeyConfig,
    pub state: KeyState,
}

impl KeyEntry {
    pub fn new(config: KeyConfig) -> Self {
        let state = KeyState::new(config.rps);
        Self { config, state }
    }
}
