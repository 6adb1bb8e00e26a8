// src/selector.rs

use crate::circuit_breaker::CircuitBreakerPolicy;
use crate::key_state::{CircuitState, KeyEntry};
use crate::quota::QuotaTracker;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Fallback wait hint when no key offers a concrete recovery signal.
pub const DEFAULT_NEXT_AVAILABLE: Duration = Duration::from_secs(60);

/// Per-category availability counts. Every key lands in exactly one bucket;
/// precedence is circuit > quota > rate-limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AvailabilityBreakdown {
    pub available: usize,
    pub rate_limited: usize,
    pub quota_exhausted: usize,
    pub circuit_open: usize,
}

impl AvailabilityBreakdown {
    pub fn total(&self) -> usize {
        self.available + self.rate_limited + self.quota_exhausted + self.circuit_open
    }
}

/// A key is available iff its circuit is not open, quota remains, the token
/// bucket holds a whole token, and no temporary rate-limit window is active.
pub fn is_available(
    breaker: &CircuitBreakerPolicy,
    quota: &QuotaTracker,
    entry: &mut KeyEntry,
    now_utc: DateTime<Utc>,
    now: Instant,
) -> bool {
    let KeyEntry { config, state } = entry;
    if breaker.current_state(state, now) == CircuitState::Open {
        return false;
    }
    if !quota.has_quota(config, state, now_utc) {
        return false;
    }
    if let Some(bucket) = state.bucket.as_mut() {
        if !bucket.has_capacity(now) {
            return false;
        }
    }
    !state.is_rate_limited(now_utc)
}

/// Weighted round-robin selector over the pool's keys.
///
/// Each key occupies `weight` consecutive slots of a conceptual ring in
/// registration order; the cursor advances past each successful selection, so
/// over a full revolution every available key is picked in proportion to its
/// weight.
#[derive(Debug, Default)]
pub struct Selector {
    cursor: AtomicUsize,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the next eligible key, skipping `excluded` ids and anything
    /// failing the availability check. Returns the index into `entries`.
    pub fn select(
        &self,
        breaker: &CircuitBreakerPolicy,
        quota: &QuotaTracker,
        entries: &mut [KeyEntry],
        excluded: &HashSet<String>,
        now_utc: DateTime<Utc>,
        now: Instant,
    ) -> Option<usize> {
        if entries.is_empty() {
            return None;
        }

        let ring: Vec<usize> = entries
            .iter()
            .enumerate()
            .flat_map(|(idx, entry)| {
                std::iter::repeat(idx).take(entry.config.weight.max(1) as usize)
            })
            .collect();

        let start = self.cursor.load(Ordering::Relaxed) % ring.len();
        for step in 0..ring.len() {
            let pos = (start + step) % ring.len();
            let idx = ring[pos];
            if excluded.contains(&entries[idx].config.id) {
                continue;
            }
            if is_available(breaker, quota, &mut entries[idx], now_utc, now) {
                self.cursor.store((pos + 1) % ring.len(), Ordering::Relaxed);
                debug!(key.id = %entries[idx].config.id, slot = pos, "key selected");
                return Some(idx);
            }
        }
        None
    }
}

/// Count keys by availability category.
pub fn availability_breakdown(
    breaker: &CircuitBreakerPolicy,
    quota: &QuotaTracker,
    entries: &mut [KeyEntry],
    now_utc: DateTime<Utc>,
    now: Instant,
) -> AvailabilityBreakdown {
    let mut breakdown = AvailabilityBreakdown::default();
    for entry in entries.iter_mut() {
        let KeyEntry { config, state } = entry;
        if breaker.current_state(state, now) == CircuitState::Open {
            breakdown.circuit_open += 1;
        } else if !quota.has_quota(config, state, now_utc) {
            breakdown.quota_exhausted += 1;
        } else if state.is_rate_limited(now_utc)
            || state
                .bucket
                .as_mut()
                .is_some_and(|bucket| !bucket.has_capacity(now))
        {
            breakdown.rate_limited += 1;
        } else {
            breakdown.available += 1;
        }
    }
    breakdown
}

/// Shortest wait until some key might become available again: the minimum of
/// circuit reset waits, token refill waits, and temporary rate-limit waits.
pub fn next_available_wait(
    breaker: &CircuitBreakerPolicy,
    entries: &mut [KeyEntry],
    now_utc: DateTime<Utc>,
    now: Instant,
) -> Duration {
    let mut shortest: Option<Duration> = None;
    let mut consider = |wait: Duration| {
        if wait > Duration::ZERO && shortest.map_or(true, |cur| wait < cur) {
            shortest = Some(wait);
        }
    };

    for entry in entries.iter_mut() {
        let state = &mut entry.state;
        if let Some(wait) = breaker.remaining_open(state, now) {
            consider(wait);
        }
        if let Some(bucket) = state.bucket.as_mut() {
            consider(bucket.time_until_next_token(now));
        }
        if let Some(until) = state.rate_limited_until {
            if until > now_utc {
                let millis = (until - now_utc).num_milliseconds().max(0) as u64;
                consider(Duration::from_millis(millis));
            }
        }
    }

    shortest.unwrap_or(DEFAULT_NEXT_AVAILABLE)
}
