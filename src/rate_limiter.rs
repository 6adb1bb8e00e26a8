// src/rate_limiter.rs

use std::time::{Duration, Instant};

/// Continuous-refill token bucket for a single key.
///
/// Capacity equals the refill rate, so a key configured at `r` rps can burst
/// at most `r` requests and then sustains `r` per second. Tokens are tracked
/// fractionally; the capacity check is "at least one whole token".
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rps: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// New bucket, full.
    pub fn new(rps: f64) -> Self {
        Self {
            rps,
            tokens: rps,
            last_refill: Instant::now(),
        }
    }

    pub fn rps(&self) -> f64 {
        self.rps
    }

    /// Credit elapsed time, clamped at capacity. Invariant: after this,
    /// `0 <= tokens <= rps`.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rps).min(self.rps);
        self.last_refill = now;
    }

    /// Whether a whole token is available, without consuming it.
    pub fn has_capacity(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.tokens >= 1.0
    }

    /// Take one token. Returns false (and takes nothing) when below capacity.
    pub fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// How long until the bucket holds a whole token again. Zero when it
    /// already does.
    pub fn time_until_next_token(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let millis = ((1.0 - self.tokens) / self.rps * 1000.0).ceil() as u64;
        Duration::from_millis(millis)
    }

    /// Observed consumption rate, for stats only: capacity minus what is left.
    pub fn current_rps(&mut self, now: Instant) -> f64 {
        self.refill(now);
        (self.rps - self.tokens).max(0.0)
    }

    /// Refill to capacity.
    pub fn reset(&mut self, now: Instant) {
        self.tokens = self.rps;
        self.last_refill = now;
    }

    #[cfg(test)]
    pub(crate) fn tokens(&self) -> f64 {
        self.tokens
    }
}
