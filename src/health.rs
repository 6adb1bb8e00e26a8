// src/health.rs

use crate::circuit_breaker::CircuitBreakerPolicy;
use crate::key_state::{CircuitState, KeyEntry};
use crate::quota::QuotaTracker;
use crate::selector::{availability_breakdown, is_available, AvailabilityBreakdown};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;

/// Coarse pool status derived from the available/total ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
    Exhausted,
}

impl HealthStatus {
    /// Piecewise mapping: 0 available → exhausted, < 20% → critical,
    /// < 50% → degraded, otherwise healthy. An empty pool is exhausted.
    pub fn from_ratio(available: usize, total: usize) -> Self {
        if total == 0 || available == 0 {
            return Self::Exhausted;
        }
        let ratio = available as f64 / total as f64;
        if ratio < 0.2 {
            Self::Critical
        } else if ratio < 0.5 {
            Self::Degraded
        } else {
            Self::Healthy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    QuotaWarning,
    QuotaExhausted,
    RateLimited,
    CircuitOpen,
}

/// One active condition on one key. A key emits at most one warning per
/// category that currently applies.
#[derive(Debug, Clone, Serialize)]
pub struct KeyWarning {
    pub key_id: String,
    pub kind: WarningKind,
    pub message: String,
}

/// Point-in-time view of pool health.
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub status: HealthStatus,
    pub available_keys: usize,
    pub total_keys: usize,
    pub breakdown: AvailabilityBreakdown,
    /// Sum of configured rps over currently available keys.
    pub effective_rps: f64,
    /// Sum of quota limits over all bounded-quota keys.
    pub effective_quota_total: u64,
    /// Sum of remaining quota over currently available keys, ignoring
    /// unlimited ones.
    pub effective_quota_remaining: u64,
    pub warnings: Vec<KeyWarning>,
}

/// Aggregate health on demand from the pool's key states.
pub fn compute_health(
    breaker: &CircuitBreakerPolicy,
    quota: &QuotaTracker,
    warning_threshold: f64,
    entries: &mut [KeyEntry],
    now_utc: DateTime<Utc>,
    now: Instant,
) -> PoolHealth {
    let breakdown = availability_breakdown(breaker, quota, entries, now_utc, now);
    let total_keys = entries.len();
    let available_keys = breakdown.available;

    let mut effective_rps = 0.0;
    let mut effective_quota_total = 0;
    let mut effective_quota_remaining = 0;
    let mut warnings = Vec::new();

    for entry in entries.iter_mut() {
        let available = is_available(breaker, quota, entry, now_utc, now);
        let KeyEntry { config, state } = entry;

        if let Some(limit) = config.quota.limit() {
            effective_quota_total += limit;
        }
        if available {
            effective_rps += config.rps.unwrap_or(0.0);
            if let Some(remaining) = quota.remaining(config, state) {
                effective_quota_remaining += remaining;
            }
        }

        if let Some(limit) = config.quota.limit() {
            let usage = state.quota_used as f64 / limit as f64;
            if usage >= 1.0 {
                warnings.push(KeyWarning {
                    key_id: config.id.clone(),
                    kind: WarningKind::QuotaExhausted,
                    message: format!("quota exhausted ({}/{limit})", state.quota_used),
                });
            } else if usage >= warning_threshold {
                warnings.push(KeyWarning {
                    key_id: config.id.clone(),
                    kind: WarningKind::QuotaWarning,
                    message: format!(
                        "quota at {:.0}% ({}/{limit})",
                        usage * 100.0,
                        state.quota_used
                    ),
                });
            }
        }

        if let Some(until) = state.rate_limited_until {
            if until > now_utc {
                let secs = (until - now_utc).num_seconds().max(0);
                warnings.push(KeyWarning {
                    key_id: config.id.clone(),
                    kind: WarningKind::RateLimited,
                    message: format!("rate limited for another {secs}s"),
                });
            }
        }

        if state.circuit == CircuitState::Open {
            let secs = breaker
                .remaining_open(state, now)
                .map_or(0, |wait| wait.as_secs());
            warnings.push(KeyWarning {
                key_id: config.id.clone(),
                kind: WarningKind::CircuitOpen,
                message: format!("circuit open, reset in {secs}s"),
            });
        }
    }

    PoolHealth {
        status: HealthStatus::from_ratio(available_keys, total_keys),
        available_keys,
        total_keys,
        breakdown,
        effective_rps,
        effective_quota_total,
        effective_quota_remaining,
        warnings,
    }
}
