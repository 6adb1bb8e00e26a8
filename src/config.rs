// src/config.rs

use crate::error::{DispatchError, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

/// Quota attached to a key: a bounded budget over a calendar period, a
/// lifetime budget, or none at all.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaSpec {
    /// Resets at UTC month boundaries.
    Monthly { limit: u64 },
    /// Resets at UTC year boundaries.
    Yearly { limit: u64 },
    /// Never resets.
    Total { limit: u64 },
    /// No quota accounting.
    Unlimited,
}

impl QuotaSpec {
    /// The configured limit, or `None` for unlimited keys.
    pub fn limit(&self) -> Option<u64> {
        match self {
            Self::Monthly { limit } | Self::Yearly { limit } | Self::Total { limit } => {
                Some(*limit)
            }
            Self::Unlimited => None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }

    /// TTL for the persisted quota record: a little over one period, so stale
    /// records age out of storage on their own.
    pub(crate) fn persist_ttl(&self) -> Option<Duration> {
        match self {
            Self::Monthly { .. } => Some(Duration::from_secs(35 * 24 * 3600)),
            Self::Yearly { .. } => Some(Duration::from_secs(370 * 24 * 3600)),
            Self::Total { .. } | Self::Unlimited => None,
        }
    }
}

/// Immutable configuration of a single managed key.
///
/// The secret `value` is what gets handed to the caller's request function;
/// it is never logged and never serialized back out.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyConfig {
    /// Unique, non-empty public identifier.
    pub id: String,
    /// The credential itself.
    pub value: SecretString,
    /// Quota budget for this key.
    #[serde(default = "default_quota")]
    pub quota: QuotaSpec,
    /// Sustained requests-per-second limit; doubles as token bucket capacity.
    #[serde(default)]
    pub rps: Option<f64>,
    /// Round-robin weight relative to the other keys in the pool.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_quota() -> QuotaSpec {
    QuotaSpec::Unlimited
}

fn default_weight() -> u32 {
    1
}

impl KeyConfig {
    /// New key with unlimited quota, no rate limit and weight 1.
    pub fn new(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: SecretString::new(value.into()),
            quota: QuotaSpec::Unlimited,
            rps: None,
            weight: 1,
        }
    }

    #[must_use]
    pub fn with_quota(mut self, quota: QuotaSpec) -> Self {
        self.quota = quota;
        self
    }

    #[must_use]
    pub fn with_rps(mut self, rps: f64) -> Self {
        self.rps = Some(rps);
        self
    }

    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Validates the invariants enforced at registration time.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(DispatchError::invalid_key(&self.id, "key id must not be empty"));
        }
        if self.value.expose_secret().is_empty() {
            return Err(DispatchError::invalid_key(
                &self.id,
                "key value must not be empty",
            ));
        }
        if let Some(limit) = self.quota.limit() {
            if limit == 0 {
                return Err(DispatchError::invalid_key(
                    &self.id,
                    "quota limit must be positive",
                ));
            }
        }
        if let Some(rps) = self.rps {
            if !rps.is_finite() || rps <= 0.0 {
                return Err(DispatchError::invalid_key(&self.id, "rps must be positive"));
            }
        }
        if self.weight == 0 {
            return Err(DispatchError::invalid_key(
                &self.id,
                "weight must be positive",
            ));
        }
        Ok(())
    }
}

/// Tunables shared by the whole pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of requests waiting in the queue.
    pub max_queue_size: usize,
    /// Default queue-wait bound applied when a request does not override it.
    pub default_max_wait: Duration,
    /// Attempt bound per request; `None` means "number of registered keys".
    pub max_retries: Option<usize>,
    /// Consecutive failures before a key's circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit stays open before a half-open probe.
    pub reset_timeout: Duration,
    /// Quota usage fraction at which the warning hook fires, in (0, 1].
    pub warning_threshold: f64,
    /// Rate-limit exclusion window applied when a 429-class response carries
    /// no retry-after hint.
    pub rate_limit_backoff: Duration,
    /// Cadence of the queue deadline-policing sweep.
    pub queue_tick: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1_000,
            default_max_wait: Duration::from_secs(30),
            max_retries: None,
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            warning_threshold: 0.8,
            rate_limit_backoff: Duration::from_secs(60),
            queue_tick: Duration::from_millis(100),
        }
    }
}

impl PoolConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            return Err(DispatchError::InvalidPoolConfig {
                reason: "max_queue_size must be positive".to_string(),
            });
        }
        if self.failure_threshold == 0 {
            return Err(DispatchError::InvalidPoolConfig {
                reason: "failure_threshold must be positive".to_string(),
            });
        }
        if !(self.warning_threshold > 0.0 && self.warning_threshold <= 1.0) {
            return Err(DispatchError::InvalidPoolConfig {
                reason: "warning_threshold must be within (0, 1]".to_string(),
            });
        }
        Ok(())
    }
}
