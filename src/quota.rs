// src/quota.rs

use crate::config::{KeyConfig, QuotaSpec};
use crate::key_state::KeyState;
use crate::metrics::METRICS;
use crate::storage::QuotaStore;
use chrono::{DateTime, Datelike, Utc};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Persisted quota record, one per key, stored under `quota:<id>`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuotaRecord {
    pub quota_used: u64,
    pub period_start: DateTime<Utc>,
}

/// Hook-worthy events produced by a quota mutation. The caller fires the
/// corresponding hooks once it has released its locks.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct QuotaEvents {
    /// Usage fraction, set the first time it crosses the warning threshold
    /// within the current period.
    pub warning: Option<f64>,
    /// This mutation first reached the limit.
    pub exhausted: bool,
}

/// A queued storage mutation. Writes flow through one channel so they land
/// in issue order; a stale counter can never overwrite a newer one.
enum PersistOp {
    Set {
        key: String,
        key_id: String,
        value: String,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
}

/// Quota accounting over the key states owned by the pool.
///
/// Period rollover uses UTC calendar semantics and is checked lazily before
/// every read. Persistence is fire-and-forget: a storage failure never fails
/// the dispatching path.
pub struct QuotaTracker {
    warning_threshold: f64,
    storage: Arc<dyn QuotaStore>,
    writer: OnceCell<mpsc::UnboundedSender<PersistOp>>,
}

pub(crate) fn storage_key(key_id: &str) -> String {
    format!("quota:{key_id}")
}

impl QuotaTracker {
    pub fn new(warning_threshold: f64, storage: Arc<dyn QuotaStore>) -> Self {
        Self {
            warning_threshold,
            storage,
            writer: OnceCell::new(),
        }
    }

    /// Reset the counter if `now` falls in a later period than `period_start`.
    pub fn check_rollover(&self, config: &KeyConfig, state: &mut KeyState, now: DateTime<Utc>) {
        let rolled = match config.quota {
            QuotaSpec::Monthly { .. } => {
                (now.year(), now.month()) > (state.period_start.year(), state.period_start.month())
            }
            QuotaSpec::Yearly { .. } => now.year() > state.period_start.year(),
            QuotaSpec::Total { .. } | QuotaSpec::Unlimited => false,
        };
        if rolled {
            info!(key.id = %config.id, used = state.quota_used, "quota period rolled over");
            state.quota_used = 0;
            state.period_start = now;
            state.warned = false;
        }
    }

    /// Whether the key still has quota after a rollover check.
    pub fn has_quota(&self, config: &KeyConfig, state: &mut KeyState, now: DateTime<Utc>) -> bool {
        self.check_rollover(config, state, now);
        match config.quota.limit() {
            Some(limit) => state.quota_used < limit,
            None => true,
        }
    }

    /// Remaining budget; `None` for unlimited keys.
    pub fn remaining(&self, config: &KeyConfig, state: &KeyState) -> Option<u64> {
        config
            .quota
            .limit()
            .map(|limit| limit.saturating_sub(state.quota_used))
    }

    /// Count `n` requests against the quota and persist the new counter.
    pub fn increment(
        &self,
        config: &KeyConfig,
        state: &mut KeyState,
        n: u64,
        now: DateTime<Utc>,
    ) -> QuotaEvents {
        self.check_rollover(config, state, now);
        let Some(limit) = config.quota.limit() else {
            return QuotaEvents::default();
        };

        let before = state.quota_used;
        state.quota_used = state.quota_used.saturating_add(n);

        let mut events = QuotaEvents::default();
        let usage = state.quota_used as f64 / limit as f64;
        if !state.warned && usage >= self.warning_threshold {
            state.warned = true;
            events.warning = Some(usage);
            warn!(
                key.id = %config.id,
                used = state.quota_used,
                limit,
                "quota usage crossed warning threshold"
            );
        }
        if before < limit && state.quota_used >= limit {
            events.exhausted = true;
            warn!(key.id = %config.id, limit, "quota exhausted");
        }

        self.persist(config, state);
        events
    }

    /// Adopt the server's view of remaining quota — authoritative upward
    /// only, never allowed to rewind local accounting.
    pub fn sync_from_response(
        &self,
        config: &KeyConfig,
        state: &mut KeyState,
        remaining: u64,
    ) {
        let Some(limit) = config.quota.limit() else {
            return;
        };
        let server_used = limit.saturating_sub(remaining);
        if server_used > state.quota_used {
            debug!(
                key.id = %config.id,
                local = state.quota_used,
                server = server_used,
                "adopting server-reported quota usage"
            );
            state.quota_used = server_used;
            self.persist(config, state);
        }
    }

    /// Operator reset: zero the counter and start a fresh period.
    pub fn reset(&self, config: &KeyConfig, state: &mut KeyState, now: DateTime<Utc>) {
        info!(key.id = %config.id, "quota reset");
        state.quota_used = 0;
        state.period_start = now;
        state.warned = false;
        self.persist(config, state);
    }

    /// Load the persisted counter, once, at startup or on dynamic key
    /// addition. Malformed data is discarded and the state left fresh.
    pub async fn load(&self, config: &KeyConfig, state: &mut KeyState, now: DateTime<Utc>) {
        if config.quota.is_unlimited() {
            return;
        }
        let key = storage_key(&config.id);
        let raw = match self.storage.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(e) => {
                warn!(key.id = %config.id, error = %e, "quota load failed, starting fresh");
                METRICS.storage_errors_total.increment(1);
                return;
            }
        };
        match serde_json::from_str::<QuotaRecord>(&raw) {
            Ok(record) => {
                debug!(key.id = %config.id, used = record.quota_used, "loaded persisted quota");
                state.quota_used = record.quota_used;
                state.period_start = record.period_start;
                // The period may have rolled while we were down.
                self.check_rollover(config, state, now);
            }
            Err(e) => {
                warn!(key.id = %config.id, error = %e, "malformed quota record, discarding");
                self.submit(PersistOp::Delete { key });
            }
        }
    }

    /// Fire-and-forget write of the current counter.
    fn persist(&self, config: &KeyConfig, state: &KeyState) {
        if config.quota.is_unlimited() {
            return;
        }
        let record = QuotaRecord {
            quota_used: state.quota_used,
            period_start: state.period_start,
        };
        let raw = match serde_json::to_string(&record) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key.id = %config.id, error = %e, "cannot serialize quota record");
                return;
            }
        };
        self.submit(PersistOp::Set {
            key: storage_key(&config.id),
            key_id: config.id.clone(),
            value: raw,
            ttl: config.quota.persist_ttl(),
        });
    }

    /// Drop the persisted record for a removed key, ordered after any writes
    /// already queued for it.
    pub(crate) fn delete_record(&self, key_id: &str) {
        self.submit(PersistOp::Delete {
            key: storage_key(key_id),
        });
    }

    /// Queue a storage mutation on the single writer task. The task is
    /// started lazily, so constructing a tracker never requires a runtime.
    fn submit(&self, op: PersistOp) {
        let sender = self.writer.get_or_init(|| {
            let storage = self.storage.clone();
            let (tx, mut rx) = mpsc::unbounded_channel::<PersistOp>();
            tokio::spawn(async move {
                while let Some(op) = rx.recv().await {
                    match op {
                        PersistOp::Set {
                            key,
                            key_id,
                            value,
                            ttl,
                        } => {
                            if let Err(e) = storage.set(&key, &value, ttl).await {
                                warn!(
                                    key.id = %key_id,
                                    error = %e,
                                    "quota persist failed, dropping write"
                                );
                                METRICS.storage_errors_total.increment(1);
                            }
                        }
                        PersistOp::Delete { key } => {
                            if let Err(e) = storage.delete(&key).await {
                                warn!(storage.key = %key, error = %e, "record delete failed");
                                METRICS.storage_errors_total.increment(1);
                            }
                        }
                    }
                }
            });
            tx
        });
        let _ = sender.send(op);
    }
}
