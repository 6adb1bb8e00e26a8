// src/pool.rs

use crate::circuit_breaker::CircuitBreakerPolicy;
use crate::classify::ResponseClassifier;
use crate::config::{KeyConfig, PoolConfig};
use crate::error::{BoxError, DispatchError, Result};
use crate::health::{compute_health, PoolHealth};
use crate::hooks::{DispatchHooks, NoopHooks};
use crate::key_state::{CircuitState, KeyEntry};
use crate::metrics::METRICS;
use crate::queue::{QueuedRequest, RequestFn, RequestQueue};
use crate::quota::QuotaTracker;
use crate::selector::Selector;
use crate::storage::{MemoryStore, QuotaStore};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, RwLock};
use tracing::{debug, info};

/// Per-request overrides for [`KeyPool::execute_with`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Queue-wait bound for this request; the pool default applies when
    /// absent. Once the request function is running, its own deadline
    /// governs — the dispatcher never aborts it.
    pub max_wait: Option<Duration>,
}

/// Per-key observability snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct KeyStats {
    pub id: String,
    pub quota_used: u64,
    /// `None` means unlimited.
    pub quota_remaining: Option<u64>,
    pub is_rate_limited: bool,
    pub is_circuit_open: bool,
    pub is_exhausted: bool,
    pub current_rps: Option<f64>,
    pub rps_limit: Option<f64>,
    pub consecutive_failures: u32,
    pub last_used: Option<DateTime<Utc>>,
}

/// Shared state behind the facade; the worker and policer tasks hold clones.
pub(crate) struct PoolInner<R> {
    pub(crate) keys: RwLock<Vec<KeyEntry>>,
    pub(crate) selector: Selector,
    pub(crate) quota: QuotaTracker,
    pub(crate) breaker: CircuitBreakerPolicy,
    pub(crate) hooks: Arc<dyn DispatchHooks>,
    pub(crate) classifier: Arc<dyn ResponseClassifier<R>>,
    pub(crate) config: PoolConfig,
    pub(crate) queue: RequestQueue<R>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
}

/// Builder for [`KeyPool`]. `build` validates the configuration and spawns
/// the dispatch worker, so it must run inside a tokio runtime.
pub struct KeyPoolBuilder<R> {
    keys: Vec<KeyConfig>,
    config: PoolConfig,
    classifier: Arc<dyn ResponseClassifier<R>>,
    hooks: Arc<dyn DispatchHooks>,
    storage: Arc<dyn QuotaStore>,
}

impl<R: Send + 'static> KeyPoolBuilder<R> {
    /// Register one key.
    #[must_use]
    pub fn key(mut self, config: KeyConfig) -> Self {
        self.keys.push(config);
        self
    }

    /// Register several keys.
    #[must_use]
    pub fn keys(mut self, configs: impl IntoIterator<Item = KeyConfig>) -> Self {
        self.keys.extend(configs);
        self
    }

    #[must_use]
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn hooks(mut self, hooks: impl DispatchHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Replace the default in-memory store with a durable backend.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn QuotaStore>) -> Self {
        self.storage = storage;
        self
    }

    /// Validate everything and start the pool.
    pub fn build(self) -> Result<KeyPool<R>> {
        self.config.validate()?;
        if self.keys.is_empty() {
            return Err(DispatchError::NoKeysConfigured);
        }
        let mut seen = HashSet::new();
        for config in &self.keys {
            config.validate()?;
            if !seen.insert(config.id.clone()) {
                return Err(DispatchError::invalid_key(&config.id, "duplicate key id"));
            }
        }

        info!(key.count = self.keys.len(), "starting key pool");
        let entries: Vec<KeyEntry> = self.keys.into_iter().map(KeyEntry::new).collect();
        let (shutdown_tx, _) = watch::channel(false);

        let inner = Arc::new(PoolInner {
            keys: RwLock::new(entries),
            selector: Selector::new(),
            quota: QuotaTracker::new(self.config.warning_threshold, self.storage),
            breaker: CircuitBreakerPolicy::new(
                self.config.failure_threshold,
                self.config.reset_timeout,
            ),
            hooks: self.hooks,
            classifier: self.classifier,
            queue: RequestQueue::new(self.config.max_queue_size),
            config: self.config,
            shutdown_tx,
        });

        tokio::spawn(inner.clone().run_worker());
        tokio::spawn(inner.clone().run_policer());

        Ok(KeyPool { inner })
    }
}

/// Credential-multiplexing dispatcher over a pool of API keys.
///
/// Callers submit a request function without naming a key; the pool selects
/// an eligible one, enforces its rate and quota limits, rotates on failure
/// and resolves with the first successful response.
pub struct KeyPool<R> {
    inner: Arc<PoolInner<R>>,
}

impl<R: Send + 'static> KeyPool<R> {
    /// Start building a pool around the caller's response classifier.
    pub fn builder(classifier: impl ResponseClassifier<R> + 'static) -> KeyPoolBuilder<R> {
        KeyPoolBuilder {
            keys: Vec::new(),
            config: PoolConfig::default(),
            classifier: Arc::new(classifier),
            hooks: Arc::new(NoopHooks),
            storage: Arc::new(MemoryStore::new()),
        }
    }

    /// Submit a request with the default queue-wait bound.
    pub async fn execute<F, Fut>(&self, attempt: F) -> Result<R>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, BoxError>> + Send + 'static,
    {
        self.execute_with(attempt, ExecuteOptions::default()).await
    }

    /// Submit a request. The function receives the selected key's secret
    /// value and may be invoked several times, each with a different key.
    pub async fn execute_with<F, Fut>(&self, attempt: F, options: ExecuteOptions) -> Result<R>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, BoxError>> + Send + 'static,
    {
        if *self.inner.shutdown_tx.borrow() {
            return Err(DispatchError::ShuttingDown);
        }
        METRICS.requests_total.increment(1);

        let attempt: RequestFn<R> = Box::new(move |key| Box::pin(attempt(key)));
        let max_wait = options.max_wait.unwrap_or(self.inner.config.default_max_wait);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .queue
            .try_enqueue(QueuedRequest::new(attempt, max_wait, reply_tx))?;

        match reply_rx.await {
            Ok(outcome) => outcome,
            // Worker gone: only happens on teardown.
            Err(_) => Err(DispatchError::ShuttingDown),
        }
    }

    /// Aggregate health snapshot.
    pub async fn get_health(&self) -> PoolHealth {
        let mut keys = self.inner.keys.write().await;
        compute_health(
            &self.inner.breaker,
            &self.inner.quota,
            self.inner.config.warning_threshold,
            &mut keys,
            Utc::now(),
            Instant::now(),
        )
    }

    /// Stats for one key.
    pub async fn get_key_stats(&self, key_id: &str) -> Result<KeyStats> {
        let mut keys = self.inner.keys.write().await;
        let entry = keys
            .iter_mut()
            .find(|entry| entry.config.id == key_id)
            .ok_or_else(|| DispatchError::KeyNotFound {
                key_id: key_id.to_string(),
            })?;
        Ok(self.stats_for(entry))
    }

    /// Stats for every key, in registration order.
    pub async fn get_all_key_stats(&self) -> Vec<KeyStats> {
        let mut keys = self.inner.keys.write().await;
        keys.iter_mut().map(|entry| self.stats_for(entry)).collect()
    }

    /// Number of requests currently waiting in the queue.
    pub fn get_queue_size(&self) -> usize {
        self.inner.queue.len()
    }

    /// Register a new key at runtime. Its persisted quota counter, if any, is
    /// loaded before the key becomes eligible.
    pub async fn add_key(&self, config: KeyConfig) -> Result<()> {
        config.validate()?;
        let mut keys = self.inner.keys.write().await;
        if keys.iter().any(|entry| entry.config.id == config.id) {
            return Err(DispatchError::invalid_key(&config.id, "duplicate key id"));
        }
        info!(key.id = %config.id, "adding key");
        let mut entry = KeyEntry::new(config);
        self.inner
            .quota
            .load(&entry.config, &mut entry.state, Utc::now())
            .await;
        keys.push(entry);
        Ok(())
    }

    /// Remove a key and its persisted counter.
    pub async fn remove_key(&self, key_id: &str) -> Result<()> {
        let mut keys = self.inner.keys.write().await;
        let position = keys
            .iter()
            .position(|entry| entry.config.id == key_id)
            .ok_or_else(|| DispatchError::KeyNotFound {
                key_id: key_id.to_string(),
            })?;
        keys.remove(position);
        drop(keys);

        info!(key.id = %key_id, "removed key");
        self.inner.quota.delete_record(key_id);
        Ok(())
    }

    /// Operator override: close the key's circuit and clear its failures.
    pub async fn close_circuit(&self, key_id: &str) -> Result<()> {
        let mut keys = self.inner.keys.write().await;
        let entry = Self::find_mut(&mut keys, key_id)?;
        self.inner.breaker.force_close(key_id, &mut entry.state);
        Ok(())
    }

    /// Operator override: open the key's circuit now. Fires the circuit-open
    /// hook like any other open transition.
    pub async fn open_circuit(&self, key_id: &str) -> Result<()> {
        let opened = {
            let mut keys = self.inner.keys.write().await;
            let entry = Self::find_mut(&mut keys, key_id)?;
            self.inner
                .breaker
                .force_open(key_id, &mut entry.state, Instant::now())
        };
        if opened {
            METRICS.circuit_trips_total.increment(1);
            self.inner.hooks.on_key_circuit_open(key_id);
        }
        Ok(())
    }

    /// Operator override: zero the key's quota counter.
    pub async fn reset_quota(&self, key_id: &str) -> Result<()> {
        let mut keys = self.inner.keys.write().await;
        let entry = Self::find_mut(&mut keys, key_id)?;
        self.inner
            .quota
            .reset(&entry.config, &mut entry.state, Utc::now());
        Ok(())
    }

    /// Stop dispatching: every pending request fails with a shutdown error,
    /// further submissions are refused, and in-flight invocations complete
    /// naturally.
    pub async fn shutdown(&self) {
        info!("shutting down key pool");
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.queue.clear_for_shutdown();
    }

    fn find_mut<'a>(keys: &'a mut Vec<KeyEntry>, key_id: &str) -> Result<&'a mut KeyEntry> {
        keys.iter_mut()
            .find(|entry| entry.config.id == key_id)
            .ok_or_else(|| DispatchError::KeyNotFound {
                key_id: key_id.to_string(),
            })
    }

    fn stats_for(&self, entry: &mut KeyEntry) -> KeyStats {
        let now_utc = Utc::now();
        let now = Instant::now();
        let KeyEntry { config, state } = entry;

        // Lazy transitions first so the snapshot reflects current reality.
        self.inner.quota.check_rollover(config, state, now_utc);
        let circuit = self.inner.breaker.current_state(state, now);

        let quota_remaining = self.inner.quota.remaining(config, state);
        KeyStats {
            id: config.id.clone(),
            quota_used: state.quota_used,
            quota_remaining,
            is_rate_limited: state.is_rate_limited(now_utc),
            is_circuit_open: circuit == CircuitState::Open,
            is_exhausted: quota_remaining == Some(0),
            current_rps: state.bucket.as_mut().map(|bucket| bucket.current_rps(now)),
            rps_limit: config.rps,
            consecutive_failures: state.consecutive_failures,
            last_used: state.last_used,
        }
    }
}

impl<R> Drop for KeyPool<R> {
    fn drop(&mut self) {
        // Stops the worker and policer; queued requests get shutdown errors
        // from the worker's final drain.
        let _ = self.inner.shutdown_tx.send(true);
        debug!("key pool dropped");
    }
}
