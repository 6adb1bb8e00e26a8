// src/executor.rs
//
// The dispatch worker: pulls one request at a time off the queue and drives
// it through selection, token accounting, invocation and classification.

use crate::classify::{classify, Outcome};
use crate::error::{BoxError, DispatchError, Result};
use crate::key_state::KeyEntry;
use crate::metrics::METRICS;
use crate::pool::PoolInner;
use crate::queue::{QueuedRequest, RequestFn};
use crate::quota::QuotaEvents;
use crate::selector::{availability_breakdown, next_available_wait};
use chrono::Utc;
use secrecy::ExposeSecret;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// What one attempt left behind, gathered under the state lock and acted on
/// (hooks, metrics, resolution) after it is released.
enum AttemptResult<R> {
    Resolved(R, QuotaEvents),
    Rotate { circuit_opened: bool },
}

impl<R: Send + 'static> PoolInner<R> {
    /// Worker task: load persisted quota once, then drain the queue until
    /// shutdown. Requests submitted before the load finishes simply wait in
    /// the queue, which is what gives the initial-load barrier.
    pub(crate) async fn run_worker(self: std::sync::Arc<Self>) {
        self.load_initial_state().await;

        let mut shutdown = self.shutdown_tx.subscribe();
        while let Some(request) = self.queue.pop_ready(&mut shutdown).await {
            let span = info_span!("dispatch", request.id = %request.id);
            self.dispatch_request(request).instrument(span).await;
        }
        self.queue.clear_for_shutdown();
        debug!("dispatch worker stopped");
    }

    /// Deadline-policing task: sweeps expired requests out of the queue on a
    /// fixed tick whenever it is non-empty.
    pub(crate) async fn run_policer(self: std::sync::Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut tick = tokio::time::interval(self.config.queue_tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if !self.queue.is_empty() {
                        self.queue.sweep_expired();
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn load_initial_state(&self) {
        let mut keys = self.keys.write().await;
        let now = Utc::now();
        for entry in keys.iter_mut() {
            self.quota.load(&entry.config, &mut entry.state, now).await;
        }
        info!(key.count = keys.len(), "initial quota state loaded");
    }

    async fn dispatch_request(&self, request: QueuedRequest<R>) {
        let QueuedRequest {
            id, attempt, reply, ..
        } = request;
        let outcome = self.rotate_until_done(id, &attempt).await;
        match &outcome {
            Ok(_) => METRICS.requests_succeeded_total.increment(1),
            Err(_) => METRICS.requests_failed_total.increment(1),
        }
        // The caller may have given up (dropped the receiver); nothing to do.
        let _ = reply.send(outcome);
    }

    /// The rotation loop of §"retry/rotation executor": each attempt uses a
    /// key not yet tried for this request, and a classified failure never
    /// retries the same key.
    async fn rotate_until_done(&self, request_id: Uuid, attempt_fn: &RequestFn<R>) -> Result<R> {
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_error: Option<BoxError> = None;

        let max_retries = {
            let keys = self.keys.read().await;
            self.config.max_retries.unwrap_or(keys.len()).max(1)
        };

        for attempt in 0..max_retries {
            let selection = {
                let mut keys = self.keys.write().await;
                let now_utc = Utc::now();
                let now = Instant::now();
                match self
                    .selector
                    .select(&self.breaker, &self.quota, &mut keys, &tried, now_utc, now)
                {
                    Some(idx) => {
                        let entry = &mut keys[idx];
                        // Consume the token in the same critical section as
                        // the selection so the capacity check cannot go stale.
                        let consumed = entry
                            .state
                            .bucket
                            .as_mut()
                            .map_or(true, |bucket| bucket.try_consume(now));
                        Ok((
                            entry.config.id.clone(),
                            entry.config.value.expose_secret().to_string(),
                            consumed,
                        ))
                    }
                    None => Err(Self::exhausted_now(&self.breaker, &self.quota, &mut keys)),
                }
            };

            let (key_id, secret, consumed) = match selection {
                Ok(picked) => picked,
                Err(err) => {
                    warn!(request.id = %request_id, tried = tried.len(), "no eligible key");
                    self.hooks.on_all_keys_exhausted();
                    return Err(err);
                }
            };

            tried.insert(key_id.clone());
            if !consumed {
                debug!(key.id = %key_id, attempt, "token bucket raced empty, rotating");
                METRICS.rate_limit_blocks_total.increment(1);
                continue;
            }
            if attempt > 0 {
                METRICS.key_rotations_total.increment(1);
            }

            debug!(key.id = %key_id, attempt, "invoking request function");
            let result = (attempt_fn)(secret).await;

            let attempt_result = {
                let mut keys = self.keys.write().await;
                match keys.iter_mut().find(|entry| entry.config.id == key_id) {
                    Some(entry) => self.settle_attempt(&key_id, entry, result, &mut last_error),
                    None => {
                        // Removed mid-flight; nothing to record against.
                        warn!(key.id = %key_id, "key removed while request in flight");
                        AttemptResult::Rotate {
                            circuit_opened: false,
                        }
                    }
                }
            };

            match attempt_result {
                AttemptResult::Resolved(response, events) => {
                    if let Some(usage) = events.warning {
                        self.hooks.on_warning(&key_id, usage);
                    }
                    if events.exhausted {
                        self.hooks.on_key_exhausted(&key_id);
                    }
                    return Ok(response);
                }
                AttemptResult::Rotate { circuit_opened } => {
                    if circuit_opened {
                        METRICS.circuit_trips_total.increment(1);
                        self.hooks.on_key_circuit_open(&key_id);
                    }
                }
            }
        }

        warn!(request.id = %request_id, tried = tried.len(), "retries exhausted");
        match last_error {
            Some(error) => Err(DispatchError::Upstream(error)),
            None => {
                let mut keys = self.keys.write().await;
                Err(Self::exhausted_now(&self.breaker, &self.quota, &mut keys))
            }
        }
    }

    /// Classify one finished attempt and update the key's state. Runs under
    /// the keys lock; hook firing stays with the caller.
    fn settle_attempt(
        &self,
        key_id: &str,
        entry: &mut KeyEntry,
        result: std::result::Result<R, BoxError>,
        last_error: &mut Option<BoxError>,
    ) -> AttemptResult<R> {
        let now_utc = Utc::now();
        let now = Instant::now();

        let response = match result {
            Err(error) => {
                warn!(key.id = %key_id, error = %error, "request function failed");
                METRICS.key_failures_total.increment(1);
                let circuit_opened = self.breaker.record_failure(key_id, &mut entry.state, now);
                *last_error = Some(error);
                return AttemptResult::Rotate { circuit_opened };
            }
            Ok(response) => response,
        };

        match classify(self.classifier.as_ref(), &response) {
            Outcome::RateLimited { retry_after_secs } => {
                let backoff = retry_after_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.config.rate_limit_backoff);
                entry.state.rate_limited_until =
                    Some(now_utc + chrono::Duration::milliseconds(backoff.as_millis() as i64));
                info!(
                    key.id = %key_id,
                    backoff_ms = backoff.as_millis() as u64,
                    "key rate limited upstream, rotating"
                );
                METRICS.rate_limit_blocks_total.increment(1);
                AttemptResult::Rotate {
                    circuit_opened: false,
                }
            }
            Outcome::RetryableError => {
                warn!(key.id = %key_id, "retryable upstream error");
                METRICS.key_failures_total.increment(1);
                let circuit_opened = self.breaker.record_failure(key_id, &mut entry.state, now);
                AttemptResult::Rotate { circuit_opened }
            }
            Outcome::Success => {
                self.breaker.record_success(key_id, &mut entry.state, now);
                entry.state.rate_limited_until = None;
                entry.state.last_used = Some(now_utc);
                let events = self
                    .quota
                    .increment(&entry.config, &mut entry.state, 1, now_utc);
                if let Some(remaining) = self.classifier.quota_remaining(&response) {
                    self.quota
                        .sync_from_response(&entry.config, &mut entry.state, remaining);
                }
                AttemptResult::Resolved(response, events)
            }
        }
    }

    /// Build the all-keys-exhausted error from the current state vector.
    pub(crate) fn exhausted_now(
        breaker: &crate::circuit_breaker::CircuitBreakerPolicy,
        quota: &crate::quota::QuotaTracker,
        keys: &mut [KeyEntry],
    ) -> DispatchError {
        let now_utc = Utc::now();
        let now = Instant::now();
        let breakdown = availability_breakdown(breaker, quota, keys, now_utc, now);
        let wait = next_available_wait(breaker, keys, now_utc, now);
        DispatchError::AllKeysExhausted {
            total_keys: keys.len(),
            exhausted_keys: breakdown.quota_exhausted,
            circuit_open_keys: breakdown.circuit_open,
            rate_limited_keys: breakdown.rate_limited,
            retry_after_ms: wait.as_millis() as u64,
        }
    }
}
