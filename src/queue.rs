// src/queue.rs

use crate::error::{BoxError, DispatchError, Result};
use crate::metrics::METRICS;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

/// Type-erased request function: called with the selected key's secret value,
/// possibly several times across rotation attempts.
pub type RequestFn<R> =
    Box<dyn Fn(String) -> BoxFuture<'static, std::result::Result<R, BoxError>> + Send + Sync>;

/// A request waiting for the dispatch worker.
pub struct QueuedRequest<R> {
    pub id: Uuid,
    pub queued_at: Instant,
    pub max_wait: Duration,
    pub attempt: RequestFn<R>,
    pub reply: oneshot::Sender<Result<R>>,
}

impl<R> QueuedRequest<R> {
    pub fn new(attempt: RequestFn<R>, max_wait: Duration, reply: oneshot::Sender<Result<R>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            queued_at: Instant::now(),
            max_wait,
            attempt,
            reply,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.queued_at) >= self.max_wait
    }
}

/// Suggested client backoff, scaled with the backlog.
pub(crate) fn retry_after_hint(queue_size: usize) -> u64 {
    (queue_size as u64 * 1_000).max(1_000)
}

/// Bounded FIFO of pending requests.
///
/// Requests are never reordered. A single worker drains the head; a policing
/// tick sweeps expired requests out of the middle so a stale deadline can
/// never reach dispatch.
pub struct RequestQueue<R> {
    pending: Mutex<VecDeque<QueuedRequest<R>>>,
    max_size: usize,
    notify: Notify,
}

impl<R> RequestQueue<R> {
    pub fn new(max_size: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            max_size,
            notify: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a request, or fail immediately when the queue is at capacity.
    pub fn try_enqueue(&self, request: QueuedRequest<R>) -> Result<()> {
        let mut pending = self.pending.lock().expect("queue lock poisoned");
        if pending.len() >= self.max_size {
            let queue_size = pending.len();
            drop(pending);
            warn!(queue.size = queue_size, queue.max = self.max_size, "queue full, rejecting");
            METRICS.queue_rejections_total.increment(1);
            return Err(DispatchError::QueueFull {
                queue_size,
                max_queue_size: self.max_size,
                retry_after_ms: retry_after_hint(queue_size),
            });
        }
        debug!(request.id = %request.id, queue.size = pending.len() + 1, "request queued");
        pending.push_back(request);
        METRICS.queue_depth.set(pending.len() as f64);
        drop(pending);
        self.notify.notify_one();
        Ok(())
    }

    /// Remove and fail every request whose deadline has passed.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let expired = {
            let mut pending = self.pending.lock().expect("queue lock poisoned");
            let mut expired = Vec::new();
            let mut i = 0;
            while i < pending.len() {
                if pending[i].is_expired(now) {
                    expired.push(pending.remove(i).expect("index in bounds"));
                } else {
                    i += 1;
                }
            }
            METRICS.queue_depth.set(pending.len() as f64);
            expired
        };

        if expired.is_empty() {
            return;
        }
        let queue_size = self.len();
        for request in expired {
            let waited_ms = now.saturating_duration_since(request.queued_at).as_millis() as u64;
            warn!(request.id = %request.id, waited_ms, "request timed out in queue");
            METRICS.queue_timeouts_total.increment(1);
            let _ = request.reply.send(Err(DispatchError::QueueTimeout {
                waited_ms,
                retry_after_ms: retry_after_hint(queue_size),
                queue_size,
            }));
        }
    }

    /// Wait for the next dispatchable request. Expired requests are failed on
    /// the way. Returns `None` once `shutdown` flips.
    pub async fn pop_ready(&self, shutdown: &mut watch::Receiver<bool>) -> Option<QueuedRequest<R>> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            self.sweep_expired();
            {
                let mut pending = self.pending.lock().expect("queue lock poisoned");
                if let Some(request) = pending.pop_front() {
                    METRICS.queue_depth.set(pending.len() as f64);
                    return Some(request);
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Fail every pending request with a shutdown error.
    pub fn clear_for_shutdown(&self) {
        let drained: Vec<QueuedRequest<R>> = {
            let mut pending = self.pending.lock().expect("queue lock poisoned");
            METRICS.queue_depth.set(0.0);
            pending.drain(..).collect()
        };
        for request in drained {
            debug!(request.id = %request.id, "failing queued request on shutdown");
            let _ = request.reply.send(Err(DispatchError::ShuttingDown));
        }
    }
}
