// src/classify.rs

/// Caller-supplied classification of upstream responses.
///
/// The dispatcher never looks inside a response itself; it asks these
/// predicates, in order: rate-limited first, then error, otherwise the
/// attempt counts as a success.
pub trait ResponseClassifier<R>: Send + Sync {
    /// The response indicates the key was rate-limited (e.g. HTTP 429).
    fn is_rate_limited(&self, response: &R) -> bool;

    /// The response is a retryable upstream error (e.g. HTTP 5xx).
    fn is_error(&self, response: &R) -> bool;

    /// Accepted for forward compatibility; the dispatcher infers success as
    /// "not rate-limited and not error" and never consults this.
    fn is_success(&self, response: &R) -> bool {
        !self.is_rate_limited(response) && !self.is_error(response)
    }

    /// Seconds to avoid the key, extracted from a rate-limited response
    /// (e.g. a `Retry-After` header). `None` falls back to the pool default.
    fn retry_after(&self, response: &R) -> Option<u64> {
        let _ = response;
        None
    }

    /// Server-reported remaining quota, used for authoritative upward sync.
    fn quota_remaining(&self, response: &R) -> Option<u64> {
        let _ = response;
        None
    }
}

/// How the executor treats one classified attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RateLimited { retry_after_secs: Option<u64> },
    RetryableError,
}

/// Apply the classifier in spec order.
pub fn classify<R>(classifier: &dyn ResponseClassifier<R>, response: &R) -> Outcome {
    if classifier.is_rate_limited(response) {
        Outcome::RateLimited {
            retry_after_secs: classifier.retry_after(response),
        }
    } else if classifier.is_error(response) {
        Outcome::RetryableError
    } else {
        Outcome::Success
    }
}
