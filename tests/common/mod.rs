// tests/common/mod.rs

#![allow(dead_code)]

use keymux::{DispatchHooks, ResponseClassifier};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Opt-in log output while debugging a test run: RUST_LOG=debug cargo test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Response shape used across the integration tests: an HTTP-ish status plus
/// the optional hints a real upstream would carry.
#[derive(Debug, Clone)]
pub struct TestResponse {
    pub status: u16,
    pub retry_after: Option<u64>,
    pub quota_remaining: Option<u64>,
    /// Which key value the request function was handed.
    pub key: String,
}

impl TestResponse {
    pub fn ok(key: impl Into<String>) -> Self {
        Self {
            status: 200,
            retry_after: None,
            quota_remaining: None,
            key: key.into(),
        }
    }

    pub fn status(status: u16, key: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            quota_remaining: None,
            key: key.into(),
        }
    }
}

/// Status-code classification: 429 is rate-limited, 5xx is a retryable error.
pub struct StatusClassifier;

impl ResponseClassifier<TestResponse> for StatusClassifier {
    fn is_rate_limited(&self, response: &TestResponse) -> bool {
        response.status == 429
    }

    fn is_error(&self, response: &TestResponse) -> bool {
        response.status >= 500
    }

    fn retry_after(&self, response: &TestResponse) -> Option<u64> {
        response.retry_after
    }

    fn quota_remaining(&self, response: &TestResponse) -> Option<u64> {
        response.quota_remaining
    }
}

/// Hook recorder for asserting callback behavior.
#[derive(Default)]
pub struct RecordingHooks {
    pub warnings: Mutex<Vec<(String, f64)>>,
    pub exhausted: Mutex<Vec<String>>,
    pub circuit_opened: Mutex<Vec<String>>,
    pub all_exhausted: AtomicUsize,
}

impl RecordingHooks {
    pub fn warning_count(&self) -> usize {
        self.warnings.lock().unwrap().len()
    }

    pub fn circuit_opened_for(&self, key_id: &str) -> usize {
        self.circuit_opened
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == key_id)
            .count()
    }

    pub fn all_exhausted_count(&self) -> usize {
        self.all_exhausted.load(Ordering::SeqCst)
    }
}

impl DispatchHooks for RecordingHooks {
    fn on_warning(&self, key_id: &str, usage_percent: f64) {
        self.warnings
            .lock()
            .unwrap()
            .push((key_id.to_string(), usage_percent));
    }

    fn on_key_exhausted(&self, key_id: &str) {
        self.exhausted.lock().unwrap().push(key_id.to_string());
    }

    fn on_key_circuit_open(&self, key_id: &str) {
        self.circuit_opened.lock().unwrap().push(key_id.to_string());
    }

    fn on_all_keys_exhausted(&self) {
        self.all_exhausted.fetch_add(1, Ordering::SeqCst);
    }
}

/// Shared invocation log: which key value each call of the request function
/// received, in call order.
#[derive(Default)]
pub struct CallLog {
    calls: Mutex<Vec<String>>,
    counter: AtomicUsize,
}

impl CallLog {
    pub fn next(&self, key: &str) -> usize {
        self.calls.lock().unwrap().push(key.to_string());
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }
}
