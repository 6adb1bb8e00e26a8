// src/error.rs

use thiserror::Error;

/// Boxed error returned by the caller's request function.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced at the dispatcher facade.
///
/// Per-request failures carry actionable fields (retry hints, counts) that a
/// caller can use to throttle. Configuration errors are raised synchronously
/// at construction or mutation and are fatal to that operation.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("invalid key config for '{key_id}': {reason}")]
    InvalidKeyConfig { key_id: String, reason: String },

    #[error("invalid pool config: {reason}")]
    InvalidPoolConfig { reason: String },

    #[error("key pool created with no keys configured")]
    NoKeysConfigured,

    #[error("key '{key_id}' not found")]
    KeyNotFound { key_id: String },

    #[error("request queue is full ({queue_size}/{max_queue_size})")]
    QueueFull {
        queue_size: usize,
        max_queue_size: usize,
        retry_after_ms: u64,
    },

    #[error("request timed out after {waited_ms}ms waiting in queue")]
    QueueTimeout {
        waited_ms: u64,
        retry_after_ms: u64,
        queue_size: usize,
    },

    #[error(
        "all {total_keys} keys exhausted ({exhausted_keys} over quota, \
         {circuit_open_keys} circuit-open, {rate_limited_keys} rate-limited)"
    )]
    AllKeysExhausted {
        total_keys: usize,
        exhausted_keys: usize,
        circuit_open_keys: usize,
        rate_limited_keys: usize,
        retry_after_ms: u64,
    },

    #[error("dispatcher is shutting down")]
    ShuttingDown,

    #[error("upstream request failed: {0}")]
    Upstream(BoxError),

    #[error("storage operation failed: {message}")]
    Storage { message: String },
}

impl DispatchError {
    /// Create a new invalid-key-config error.
    pub fn invalid_key(key_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKeyConfig {
            key_id: key_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a new storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Whether the caller can retry later with a reasonable chance of success.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QueueFull { .. } | Self::QueueTimeout { .. } | Self::AllKeysExhausted { .. }
        )
    }

    /// Suggested wait before retrying, if this error carries one.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::QueueFull { retry_after_ms, .. }
            | Self::QueueTimeout { retry_after_ms, .. }
            | Self::AllKeysExhausted { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

/// Result type alias for the crate.
pub type Result<T, E = DispatchError> = std::result::Result<T, E>;
