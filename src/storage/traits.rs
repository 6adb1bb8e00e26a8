// src/storage/traits.rs

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Key/value contract used to persist quota counters across restarts.
///
/// Keys are namespaced `quota:<keyId>`; values are small JSON documents.
/// Implementations must treat unknown keys as `None`, never fail on missing
/// data, and may silently drop writes under pressure — storage is a
/// best-effort durability layer, not a lock, and errors here never fail a
/// user request.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Fetch the value stored under `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}
