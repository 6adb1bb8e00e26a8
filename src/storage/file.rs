// src/storage/file.rs

use crate::error::{DispatchError, Result};
use crate::storage::traits::QuotaStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// One JSON document per stored key. TTLs are recorded as an absolute UTC
/// expiry so they survive restarts.
#[derive(Debug, Serialize, Deserialize)]
struct FileRecord {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

/// On-disk store: one JSON file per namespaced key under a directory.
///
/// Filenames are a sanitized form of the key plus a hash suffix, so distinct
/// keys never collide. Unreadable or expired documents are treated as absent.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) the backing directory.
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            DispatchError::storage(format!(
                "cannot create storage directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let sanitized: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{sanitized}-{:x}.json", hasher.finish()))
    }
}

#[async_trait]
impl QuotaStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!(storage.key = %key, error = %e, "failed to read record, treating as absent");
                return Ok(None);
            }
        };

        let record: FileRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(storage.key = %key, error = %e, "malformed record, discarding");
                let _ = tokio::fs::remove_file(&path).await;
                return Ok(None);
            }
        };

        if record.expires_at.is_some_and(|at| Utc::now() >= at) {
            debug!(storage.key = %key, "record expired, removing");
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(None);
        }

        Ok(Some(record.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.and_then(|ttl| {
            ChronoDuration::from_std(ttl)
                .ok()
                .map(|ttl| Utc::now() + ttl)
        });
        let record = FileRecord {
            value: value.to_string(),
            expires_at,
        };
        let raw = serde_json::to_string(&record)
            .map_err(|e| DispatchError::storage(format!("cannot serialize record: {e}")))?;

        // Write-then-rename keeps readers from observing a torn document.
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw.as_bytes())
            .await
            .map_err(|e| DispatchError::storage(format!("cannot write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| DispatchError::storage(format!("cannot commit {}: {e}", path.display())))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DispatchError::storage(format!(
                "cannot delete {}: {e}",
                path.display()
            ))),
        }
    }
}
