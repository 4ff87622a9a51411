//! In-process [`CacheStore`] used by tests and `--no-cache` runs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use markwise_shared::{CacheEntry, MarkwiseError, Result, Stage, cache_key};

use crate::{CacheStore, expiry};

/// Cache that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

fn poisoned() -> MarkwiseError {
    MarkwiseError::Storage("memory cache lock poisoned".into())
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, url: &str, stage: Stage) -> Result<Option<CacheEntry>> {
        let key = cache_key(url, stage);
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;

        match entries.get(&key) {
            Some(entry) if entry.is_expired_at(Utc::now()) => {
                entries.remove(&key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.clone())),
            None => Ok(None),
        }
    }

    async fn put(&self, url: &str, stage: Stage, payload: &str, ttl: Duration) -> Result<()> {
        let key = cache_key(url, stage);
        let now = Utc::now();
        let entry = CacheEntry {
            key: key.clone(),
            url: url.to_string(),
            stage,
            payload: payload.to_string(),
            created_at: now,
            expires_at: expiry(now, ttl),
        };

        self.entries
            .lock()
            .map_err(|_| poisoned())?
            .insert(key, entry);
        Ok(())
    }
}
