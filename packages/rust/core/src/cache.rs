//! Cache access for the pipeline. Store failures degrade to misses.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use markwise_shared::Stage;
use markwise_storage::CacheStore;

/// Typed wrapper over a [`CacheStore`] that never fails a record.
///
/// Read errors and undecodable payloads count as misses; write errors are
/// logged and dropped. Each such event is counted for the run summary.
pub struct ResilientCache {
    inner: Arc<dyn CacheStore>,
    degraded: AtomicUsize,
}

impl ResilientCache {
    pub fn new(inner: Arc<dyn CacheStore>) -> Self {
        Self {
            inner,
            degraded: AtomicUsize::new(0),
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, url: &str, stage: Stage) -> Option<T> {
        let entry = match self.inner.get(url, stage).await {
            Ok(entry) => entry?,
            Err(e) => {
                self.degrade();
                warn!(url, stage = %stage, error = %e, "cache read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_str(&entry.payload) {
            Ok(value) => Some(value),
            Err(e) => {
                self.degrade();
                warn!(url, stage = %stage, error = %e, "cached payload unreadable, treating as miss");
                None
            }
        }
    }

    pub async fn put<T: Serialize>(&self, url: &str, stage: Stage, value: &T, ttl: Duration) {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                self.degrade();
                warn!(url, stage = %stage, error = %e, "failed to encode cache payload");
                return;
            }
        };

        if let Err(e) = self.inner.put(url, stage, &payload, ttl).await {
            self.degrade();
            warn!(url, stage = %stage, error = %e, "cache write failed, continuing without it");
        }
    }

    /// Reads and writes that fell back to uncached behaviour so far.
    pub fn degraded_events(&self) -> usize {
        self.degraded.load(Ordering::Relaxed)
    }

    fn degrade(&self) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use markwise_shared::{CacheEntry, GeneratedMetadata, MarkwiseError, Result};
    use markwise_storage::MemoryCache;

    struct BrokenStore;

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, _url: &str, _stage: Stage) -> Result<Option<CacheEntry>> {
            Err(MarkwiseError::Storage("disk gone".into()))
        }

        async fn put(&self, _: &str, _: Stage, _: &str, _: Duration) -> Result<()> {
            Err(MarkwiseError::Storage("disk gone".into()))
        }
    }

    fn metadata() -> GeneratedMetadata {
        GeneratedMetadata {
            url: "https://a.dev".into(),
            name: "A".into(),
            description: "Site A".into(),
            cost_units: 3,
            title_only: false,
        }
    }

    #[tokio::test]
    async fn typed_roundtrip() {
        let cache = ResilientCache::new(Arc::new(MemoryCache::new()));
        cache
            .put("https://a.dev", Stage::Metadata, &metadata(), Duration::from_secs(60))
            .await;

        let hit: Option<GeneratedMetadata> = cache.get("https://a.dev", Stage::Metadata).await;
        assert_eq!(hit, Some(metadata()));
        assert_eq!(cache.degraded_events(), 0);
    }

    #[tokio::test]
    async fn store_errors_degrade_to_misses() {
        let cache = ResilientCache::new(Arc::new(BrokenStore));
        cache
            .put("https://a.dev", Stage::Metadata, &metadata(), Duration::from_secs(60))
            .await;
        let hit: Option<GeneratedMetadata> = cache.get("https://a.dev", Stage::Metadata).await;

        assert!(hit.is_none());
        assert_eq!(cache.degraded_events(), 2);
    }

    #[tokio::test]
    async fn corrupt_payload_is_a_miss() {
        let store = Arc::new(MemoryCache::new());
        store
            .put("https://a.dev", Stage::Metadata, "{not json", Duration::from_secs(60))
            .await
            .unwrap();
        let cache = ResilientCache::new(store);

        let hit: Option<GeneratedMetadata> = cache.get("https://a.dev", Stage::Metadata).await;
        assert!(hit.is_none());
        assert_eq!(cache.degraded_events(), 1);
    }
}
