//! In-memory [`KeyValueStore`] implementation.
//!
//! Uses a `HashMap` behind a `std::sync::RwLock`. Expiry is checked
//! against an injected [`Clock`]: expired entries are invisible to `get`
//! immediately and are physically removed by `purge_expired`.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::clock::{Clock, SystemClock};

use super::KeyValueStore;

struct StoredValue {
    value: String,
    expires_at_ms: Option<u64>,
}

impl StoredValue {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|exp| now_ms >= exp)
    }
}

/// Process-local store for single-instance deployments and tests.
pub struct InMemoryKvStore {
    entries: RwLock<HashMap<String, StoredValue>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).is_empty()
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now_ms();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .get(key)
            .filter(|stored| !stored.is_expired(now))
            .map(|stored| stored.value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let expires_at_ms = ttl.map(|ttl| {
            let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
            self.clock.now_ms().saturating_add(ttl_ms)
        });
        self.entries.write().unwrap_or_else(PoisonError::into_inner).insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at_ms,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, stored| !stored.is_expired(now));
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_at(start: u64) -> (Arc<ManualClock>, InMemoryKvStore) {
        let clock = Arc::new(ManualClock::new(start));
        let store = InMemoryKvStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let (_clock, store) = store_at(0);
        store.set("a", "1".into(), None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));

        store.set("a", "2".into(), None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("2"));

        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_hides_expired_entries() {
        let (clock, store) = store_at(1_000);
        store
            .set("k", "v".into(), Some(Duration::from_secs(60)))
            .await
            .unwrap();

        clock.advance(59_999);
        assert!(store.get("k").await.unwrap().is_some());

        clock.advance(1);
        assert!(store.get("k").await.unwrap().is_none());
        // Still physically present until purged.
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_purge_expired_only_drops_expired() {
        let (clock, store) = store_at(0);
        store
            .set("short", "1".into(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        store
            .set("long", "2".into(), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        store.set("forever", "3".into(), None).await.unwrap();

        clock.advance(11);
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.len(), 2);
        assert!(store.get("long").await.unwrap().is_some());
        assert!(store.get("forever").await.unwrap().is_some());
    }
}
