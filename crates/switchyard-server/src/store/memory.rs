#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use super::{CoordinationStore, StoreError, Subscription, broker::Broker};

/// In-memory coordination store for tests, simulation and single-node runs.
///
/// All state is wrapped in `Arc<Mutex<>>`, so clones share one key space and
/// one broker. Hubs built on clones of the same `MemoryStore` see each
/// other's publishes exactly like instances sharing a real store. Expiry uses
/// tokio's clock, so paused-time tests control it.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
    broker: Broker,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Key → (value, expiry)
    entries: HashMap<String, (Bytes, Option<Instant>)>,
}

impl MemoryStoreInner {
    fn live(&mut self, key: &str, now: Instant) -> Option<&Bytes> {
        let expired = self.entries.get(key).is_some_and(|(_, exp)| exp.is_some_and(|e| now >= e));
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|(value, _)| value)
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, including expired ones not yet read.
    ///
    /// Useful for debugging and testing.
    pub fn key_count(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expiry = ttl.map(|ttl| Instant::now() + ttl);
        self.lock().entries.insert(key.to_string(), (value, expiry));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.lock().live(key, Instant::now()).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let existed = inner.live(key, Instant::now()).is_some();
        inner.entries.remove(key);
        Ok(existed)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>, StoreError> {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.entries.retain(|_, (_, exp)| exp.is_none_or(|e| now < e));

        Ok(inner
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, (value, _))| (key.clone(), value.clone()))
            .collect())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, StoreError> {
        Ok(self.broker.publish(channel, payload))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        Ok(self.broker.subscribe(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let store = MemoryStore::new();

        store.set("a", Bytes::from_static(b"1"), None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(Bytes::from_static(b"1")));
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_entries() {
        let store = MemoryStore::new();
        store.set("a", Bytes::from_static(b"1"), Some(Duration::from_secs(5))).await.unwrap();
        store.set("b", Bytes::from_static(b"2"), None).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.get("a").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.scan_prefix("").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let a = MemoryStore::new();
        let b = a.clone();

        a.set("k", Bytes::from_static(b"v"), None).await.unwrap();
        assert_eq!(b.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));

        let mut sub = b.subscribe("room:x").await.unwrap();
        assert_eq!(a.publish("room:x", Bytes::from_static(b"hi")).await.unwrap(), 1);
        assert_eq!(sub.recv().await, Some(Bytes::from_static(b"hi")));
    }

    #[tokio::test]
    async fn scan_prefix_filters() {
        let store = MemoryStore::new();
        store.set("call_state:1", Bytes::from_static(b"a"), None).await.unwrap();
        store.set("call_state:2", Bytes::from_static(b"b"), None).await.unwrap();
        store.set("presence:1", Bytes::from_static(b"c"), None).await.unwrap();

        let mut keys: Vec<String> =
            store.scan_prefix("call_state:").await.unwrap().into_iter().map(|(k, _)| k).collect();
        keys.sort();
        assert_eq!(keys, vec!["call_state:1".to_string(), "call_state:2".to_string()]);
    }
}
