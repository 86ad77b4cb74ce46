//! Redb-backed durable coordination store.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety, so call
//! records survive a restart of a single-node deployment. Pub/sub is
//! in-process only.
//!
//! Redb transactions are synchronous and may fsync, so every operation runs
//! on the blocking pool.

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use redb::{Database, TableDefinition};

use super::{CoordinationStore, StoreError, Subscription, broker::Broker};

/// Table: kv
/// Key: UTF-8 key
/// Value: expiry (8 bytes BE, unix millis, 0 = never) + value bytes
const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// Durable store backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    broker: Broker,
}

impl RedbStore {
    /// Open or create a Redb database at the given path.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        {
            let _ = txn.open_table(KV).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db), broker: Broker::default() })
    }

    /// Run `op` against the database on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db)).await.map_err(io)?
    }
}

#[async_trait]
impl CoordinationStore for RedbStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.blocking(|db| {
            let txn = db.begin_read().map_err(io)?;
            let _ = txn.open_table(KV).map_err(io)?;
            Ok(())
        })
        .await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expiry = ttl.map_or(0, |ttl| now_millis().saturating_add(ttl.as_millis() as u64).max(1));
        let encoded = encode_value(expiry, &value);
        let key = key.to_string();

        self.blocking(move |db| {
            let txn = db.begin_write().map_err(io)?;
            {
                let mut table = txn.open_table(KV).map_err(io)?;
                table.insert(key.as_str(), encoded.as_slice()).map_err(io)?;
            }
            txn.commit().map_err(io)
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let now = now_millis();
        let key = key.to_string();

        self.blocking(move |db| {
            let txn = db.begin_read().map_err(io)?;
            let table = txn.open_table(KV).map_err(io)?;
            let Some(guard) = table.get(key.as_str()).map_err(io)? else {
                return Ok(None);
            };
            Ok(decode_value(guard.value(), now))
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = now_millis();
        let key = key.to_string();

        self.blocking(move |db| {
            let txn = db.begin_write().map_err(io)?;
            let existed = {
                let mut table = txn.open_table(KV).map_err(io)?;
                let removed = table.remove(key.as_str()).map_err(io)?;
                removed.is_some_and(|guard| decode_value(guard.value(), now).is_some())
            };
            txn.commit().map_err(io)?;
            Ok(existed)
        })
        .await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>, StoreError> {
        let now = now_millis();
        let prefix = prefix.to_string();

        self.blocking(move |db| {
            let txn = db.begin_read().map_err(io)?;
            let table = txn.open_table(KV).map_err(io)?;

            let mut found = Vec::new();
            for entry in table.range(prefix.as_str()..).map_err(io)? {
                let (key, value) = entry.map_err(io)?;
                let key = key.value();
                if !key.starts_with(prefix.as_str()) {
                    break;
                }
                if let Some(value) = decode_value(value.value(), now) {
                    found.push((key.to_string(), value));
                }
            }
            Ok(found)
        })
        .await
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, StoreError> {
        Ok(self.broker.publish(channel, payload))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        Ok(self.broker.subscribe(channel))
    }
}

fn io(e: impl std::fmt::Display) -> StoreError {
    StoreError::Io(e.to_string())
}

fn encode_value(expiry_ms: u64, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + value.len());
    buf.extend_from_slice(&expiry_ms.to_be_bytes());
    buf.extend_from_slice(value);
    buf
}

/// Value bytes if the entry is still live.
fn decode_value(raw: &[u8], now_ms: u64) -> Option<Bytes> {
    let (expiry, value) = raw.split_first_chunk::<8>()?;
    let expiry = u64::from_be_bytes(*expiry);
    if expiry != 0 && now_ms >= expiry {
        return None;
    }
    Some(Bytes::copy_from_slice(value))
}

/// Wall-clock millis; records must expire across restarts.
#[allow(clippy::disallowed_methods)]
fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_encoding() {
        let raw = encode_value(0, b"abc");
        assert_eq!(decode_value(&raw, u64::MAX), Some(Bytes::from_static(b"abc")));

        let raw = encode_value(1_000, b"abc");
        assert_eq!(decode_value(&raw, 999), Some(Bytes::from_static(b"abc")));
        assert_eq!(decode_value(&raw, 1_000), None);

        assert_eq!(decode_value(&[1, 2, 3], 0), None);
    }

    #[tokio::test]
    async fn set_get_scan_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("hub.redb")).unwrap();

        store.set("call_state:a", Bytes::from_static(b"1"), None).await.unwrap();
        store.set("call_state:b", Bytes::from_static(b"2"), None).await.unwrap();
        store.set("presence:a", Bytes::from_static(b"3"), None).await.unwrap();

        assert_eq!(store.get("call_state:a").await.unwrap(), Some(Bytes::from_static(b"1")));

        let keys: Vec<String> =
            store.scan_prefix("call_state:").await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["call_state:a".to_string(), "call_state:b".to_string()]);

        assert!(store.delete("call_state:a").await.unwrap());
        assert_eq!(store.get("call_state:a").await.unwrap(), None);
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn expired_entries_are_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("hub.redb")).unwrap();

        store.set("short", Bytes::from_static(b"x"), Some(Duration::from_millis(1))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(store.get("short").await.unwrap(), None);
        assert!(store.scan_prefix("").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn writes_leave_the_runtime_thread_free() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("hub.redb")).unwrap();

        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ticker = tokio::spawn({
            let ticks = Arc::clone(&ticks);
            async move {
                loop {
                    ticks.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    tokio::task::yield_now().await;
                }
            }
        });

        for i in 0..20 {
            store.set(&format!("call_state:{i}"), Bytes::from_static(b"x"), None).await.unwrap();
        }
        assert!(ticks.load(std::sync::atomic::Ordering::Relaxed) > 0);
        assert_eq!(store.scan_prefix("call_state:").await.unwrap().len(), 20);

        ticker.abort();
    }
}
