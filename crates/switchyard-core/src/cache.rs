//! Bounded local cache with per-entry TTL.
//!
//! [`CacheMap`] is the pure data structure: time is passed in, nothing locks.
//! [`ResilientCache`] wraps it behind a mutex and reads time from an
//! [`Environment`], which is what the state store and the presence writer use
//! to keep working while the coordination store is unreachable.
//!
//! Recency is tracked with a monotonically increasing stamp per access and a
//! `BTreeMap` from stamp to key, so the least recently used entry is always
//! the first key of that map.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{BTreeMap, HashMap},
    ops::Sub,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use bytes::Bytes;

use crate::env::Environment;

/// Default maximum number of entries.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Default interval of the background expiry sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CacheEntry<I> {
    value: Bytes,
    inserted_at: I,
    ttl: Duration,
    stamp: u64,
}

impl<I> CacheEntry<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    fn is_expired(&self, now: I) -> bool {
        now >= self.inserted_at && now - self.inserted_at >= self.ttl
    }

    fn remaining(&self, now: I) -> Duration {
        if now < self.inserted_at {
            return self.ttl;
        }
        self.ttl.saturating_sub(now - self.inserted_at)
    }
}

/// LRU map with per-entry TTL.
///
/// # Invariants
///
/// - `len() <= capacity()` after every operation
/// - An entry whose TTL elapsed is never returned, swept or not
/// - `recency` holds exactly one stamp per live entry
#[derive(Debug, Clone)]
pub struct CacheMap<I> {
    capacity: usize,
    entries: HashMap<String, CacheEntry<I>>,
    recency: BTreeMap<u64, String>,
    next_stamp: u64,
}

impl<I> CacheMap<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Create an empty map. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_stamp: 0,
        }
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn bump(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        stamp
    }

    /// Insert or replace an entry. The entry becomes most recently used.
    ///
    /// At capacity, expired entries are dropped before any live entry is
    /// evicted. Returns the live keys evicted to make room, least recent
    /// first.
    pub fn put(&mut self, key: impl Into<String>, value: Bytes, ttl: Duration, now: I) -> Vec<String> {
        let key = key.into();
        let mut evicted = Vec::new();

        if let Some(old) = self.entries.remove(&key) {
            self.recency.remove(&old.stamp);
        } else {
            if self.entries.len() >= self.capacity {
                self.sweep_expired(now);
            }
            while self.entries.len() >= self.capacity {
                let Some((_, lru_key)) = self.recency.pop_first() else {
                    break;
                };
                self.entries.remove(&lru_key);
                evicted.push(lru_key);
            }
        }

        let stamp = self.bump();
        self.recency.insert(stamp, key.clone());
        self.entries.insert(key, CacheEntry { value, inserted_at: now, ttl, stamp });

        evicted
    }

    /// Look up an entry and mark it most recently used.
    ///
    /// Expired entries are removed and reported as absent.
    pub fn get(&mut self, key: &str, now: I) -> Option<Bytes> {
        let expired = self.entries.get(key)?.is_expired(now);
        if expired {
            self.delete(key);
            return None;
        }

        let stamp = self.bump();
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.stamp);
        entry.stamp = stamp;
        self.recency.insert(stamp, key.to_string());
        Some(entry.value.clone())
    }

    /// Remove an entry. Returns whether it existed.
    pub fn delete(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.recency.remove(&entry.stamp);
                true
            },
            None => false,
        }
    }

    /// Time left before an entry expires. `None` if absent or expired.
    pub fn remaining_ttl(&self, key: &str, now: I) -> Option<Duration> {
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        Some(entry.remaining(now))
    }

    /// Live entries whose key starts with `prefix`, in key order.
    ///
    /// Does not change recency.
    pub fn scan_prefix(&self, prefix: &str, now: I) -> Vec<(String, Bytes)> {
        let mut found: Vec<(String, Bytes)> = self
            .entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired(now))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_expired(&mut self, now: I) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.delete(key);
        }
        expired.len()
    }

    /// Keys from least to most recently used.
    pub fn keys_by_recency(&self) -> Vec<String> {
        self.recency.values().cloned().collect()
    }
}

/// Thread-safe [`CacheMap`] driven by an [`Environment`] clock.
///
/// Entries are process-local. Two instances may disagree while the
/// coordination store is down.
pub struct ResilientCache<E: Environment> {
    env: E,
    inner: Mutex<CacheMap<E::Instant>>,
}

impl<E: Environment> ResilientCache<E> {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(env: E, capacity: usize) -> Self {
        Self { env, inner: Mutex::new(CacheMap::new(capacity)) }
    }

    fn with<R>(&self, f: impl FnOnce(&mut CacheMap<E::Instant>) -> R) -> R {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut map)
    }

    /// Insert or replace an entry, evicting the least recently used entries
    /// when full. Returns the evicted keys.
    pub fn put(&self, key: impl Into<String>, value: impl Into<Bytes>, ttl: Duration) -> Vec<String> {
        let now = self.env.now();
        let (key, value) = (key.into(), value.into());
        self.with(|map| map.put(key, value, ttl, now))
    }

    /// Look up a live entry.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let now = self.env.now();
        self.with(|map| map.get(key, now))
    }

    /// Remove an entry. Returns whether it existed.
    pub fn delete(&self, key: &str) -> bool {
        self.with(|map| map.delete(key))
    }

    /// Time left before an entry expires.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = self.env.now();
        self.with(|map| map.remaining_ttl(key, now))
    }

    /// Live entries whose key starts with `prefix`.
    pub fn scan_prefix(&self, prefix: &str) -> Vec<(String, Bytes)> {
        let now = self.env.now();
        self.with(|map| map.scan_prefix(prefix, now))
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.with(|map| map.len())
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.env.now();
        self.with(|map| map.sweep_expired(now))
    }
}
