//! Call record persistence with degraded-mode fallback.
//!
//! Records live in the coordination store under `call_state:{uuid}` and are
//! written through to the resilience cache. While the store is unavailable
//! writes land in the cache only and are remembered as pending; the
//! controller's resync pass replays them once the store is back.

#![allow(clippy::disallowed_types, reason = "Pending set is only touched between awaits")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use bytes::Bytes;
use switchyard_core::{CallState, Environment, ResilientCache, call_state::CALL_STATE_PREFIX};
use uuid::Uuid;

use crate::{
    availability::{AvailabilityState, FailureReporter, ResyncTarget},
    metrics::HubMetrics,
    store::{CoordinationStore, StoreError},
};

const COMPONENT: &str = "state_store";

/// Where a write ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Written to the coordination store (and the cache)
    Stored,
    /// Written to the cache only; replayed on the next resync
    CachedOnly,
}

/// Write that still has to reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Upsert,
    Delete,
}

/// Call record repository.
pub struct StateStore<E: Environment> {
    store: Arc<dyn CoordinationStore>,
    cache: Arc<ResilientCache<E>>,
    availability: Arc<AvailabilityState>,
    reporter: Arc<dyn FailureReporter>,
    metrics: Arc<dyn HubMetrics>,
    pending: Mutex<HashMap<String, Pending>>,
}

impl<E: Environment> StateStore<E> {
    /// Create a repository over a store and a cache.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        cache: Arc<ResilientCache<E>>,
        availability: Arc<AvailabilityState>,
        reporter: Arc<dyn FailureReporter>,
        metrics: Arc<dyn HubMetrics>,
    ) -> Self {
        Self { store, cache, availability, reporter, metrics, pending: Mutex::new(HashMap::new()) }
    }

    /// Number of writes waiting for the store.
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Idempotent upsert.
    ///
    /// The record is kept for 24 hours, or 5 minutes once ended.
    ///
    /// # Errors
    ///
    /// - `StoreError::Serialization` if the record cannot be encoded
    pub async fn save(&self, state: &CallState) -> Result<SaveOutcome, StoreError> {
        let key = state.key();
        let ttl = state.retention();
        let bytes = Bytes::from(state.to_json().map_err(|e| StoreError::Serialization(e.to_string()))?);

        self.cache.put(key.clone(), bytes.clone(), ttl);

        if !self.availability.is_healthy() {
            self.mark(key, Pending::Upsert);
            return Ok(SaveOutcome::CachedOnly);
        }

        match self.store.set(&key, bytes, Some(ttl)).await {
            Ok(()) => {
                self.pending().remove(&key);
                Ok(SaveOutcome::Stored)
            },
            Err(error) => {
                tracing::warn!(call_id = %state.id, %error, "Call record write failed, keeping it in cache");
                self.reporter.report_failure(COMPONENT, &error);
                self.mark(key, Pending::Upsert);
                Ok(SaveOutcome::CachedOnly)
            },
        }
    }

    /// Fetch a record.
    ///
    /// # Errors
    ///
    /// - `StoreError::Serialization` if the stored record is corrupt
    pub async fn get(&self, id: Uuid) -> Result<Option<CallState>, StoreError> {
        let key = CallState::key_for(id);

        if !self.availability.is_healthy() {
            return self.fallback(&key);
        }

        // Newer than whatever the store has
        if self.pending().contains_key(&key) {
            return self.cached(&key);
        }

        match self.store.get(&key).await {
            Ok(Some(bytes)) => {
                let state = decode(&bytes)?;
                self.cache.put(key, bytes, state.retention());
                Ok(Some(state))
            },
            Ok(None) => {
                self.cache.delete(&key);
                Ok(None)
            },
            Err(error) => {
                tracing::debug!(call_id = %id, %error, "Call record read failed, serving from cache");
                self.reporter.report_failure(COMPONENT, &error);
                self.fallback(&key)
            },
        }
    }

    /// Remove a record.
    pub async fn delete(&self, id: Uuid) -> SaveOutcome {
        let key = CallState::key_for(id);
        self.cache.delete(&key);

        if !self.availability.is_healthy() {
            self.mark(key, Pending::Delete);
            return SaveOutcome::CachedOnly;
        }

        match self.store.delete(&key).await {
            Ok(_) => {
                self.pending().remove(&key);
                SaveOutcome::Stored
            },
            Err(error) => {
                self.reporter.report_failure(COMPONENT, &error);
                self.mark(key, Pending::Delete);
                SaveOutcome::CachedOnly
            },
        }
    }

    /// Every non-terminal record, ordered by id.
    ///
    /// # Errors
    ///
    /// - `StoreError::Serialization` if a cached record is corrupt
    pub async fn list_active(&self) -> Result<Vec<CallState>, StoreError> {
        let mut records: HashMap<String, CallState> = HashMap::new();

        let from_store = if self.availability.is_healthy() {
            match self.store.scan_prefix(CALL_STATE_PREFIX).await {
                Ok(entries) => Some(entries),
                Err(error) => {
                    tracing::warn!(%error, "Call record scan failed, serving from cache");
                    self.reporter.report_failure(COMPONENT, &error);
                    None
                },
            }
        } else {
            None
        };

        match from_store {
            Some(entries) => {
                for (key, bytes) in entries {
                    match decode(&bytes) {
                        Ok(state) => {
                            records.insert(key, state);
                        },
                        Err(error) => tracing::warn!(%key, %error, "Skipping corrupt call record"),
                    }
                }

                let pending: Vec<(String, Pending)> =
                    self.pending().iter().map(|(k, p)| (k.clone(), *p)).collect();
                for (key, op) in pending {
                    records.remove(&key);
                    if op == Pending::Upsert {
                        if let Some(state) = self.cached(&key)? {
                            records.insert(key, state);
                        }
                    }
                }
            },
            None => {
                let cached = self.cache.scan_prefix(CALL_STATE_PREFIX);
                if !cached.is_empty() {
                    self.metrics.inc_fallback_hit();
                }
                for (key, bytes) in cached {
                    records.insert(key, decode(&bytes)?);
                }
            },
        }

        let mut active: Vec<CallState> = records.into_values().filter(|s| !s.is_terminal()).collect();
        active.sort_by_key(|s| s.id);
        Ok(active)
    }

    /// Replay pending writes against the store.
    ///
    /// Upserts are re-saved with their remaining cache TTL; upserts whose
    /// cache entry expired are dropped. Stops at the first store error and
    /// keeps the rest pending.
    ///
    /// # Errors
    ///
    /// - Any store error from the replay
    pub async fn resync(&self) -> Result<usize, StoreError> {
        let batch: Vec<(String, Pending)> = self.pending().drain().collect();
        let mut written = 0;

        for (index, (key, op)) in batch.iter().enumerate() {
            let result = match op {
                Pending::Upsert => match (self.cache.remaining_ttl(key), self.cache.get(key)) {
                    (Some(ttl), Some(bytes)) => self.store.set(key, bytes, Some(ttl)).await.map(|()| true),
                    _ => Ok(false),
                },
                Pending::Delete => self.store.delete(key).await.map(|_| true),
            };

            match result {
                Ok(true) => written += 1,
                Ok(false) => tracing::debug!(%key, "Pending record expired before resync"),
                Err(error) => {
                    let mut pending = self.pending();
                    for (key, op) in &batch[index..] {
                        pending.entry(key.clone()).or_insert(*op);
                    }
                    return Err(error);
                },
            }
        }

        Ok(written)
    }

    fn cached(&self, key: &str) -> Result<Option<CallState>, StoreError> {
        self.cache.get(key).map(|bytes| decode(&bytes)).transpose()
    }

    /// Cache read in place of the store. Only a hit counts as a fallback hit.
    fn fallback(&self, key: &str) -> Result<Option<CallState>, StoreError> {
        let state = self.cached(key)?;
        if state.is_some() {
            self.metrics.inc_fallback_hit();
        }
        Ok(state)
    }

    fn mark(&self, key: String, op: Pending) {
        self.pending().insert(key, op);
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<E: Environment> ResyncTarget for StateStore<E> {
    fn name(&self) -> &'static str {
        COMPONENT
    }

    async fn resync(&self) -> Result<usize, StoreError> {
        StateStore::resync(self).await
    }
}

fn decode(bytes: &[u8]) -> Result<CallState, StoreError> {
    CallState::from_json(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}
