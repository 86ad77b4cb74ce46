//! Coordination store abstraction.
//!
//! The coordination store is the one shared dependency between hub
//! instances: a key/value space with TTLs for call records and presence, and
//! a pub/sub bus for cross-instance fan-out. Every call may fail; callers
//! treat failures as availability signals, never as client errors.
//!
//! Backends:
//!
//! - [`MemoryStore`]: in-process broker. Clones share state, so several hubs
//!   in one process behave like separate instances on one store.
//! - [`RedbStore`]: durable single-node key/value store with local pub/sub.
//! - [`RedisStore`]: shared Redis server; the backend for running several
//!   instances side by side.
//! - [`ChaoticStore`]: fault-injection wrapper with a switchable outage.

mod broker;
mod chaotic;
mod error;
mod memory;
mod redb;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
pub use broker::Subscription;
use bytes::Bytes;
pub use chaotic::ChaoticStore;
pub use error::StoreError;
pub use memory::MemoryStore;

pub use self::{redb::RedbStore, redis::RedisStore};

/// Shared key/value and pub/sub dependency.
///
/// Implementations are internally synchronized and cheap to share behind an
/// `Arc`.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Liveness probe.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Store a value, replacing any previous one. `None` TTL never expires.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Fetch a live value.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Remove a value. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Every live entry whose key starts with `prefix`. Order is not
    /// guaranteed.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>, StoreError>;

    /// Publish to a channel. Returns how many subscribers received it.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, StoreError>;

    /// Subscribe to a channel. Messages published before this call are not
    /// delivered.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;
}
