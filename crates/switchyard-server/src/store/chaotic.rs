//! Chaotic store wrapper for fault injection testing
//!
//! Store wrapper that fails operations to exercise degraded mode. Failures
//! come from two sources: a random failure rate (reproducible through a seed)
//! and a switchable outage that fails every call and breaks every open
//! subscription until it is lifted.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{CoordinationStore, StoreError, Subscription};

/// Chaotic store wrapper that injects failures
///
/// Delegates to an underlying store. Clones share the outage switch, the RNG
/// and the counters, so a test can keep a handle while the hub owns another.
#[derive(Clone)]
pub struct ChaoticStore<S: CoordinationStore + Clone> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
    /// Fail everything while set
    outage: Arc<AtomicBool>,
    /// Cancelled when an outage starts; replaced afterwards
    breaker: Arc<Mutex<CancellationToken>>,
    /// Operation counter
    operation_count: Arc<AtomicUsize>,
    /// Injected failure counter
    failure_count: Arc<AtomicUsize>,
}

/// Simple deterministic RNG for chaos injection
///
/// Uses linear congruential generator (LCG) for fast, deterministic randomness.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Generate next random value [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: CoordinationStore + Clone> ChaoticStore<S> {
    /// Wrap a store without random failures. Use [`ChaoticStore::set_outage`]
    /// to switch it off and on.
    pub fn new(inner: S) -> Self {
        Self::with_seed(inner, 0.0, 0x1234_5678_9ABC_DEF0)
    }

    /// Wrap a store with a random failure rate and an explicit seed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    #[allow(clippy::panic)]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            outage: Arc::new(AtomicBool::new(false)),
            breaker: Arc::new(Mutex::new(CancellationToken::new())),
            operation_count: Arc::new(AtomicUsize::new(0)),
            failure_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying store (for checking state after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Start or end an outage.
    ///
    /// Starting an outage breaks every subscription opened through this
    /// wrapper.
    pub fn set_outage(&self, down: bool) {
        let was_down = self.outage.swap(down, Ordering::SeqCst);
        if down && !was_down {
            let mut breaker = self.breaker.lock().unwrap_or_else(PoisonError::into_inner);
            breaker.cancel();
            *breaker = CancellationToken::new();
            tracing::info!("Injected coordination store outage");
        } else if !down && was_down {
            tracing::info!("Lifted coordination store outage");
        }
    }

    /// Whether an outage is in progress.
    pub fn is_down(&self) -> bool {
        self.outage.load(Ordering::SeqCst)
    }

    /// Total number of store operations attempted.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::Relaxed)
    }

    /// Number of operations that were failed on purpose.
    pub fn failure_count(&self) -> usize {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Count the operation and decide whether to fail it.
    fn check(&self, op: &'static str) -> Result<(), StoreError> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);

        let fail = self.is_down() || {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            rng.next() < self.failure_rate
        };

        if fail {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::Unavailable(format!("injected failure in {op}")));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: CoordinationStore + Clone> CoordinationStore for ChaoticStore<S> {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check("ping")?;
        self.inner.ping().await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check("set")?;
        self.inner.set(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.check("get")?;
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check("delete")?;
        self.inner.delete(key).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>, StoreError> {
        self.check("scan_prefix")?;
        self.inner.scan_prefix(prefix).await
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, StoreError> {
        self.check("publish")?;
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        self.check("subscribe")?;
        let token = self.breaker.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Ok(self.inner.subscribe(channel).await?.broken_by(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn outage_fails_everything_and_breaks_subscriptions() {
        let store = ChaoticStore::new(MemoryStore::new());
        let mut sub = store.subscribe("room:1").await.unwrap();

        store.set_outage(true);
        assert!(matches!(store.ping().await, Err(StoreError::Unavailable(_))));
        assert!(store.get("k").await.is_err());
        assert_eq!(sub.recv().await, None);

        store.set_outage(false);
        store.ping().await.unwrap();
        let mut sub = store.subscribe("room:1").await.unwrap();
        store.publish("room:1", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(sub.recv().await, Some(Bytes::from_static(b"x")));
    }

    #[tokio::test]
    async fn failure_rate_is_reproducible() {
        let run = |seed| async move {
            let store = ChaoticStore::with_seed(MemoryStore::new(), 0.5, seed);
            let mut pattern = Vec::new();
            for _ in 0..32 {
                pattern.push(store.ping().await.is_ok());
            }
            (pattern, store.failure_count(), store.operation_count())
        };

        let (a, failures, ops) = run(7).await;
        let (b, _, _) = run(7).await;
        assert_eq!(a, b);
        assert_eq!(ops, 32);
        assert!(failures > 0 && failures < 32);
    }

    #[tokio::test]
    async fn zero_rate_never_fails() {
        let store = ChaoticStore::new(MemoryStore::new());
        for _ in 0..100 {
            store.ping().await.unwrap();
        }
        assert_eq!(store.failure_count(), 0);
    }
}
