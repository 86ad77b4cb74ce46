//! In-process pub/sub shared by the memory and redb backends, and the
//! [`Subscription`] every backend hands out.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use bytes::Bytes;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::{CancellationToken, DropGuard};

/// Per-channel buffer. Subscribers further behind than this skip ahead.
pub(crate) const CHANNEL_CAPACITY: usize = 1024;

/// Channel name → broadcast sender.
#[derive(Clone, Default)]
pub(crate) struct Broker {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Bytes>>>>,
}

impl Broker {
    pub(crate) fn publish(&self, channel: &str, payload: Bytes) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = channels.get(channel) else {
            return 0;
        };

        match tx.send(payload) {
            Ok(n) => n,
            Err(_) => {
                // Every subscriber is gone
                channels.remove(channel);
                0
            },
        }
    }

    pub(crate) fn subscribe(&self, channel: &str) -> Subscription {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let rx = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        Subscription::new(channel, rx)
    }
}

/// Live subscription to one channel.
///
/// Delivery is at most once: a subscriber that falls behind skips the
/// messages it missed. The stream ends when the store breaks it (for example
/// on an outage); callers resubscribe.
pub struct Subscription {
    channel: String,
    rx: broadcast::Receiver<Bytes>,
    broken: CancellationToken,
    #[allow(dead_code, reason = "Held only for its Drop")]
    guard: Option<DropGuard>,
}

impl Subscription {
    pub(crate) fn new(channel: &str, rx: broadcast::Receiver<Bytes>) -> Self {
        Self { channel: channel.to_string(), rx, broken: CancellationToken::new(), guard: None }
    }

    /// End the stream when `token` is cancelled.
    pub(crate) fn broken_by(mut self, token: CancellationToken) -> Self {
        self.broken = token;
        self
    }

    /// Cancel `guard` when the subscription is dropped.
    pub(crate) fn with_guard(mut self, guard: DropGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message. `None` once the stream is broken or closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            let next = tokio::select! {
                () = self.broken.cancelled() => return None,
                next = self.rx.recv() => next,
            };

            match next {
                Ok(payload) => return Some(payload),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(channel = %self.channel, skipped, "Subscriber lagged, skipping");
                },
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let broker = Broker::default();
        let mut a = broker.subscribe("room:1");
        let mut b = broker.subscribe("room:1");
        let mut other = broker.subscribe("room:2");

        assert_eq!(broker.publish("room:1", Bytes::from_static(b"x")), 2);
        assert_eq!(a.recv().await, Some(Bytes::from_static(b"x")));
        assert_eq!(b.recv().await, Some(Bytes::from_static(b"x")));

        assert_eq!(broker.publish("room:2", Bytes::from_static(b"y")), 1);
        assert_eq!(other.recv().await, Some(Bytes::from_static(b"y")));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let broker = Broker::default();
        assert_eq!(broker.publish("room:1", Bytes::from_static(b"x")), 0);

        let mut late = broker.subscribe("room:1");
        broker.publish("room:1", Bytes::from_static(b"z"));
        assert_eq!(late.recv().await, Some(Bytes::from_static(b"z")));
    }

    #[tokio::test]
    async fn broken_subscription_ends() {
        let broker = Broker::default();
        let token = CancellationToken::new();
        let mut sub = broker.subscribe("room:1").broken_by(token.clone());

        token.cancel();
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn dropping_subscription_releases_guard() {
        let broker = Broker::default();
        let lifetime = CancellationToken::new();
        let sub = broker.subscribe("room:1").with_guard(lifetime.clone().drop_guard());

        assert!(!lifetime.is_cancelled());
        drop(sub);
        assert!(lifetime.is_cancelled());
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_ahead() {
        let broker = Broker::default();
        let mut sub = broker.subscribe("room:1");

        for i in 0..(CHANNEL_CAPACITY + 10) {
            broker.publish("room:1", Bytes::from(i.to_be_bytes().to_vec()));
        }

        let first = sub.recv().await.unwrap();
        let expected = 10usize.to_be_bytes();
        assert_eq!(first.as_ref(), expected.as_slice());
    }
}
