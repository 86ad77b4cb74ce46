//! Cross-instance fan-out over the coordination store's pub/sub.
//!
//! Each local room with members owns one listener task subscribed to channel
//! `room:{uuid}`. Envelopes published on this instance go through a single
//! bounded queue drained by one publisher task, which keeps per-room order
//! for everything this instance sends. Every bridge frame carries the origin
//! instance id; listeners drop their own frames so local members see each
//! envelope exactly once.
//!
//! Delivery is fire-and-forget and at most once. Nothing here blocks a
//! client: while the store is Degraded, publishes are skipped and listeners
//! wait for Healthy.

#![allow(clippy::disallowed_types, reason = "Publisher receiver slot is taken once")]

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use switchyard_core::Environment;
use switchyard_proto::Envelope;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    availability::{AvailabilityState, FailureReporter},
    store::{CoordinationStore, StoreError, Subscription},
};

/// Channel prefix for room fan-out.
pub const ROOM_CHANNEL_PREFIX: &str = "room:";

/// Publishes that may wait for the publisher task.
pub const DEFAULT_PUBLISH_QUEUE_CAPACITY: usize = 4096;

/// Delay before resubscribing after a failed or broken subscription.
pub const DEFAULT_RESUBSCRIBE_BACKOFF: Duration = Duration::from_millis(500);

const COMPONENT: &str = "fanout_bridge";

/// Channel name for a room.
pub fn room_channel(room_id: Uuid) -> String {
    format!("{ROOM_CHANNEL_PREFIX}{room_id}")
}

/// Local side of the bridge: hands remote envelopes to local members.
pub trait LocalDelivery: Send + Sync + 'static {
    /// Deliver to local members of `room_id`.
    fn deliver(&self, room_id: Uuid, envelope: Arc<Envelope>, exclude_sender: bool);
}

/// Opens remote subscriptions for rooms.
///
/// Implementations must not block: the registry calls this under its lock.
pub trait RoomSubscriber: Send + Sync + 'static {
    /// Start listening for remote envelopes of `room_id`.
    fn ensure_subscribed(&self, room_id: Uuid, delivery: Arc<dyn LocalDelivery>) -> SubscriptionHandle;

    /// Stop listening. Dropping the handle has the same effect.
    fn unsubscribe(&self, handle: SubscriptionHandle) {
        tracing::debug!(room_id = %handle.room_id(), "Unsubscribing room");
        drop(handle);
    }
}

/// Opaque ownership of one room's remote subscription.
///
/// The listener stops when the handle is dropped.
#[derive(Debug)]
pub struct SubscriptionHandle {
    room_id: Uuid,
    token: CancellationToken,
    live: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    /// Handle for a listener driven by `token`.
    pub fn new(room_id: Uuid, token: CancellationToken) -> Self {
        Self { room_id, token, live: Arc::new(AtomicBool::new(false)) }
    }

    /// Room this handle belongs to.
    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    /// Whether the listener currently holds a store subscription.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Result of [`FanoutBridge::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the publisher task
    Queued,
    /// Store is Degraded; nothing was sent
    SkippedDegraded,
    /// Publish queue full or closed; the envelope was discarded
    Dropped,
}

/// Counters for tests and `/healthz`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    /// Frames written to the store
    pub published: u64,
    /// Publishes skipped while Degraded
    pub skipped: u64,
    /// Publishes discarded because the queue was full
    pub dropped: u64,
    /// Remote envelopes handed to local delivery
    pub received: u64,
    /// Listener tasks running
    pub listeners: usize,
    /// Listeners holding a live store subscription
    pub live_subscriptions: usize,
}

#[derive(Serialize)]
struct OutgoingFrame<'a> {
    origin: Uuid,
    exclude_sender: bool,
    envelope: &'a Envelope,
}

#[derive(Deserialize)]
struct IncomingFrame {
    origin: Uuid,
    exclude_sender: bool,
    envelope: Envelope,
}

struct Outgoing {
    room_id: Uuid,
    payload: Bytes,
}

struct BridgeInner<E: Environment> {
    env: E,
    instance_id: Uuid,
    store: Arc<dyn CoordinationStore>,
    availability: Arc<AvailabilityState>,
    reporter: Arc<dyn FailureReporter>,
    resubscribe_backoff: Duration,
    tx: mpsc::Sender<Outgoing>,
    rx: Mutex<Option<mpsc::Receiver<Outgoing>>>,
    root: CancellationToken,
    published: AtomicU64,
    skipped: AtomicU64,
    dropped: AtomicU64,
    received: AtomicU64,
    listeners: AtomicUsize,
    live: AtomicUsize,
}

/// Cross-instance fan-out bridge. Clones share one bridge.
pub struct FanoutBridge<E: Environment> {
    inner: Arc<BridgeInner<E>>,
}

impl<E: Environment> Clone for FanoutBridge<E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<E: Environment> FanoutBridge<E> {
    /// Create a bridge. Listener tasks are children of `root`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        env: E,
        instance_id: Uuid,
        store: Arc<dyn CoordinationStore>,
        availability: Arc<AvailabilityState>,
        reporter: Arc<dyn FailureReporter>,
        publish_queue_capacity: usize,
        resubscribe_backoff: Duration,
        root: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(publish_queue_capacity.max(1));
        Self {
            inner: Arc::new(BridgeInner {
                env,
                instance_id,
                store,
                availability,
                reporter,
                resubscribe_backoff,
                tx,
                rx: Mutex::new(Some(rx)),
                root,
                published: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                received: AtomicU64::new(0),
                listeners: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
            }),
        }
    }

    /// Origin id stamped on this instance's frames.
    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    /// Current counters.
    pub fn stats(&self) -> BridgeStats {
        let inner = &self.inner;
        BridgeStats {
            published: inner.published.load(Ordering::Relaxed),
            skipped: inner.skipped.load(Ordering::Relaxed),
            dropped: inner.dropped.load(Ordering::Relaxed),
            received: inner.received.load(Ordering::Relaxed),
            listeners: inner.listeners.load(Ordering::Relaxed),
            live_subscriptions: inner.live.load(Ordering::Relaxed),
        }
    }

    /// Send an envelope to the room's members on other instances.
    ///
    /// A no-op returning [`PublishOutcome::SkippedDegraded`] while the store
    /// is Degraded. Never blocks.
    pub fn publish(&self, room_id: Uuid, envelope: &Envelope, exclude_sender: bool) -> PublishOutcome {
        let inner = &self.inner;
        if !inner.availability.is_healthy() {
            inner.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(%room_id, kind = %envelope.kind(), "Degraded, skipping remote publish");
            return PublishOutcome::SkippedDegraded;
        }

        let frame = OutgoingFrame { origin: inner.instance_id, exclude_sender, envelope };
        let payload = match serde_json::to_vec(&frame) {
            Ok(bytes) => Bytes::from(bytes),
            Err(error) => {
                tracing::error!(%room_id, %error, "Failed to encode bridge frame");
                inner.dropped.fetch_add(1, Ordering::Relaxed);
                return PublishOutcome::Dropped;
            },
        };

        match inner.tx.try_send(Outgoing { room_id, payload }) {
            Ok(()) => PublishOutcome::Queued,
            Err(error) => {
                inner.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%room_id, %error, "Publish queue unavailable, dropping envelope");
                PublishOutcome::Dropped
            },
        }
    }

    /// Drain the publish queue until cancelled, then flush what is left.
    ///
    /// Only the first call does anything; later calls return immediately.
    pub async fn run_publisher(self, cancel: CancellationToken) {
        let Some(mut rx) = self.inner.rx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            tracing::warn!("Publisher already running");
            return;
        };

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => break,
                next = rx.recv() => next,
            };
            let Some(outgoing) = next else { break };
            self.inner.send(outgoing).await;
        }

        rx.close();
        let mut flushed = 0usize;
        while let Ok(outgoing) = rx.try_recv() {
            self.inner.send(outgoing).await;
            flushed += 1;
        }
        tracing::debug!(flushed, "Publisher stopped");
    }
}

impl<E: Environment> BridgeInner<E> {
    async fn send(&self, outgoing: Outgoing) {
        if !self.availability.is_healthy() {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self.store.publish(&room_channel(outgoing.room_id), outgoing.payload).await {
            Ok(receivers) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(room_id = %outgoing.room_id, receivers, "Published");
            },
            Err(error) => {
                tracing::debug!(room_id = %outgoing.room_id, %error, "Publish failed");
                self.reporter.report_failure(COMPONENT, &error);
            },
        }
    }

    /// Handle one raw frame from the store.
    fn on_frame(&self, room_id: Uuid, raw: &[u8], delivery: &dyn LocalDelivery) {
        let frame: IncomingFrame = match serde_json::from_slice(raw) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::warn!(%room_id, %error, "Dropping undecodable bridge frame");
                return;
            },
        };

        if frame.origin == self.instance_id {
            return;
        }
        if frame.envelope.room_id != room_id {
            tracing::warn!(%room_id, other = %frame.envelope.room_id, "Dropping frame for another room");
            return;
        }

        self.received.fetch_add(1, Ordering::Relaxed);
        delivery.deliver(room_id, Arc::new(frame.envelope), frame.exclude_sender);
    }

    /// Sleep for the backoff. Returns `false` if cancelled first.
    async fn backoff(&self, token: &CancellationToken) -> bool {
        tokio::select! {
            () = token.cancelled() => false,
            () = self.env.sleep(self.resubscribe_backoff) => true,
        }
    }

    async fn listen(
        self: Arc<Self>,
        room_id: Uuid,
        delivery: Arc<dyn LocalDelivery>,
        token: CancellationToken,
        live: Arc<AtomicBool>,
    ) {
        let channel = room_channel(room_id);
        self.listeners.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%room_id, "Room listener started");

        'outer: while self.availability.wait_healthy(&token).await {
            let mut subscription: Subscription = match self.store.subscribe(&channel).await {
                Ok(subscription) => subscription,
                Err(error) => {
                    tracing::debug!(%room_id, %error, "Subscribe failed");
                    self.reporter.report_failure(COMPONENT, &error);
                    if !self.backoff(&token).await {
                        break;
                    }
                    continue;
                },
            };

            live.store(true, Ordering::Release);
            self.live.fetch_add(1, Ordering::Relaxed);

            loop {
                let next = tokio::select! {
                    () = token.cancelled() => None,
                    next = subscription.recv() => next,
                };
                match next {
                    Some(raw) => self.on_frame(room_id, &raw, delivery.as_ref()),
                    None => break,
                }
            }

            live.store(false, Ordering::Release);
            self.live.fetch_sub(1, Ordering::Relaxed);

            if token.is_cancelled() {
                break 'outer;
            }

            tracing::warn!(%room_id, "Room subscription broken, resubscribing");
            self.reporter.report_failure(COMPONENT, &StoreError::Unavailable("subscription stream ended".into()));
            if !self.backoff(&token).await {
                break;
            }
        }

        self.listeners.fetch_sub(1, Ordering::Relaxed);
        tracing::debug!(%room_id, "Room listener stopped");
    }
}

impl<E: Environment> RoomSubscriber for FanoutBridge<E> {
    fn ensure_subscribed(&self, room_id: Uuid, delivery: Arc<dyn LocalDelivery>) -> SubscriptionHandle {
        let handle = SubscriptionHandle::new(room_id, self.inner.root.child_token());
        tokio::spawn(Arc::clone(&self.inner).listen(
            room_id,
            delivery,
            handle.token.clone(),
            Arc::clone(&handle.live),
        ));
        handle
    }
}
