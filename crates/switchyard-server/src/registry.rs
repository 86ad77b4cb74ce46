//! Connection registry: rooms, their local members, and remote subscriptions.
//!
//! The registry exclusively owns the membership map. All of it sits behind
//! one mutex; nothing awaits or performs I/O while the lock is held. Opening
//! a room's remote subscription only spawns a listener, so it happens under
//! the lock and a room is never visible without its subscription.
//!
//! A room exists while it has local members or a pending recovery
//! reservation. Removing the room drops its [`SubscriptionHandle`], which
//! stops the listener.

#![allow(clippy::disallowed_types, reason = "Registry lock is never held across an await")]

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use switchyard_core::{Environment, HubError, Liveness, LivenessAction, LivenessConfig};
use switchyard_proto::{CloseCode, Envelope, MemberCount, Payload, RoomKind};
use uuid::Uuid;

use crate::{
    bridge::{LocalDelivery, RoomSubscriber, SubscriptionHandle},
    metrics::HubMetrics,
    outbound::{OutboundQueue, PushOutcome},
};

/// Random per-connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Per-instance limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryLimits {
    /// Live connections allowed on this instance
    pub max_connections: usize,
    /// Rooms allowed on this instance
    pub max_rooms: usize,
    /// Outbound queue capacity per connection
    pub outbound_capacity: usize,
    /// Heartbeat settings for new connections
    pub liveness: LivenessConfig,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_rooms: 10_000,
            outbound_capacity: crate::outbound::DEFAULT_OUTBOUND_CAPACITY,
            liveness: LivenessConfig::default(),
        }
    }
}

/// How a connection enters a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// New session; announced with `joined`
    Fresh,
    /// Session resumed after a disconnect or restart; announced with
    /// `reconnected`. Rejected if the identity is already present.
    Resume,
}

/// Successful join.
#[derive(Debug)]
pub struct Membership {
    /// Id of the new connection
    pub connection_id: ConnectionId,
    /// Queue the connection's writer drains
    pub queue: Arc<OutboundQueue>,
    /// Local members including the new one
    pub member_count: usize,
    /// `joined` or `reconnected` envelope already delivered locally
    pub announcement: Arc<Envelope>,
}

/// Result of removing a connection.
#[derive(Debug)]
pub struct Departure {
    /// Room the connection was in
    pub room_id: Uuid,
    /// Identity of the connection
    pub identity: Uuid,
    /// Kind of the room
    pub kind: RoomKind,
    /// Local members left
    pub member_count: usize,
    /// Whether the identity still has another connection in the room
    pub identity_still_present: bool,
    /// `left` envelope already delivered locally
    pub announcement: Arc<Envelope>,
    /// Whether the room was destroyed
    pub room_closed: bool,
}

/// Outcome of a local broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Connections that got the envelope queued
    pub delivered: usize,
    /// Connections whose overflow policy discarded it
    pub dropped: usize,
    /// Connections closed because a critical envelope did not fit
    pub overflowed: Vec<ConnectionId>,
}

/// Connection as seen by the protocol engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Room the connection is in
    pub room_id: Uuid,
    /// Authenticated identity
    pub identity: Uuid,
    /// Kind of the room
    pub kind: RoomKind,
}

/// Membership map snapshot for invariant checking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    /// Every room, ordered by id
    pub rooms: Vec<RoomSnapshot>,
    /// Every connection, ordered by id
    pub connections: Vec<ConnectionSnapshot>,
}

/// One room in a [`RegistrySnapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    /// Room id
    pub room_id: Uuid,
    /// Room kind
    pub kind: RoomKind,
    /// Member connections
    pub members: Vec<ConnectionId>,
    /// Whether the room holds a subscription handle
    pub subscribed: bool,
    /// Whether a recovery reservation is pending
    pub reserved: bool,
}

/// One connection in a [`RegistrySnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    /// Connection id
    pub connection_id: ConnectionId,
    /// Room the connection is in
    pub room_id: Uuid,
    /// Identity of the connection
    pub identity: Uuid,
    /// Whether the outbound queue is closing
    pub closing: bool,
}

struct ConnectionEntry<I>
where
    I: Copy + Ord + std::ops::Sub<Output = std::time::Duration>,
{
    room_id: Uuid,
    identity: Uuid,
    queue: Arc<OutboundQueue>,
    liveness: Liveness<I>,
    violations: u32,
}

struct RoomEntry<I> {
    kind: RoomKind,
    members: BTreeSet<ConnectionId>,
    subscription: Option<SubscriptionHandle>,
    /// Reservation start and length
    reservation: Option<(I, Duration)>,
}

impl<I> RoomEntry<I> {
    fn new(kind: RoomKind) -> Self {
        Self { kind, members: BTreeSet::new(), subscription: None, reservation: None }
    }

    fn is_disposable(&self) -> bool {
        self.members.is_empty() && self.reservation.is_none()
    }
}

struct Inner<E: Environment> {
    connections: HashMap<ConnectionId, ConnectionEntry<E::Instant>>,
    rooms: HashMap<Uuid, RoomEntry<E::Instant>>,
}

/// Registry of local connections and rooms. Clones share one registry.
pub struct ConnectionRegistry<E: Environment> {
    env: E,
    inner: Arc<Mutex<Inner<E>>>,
    subscriber: Arc<dyn RoomSubscriber>,
    metrics: Arc<dyn HubMetrics>,
    limits: RegistryLimits,
}

impl<E: Environment> Clone for ConnectionRegistry<E> {
    fn clone(&self) -> Self {
        Self {
            env: self.env.clone(),
            inner: Arc::clone(&self.inner),
            subscriber: Arc::clone(&self.subscriber),
            metrics: Arc::clone(&self.metrics),
            limits: self.limits,
        }
    }
}

impl<E: Environment> ConnectionRegistry<E> {
    /// Empty registry.
    pub fn new(
        env: E,
        subscriber: Arc<dyn RoomSubscriber>,
        metrics: Arc<dyn HubMetrics>,
        limits: RegistryLimits,
    ) -> Self {
        Self {
            env,
            inner: Arc::new(Mutex::new(Inner { connections: HashMap::new(), rooms: HashMap::new() })),
            subscriber,
            metrics,
            limits,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_gauges(&self, inner: &Inner<E>) {
        self.metrics.set_active_connections(inner.connections.len());
        self.metrics.set_active_rooms(inner.rooms.len());
    }

    /// Open the room's subscription if it has none.
    fn ensure_subscription(&self, room_id: Uuid, room: &mut RoomEntry<E::Instant>) {
        if room.subscription.is_none() {
            let delivery: Arc<dyn LocalDelivery> = Arc::new(self.clone());
            room.subscription = Some(self.subscriber.ensure_subscribed(room_id, delivery));
        }
    }

    /// Add a connection to a room, creating the room if needed.
    ///
    /// The announcement is delivered to every local member, the new one
    /// included.
    ///
    /// # Errors
    ///
    /// - `HubError::RoomKindMismatch` if the room exists with another kind
    /// - `HubError::DuplicateSession` when resuming an identity that is
    ///   already connected to the room
    /// - `HubError::ResourceExhausted` at the connection or room limit
    pub fn join(
        &self,
        room_id: Uuid,
        kind: RoomKind,
        identity: Uuid,
        mode: JoinMode,
    ) -> Result<Membership, HubError> {
        let now = self.env.now();
        let mut inner = self.lock();

        if let Some(room) = inner.rooms.get(&room_id) {
            if room.kind != kind {
                return Err(HubError::RoomKindMismatch { room_id, existing: room.kind, requested: kind });
            }
            if mode == JoinMode::Resume
                && room.members.iter().any(|c| inner.connections.get(c).is_some_and(|e| e.identity == identity))
            {
                return Err(HubError::DuplicateSession { room_id, identity });
            }
        } else if inner.rooms.len() >= self.limits.max_rooms {
            return Err(HubError::ResourceExhausted("room limit reached".into()));
        }

        if inner.connections.len() >= self.limits.max_connections {
            return Err(HubError::ResourceExhausted("connection limit reached".into()));
        }

        let connection_id = loop {
            let candidate = ConnectionId(self.env.random_u64());
            if !inner.connections.contains_key(&candidate) {
                break candidate;
            }
        };

        let queue = Arc::new(OutboundQueue::new(self.limits.outbound_capacity));
        inner.connections.insert(connection_id, ConnectionEntry {
            room_id,
            identity,
            queue: Arc::clone(&queue),
            liveness: Liveness::new(now, self.limits.liveness),
            violations: 0,
        });

        let room = inner.rooms.entry(room_id).or_insert_with(|| RoomEntry::new(kind));
        room.members.insert(connection_id);
        room.reservation = None;
        let member_count = room.members.len();
        self.ensure_subscription(room_id, room);

        let payload = match mode {
            JoinMode::Fresh => Payload::Joined(MemberCount { member_count }),
            JoinMode::Resume => Payload::Reconnected(MemberCount { member_count }),
        };
        let announcement = Arc::new(Envelope::new(room_id, identity, payload, self.env.wall_clock()));
        Self::fan_out(&inner, room_id, &announcement, false);
        self.publish_gauges(&inner);
        drop(inner);

        tracing::debug!(%room_id, %identity, %connection_id, member_count, ?mode, "Connection joined");
        Ok(Membership { connection_id, queue, member_count, announcement })
    }

    /// Remove a connection.
    ///
    /// Delivers `left` to the remaining members and destroys the room once
    /// it has no members and no reservation. Returns `None` if the
    /// connection is unknown.
    pub fn leave(&self, connection_id: ConnectionId) -> Option<Departure> {
        let mut inner = self.lock();
        let entry = inner.connections.remove(&connection_id)?;
        entry.queue.close(CloseCode::Normal);

        let room_id = entry.room_id;
        let (kind, member_count, room_closed) = match inner.rooms.get_mut(&room_id) {
            Some(room) => {
                room.members.remove(&connection_id);
                (room.kind, room.members.len(), room.is_disposable())
            },
            None => (RoomKind::Chat, 0, false),
        };

        let identity_still_present = inner.rooms.get(&room_id).is_some_and(|room| {
            room.members.iter().any(|c| inner.connections.get(c).is_some_and(|e| e.identity == entry.identity))
        });

        let removed = if room_closed { inner.rooms.remove(&room_id) } else { None };

        let announcement = Arc::new(Envelope::new(
            room_id,
            entry.identity,
            Payload::Left(MemberCount { member_count }),
            self.env.wall_clock(),
        ));
        Self::fan_out(&inner, room_id, &announcement, false);
        self.publish_gauges(&inner);

        // Stopped before the lock is released so a rejoin never overlaps it
        if let Some(handle) = removed.and_then(|room| room.subscription) {
            self.subscriber.unsubscribe(handle);
        }
        drop(inner);

        tracing::debug!(%room_id, identity = %entry.identity, %connection_id, member_count, room_closed, "Connection left");
        Some(Departure {
            room_id,
            identity: entry.identity,
            kind,
            member_count,
            identity_still_present,
            announcement,
            room_closed,
        })
    }

    fn fan_out(inner: &Inner<E>, room_id: Uuid, envelope: &Arc<Envelope>, exclude_sender: bool) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let Some(room) = inner.rooms.get(&room_id) else {
            return report;
        };

        let target = if envelope.kind().is_signaling() { envelope.payload.target_id() } else { None };

        for connection_id in &room.members {
            let Some(entry) = inner.connections.get(connection_id) else {
                continue;
            };
            if exclude_sender && entry.identity == envelope.sender_id {
                continue;
            }
            if target.is_some_and(|t| t != entry.identity) {
                continue;
            }

            match entry.queue.push(Arc::clone(envelope)) {
                PushOutcome::Queued | PushOutcome::DroppedOldest => report.delivered += 1,
                PushOutcome::DroppedNew => report.dropped += 1,
                PushOutcome::Overflowed => {
                    tracing::warn!(%room_id, %connection_id, "Outbound queue overflow, closing connection");
                    report.overflowed.push(*connection_id);
                },
                PushOutcome::Closed => {},
            }
        }
        report
    }

    /// Enqueue an envelope to every local member of a room without blocking.
    ///
    /// With `exclude_sender`, connections of the sender identity are skipped.
    /// Signaling envelopes naming a `target_id` only reach that identity.
    pub fn broadcast_local(&self, room_id: Uuid, envelope: &Arc<Envelope>, exclude_sender: bool) -> DeliveryReport {
        let inner = self.lock();
        Self::fan_out(&inner, room_id, envelope, exclude_sender)
    }

    /// Enqueue an envelope to one connection.
    pub fn send_to(&self, connection_id: ConnectionId, envelope: Arc<Envelope>) -> PushOutcome {
        match self.lock().connections.get(&connection_id) {
            Some(entry) => entry.queue.push(envelope),
            None => PushOutcome::Closed,
        }
    }

    /// Record inbound traffic for heartbeat tracking.
    pub fn touch(&self, connection_id: ConnectionId) {
        let now = self.env.now();
        if let Some(entry) = self.lock().connections.get_mut(&connection_id) {
            entry.liveness.on_inbound(now);
        }
    }

    /// Count a protocol violation. Returns the new total.
    pub fn record_violation(&self, connection_id: ConnectionId) -> u32 {
        self.lock().connections.get_mut(&connection_id).map_or(0, |entry| {
            entry.violations += 1;
            entry.violations
        })
    }

    /// Close one connection after its queued envelopes are sent.
    pub fn close(&self, connection_id: ConnectionId, code: CloseCode) {
        if let Some(entry) = self.lock().connections.get(&connection_id) {
            entry.queue.close(code);
        }
    }

    /// Close every local connection of a room.
    pub fn close_room(&self, room_id: Uuid, code: CloseCode) -> usize {
        let inner = self.lock();
        let Some(room) = inner.rooms.get(&room_id) else {
            return 0;
        };
        room.members
            .iter()
            .filter_map(|c| inner.connections.get(c))
            .inspect(|entry| entry.queue.close(code))
            .count()
    }

    /// Close every local connection.
    pub fn close_all(&self, code: CloseCode) -> usize {
        let inner = self.lock();
        for entry in inner.connections.values() {
            entry.queue.close(code);
        }
        inner.connections.len()
    }

    /// Room, identity and kind of a connection.
    pub fn connection_info(&self, connection_id: ConnectionId) -> Option<ConnectionInfo> {
        let inner = self.lock();
        let entry = inner.connections.get(&connection_id)?;
        let kind = inner.rooms.get(&entry.room_id)?.kind;
        Some(ConnectionInfo { room_id: entry.room_id, identity: entry.identity, kind })
    }

    /// Local members of a room.
    pub fn member_count(&self, room_id: Uuid) -> usize {
        self.lock().rooms.get(&room_id).map_or(0, |room| room.members.len())
    }

    /// Whether `identity` has a local connection in the room.
    pub fn has_identity(&self, room_id: Uuid, identity: Uuid) -> bool {
        let inner = self.lock();
        inner.rooms.get(&room_id).is_some_and(|room| {
            room.members.iter().any(|c| inner.connections.get(c).is_some_and(|e| e.identity == identity))
        })
    }

    /// Whether `identity` has a local connection in any room.
    pub fn is_connected(&self, identity: Uuid) -> bool {
        self.lock().connections.values().any(|entry| entry.identity == identity)
    }

    /// Kind of a local room.
    pub fn room_kind(&self, room_id: Uuid) -> Option<RoomKind> {
        self.lock().rooms.get(&room_id).map(|room| room.kind)
    }

    /// Whether the room's remote subscription currently holds a store
    /// subscription.
    pub fn is_subscribed(&self, room_id: Uuid) -> bool {
        self.lock()
            .rooms
            .get(&room_id)
            .and_then(|room| room.subscription.as_ref())
            .is_some_and(SubscriptionHandle::is_live)
    }

    /// Live local connections.
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Local rooms.
    pub fn room_count(&self) -> usize {
        self.lock().rooms.len()
    }

    /// Keep a room and its subscription alive for `window`, even without
    /// members. Used for rooms recovered from call records. The first join
    /// clears the reservation.
    ///
    /// Returns `false` if the room exists with another kind.
    pub fn reserve(&self, room_id: Uuid, kind: RoomKind, window: Duration) -> bool {
        let now = self.env.now();
        let mut inner = self.lock();
        let room = inner.rooms.entry(room_id).or_insert_with(|| RoomEntry::new(kind));
        if room.kind != kind {
            return false;
        }
        if room.members.is_empty() {
            room.reservation = Some((now, window));
        }
        self.ensure_subscription(room_id, room);
        self.publish_gauges(&inner);
        true
    }

    /// Drop reservations that expired by `now`. Returns the rooms destroyed.
    pub fn reap_reservations(&self, now: E::Instant) -> Vec<Uuid> {
        let mut inner = self.lock();
        let mut reaped = Vec::new();
        for (room_id, room) in &mut inner.rooms {
            let expired = room.reservation.is_some_and(|(at, window)| now > at && now - at >= window);
            if expired {
                room.reservation = None;
                if room.members.is_empty() {
                    reaped.push(*room_id);
                }
            }
        }

        let handles: Vec<SubscriptionHandle> = reaped
            .iter()
            .filter_map(|room_id| inner.rooms.remove(room_id))
            .filter_map(|room| room.subscription)
            .collect();
        self.publish_gauges(&inner);

        for handle in handles {
            tracing::info!(room_id = %handle.room_id(), "Recovery reservation expired");
            self.subscriber.unsubscribe(handle);
        }
        drop(inner);
        reaped
    }

    /// Drive heartbeats: request pings and close silent connections.
    ///
    /// Returns the connections closed for missing heartbeats. They stay
    /// registered until the transport calls [`ConnectionRegistry::leave`].
    pub fn tick(&self, now: E::Instant) -> Vec<ConnectionId> {
        let mut inner = self.lock();
        let mut timed_out = Vec::new();
        for (connection_id, entry) in &mut inner.connections {
            for action in entry.liveness.tick(now) {
                match action {
                    LivenessAction::SendPing => entry.queue.request_ping(),
                    LivenessAction::Close { code } => {
                        tracing::info!(%connection_id, identity = %entry.identity, "Heartbeat timeout");
                        entry.queue.close(code);
                        timed_out.push(*connection_id);
                    },
                }
            }
        }
        timed_out
    }

    /// Copy of the membership map.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.lock();

        let mut rooms: Vec<RoomSnapshot> = inner
            .rooms
            .iter()
            .map(|(room_id, room)| RoomSnapshot {
                room_id: *room_id,
                kind: room.kind,
                members: room.members.iter().copied().collect(),
                subscribed: room.subscription.is_some(),
                reserved: room.reservation.is_some(),
            })
            .collect();
        rooms.sort_by_key(|room| room.room_id);

        let mut connections: Vec<ConnectionSnapshot> = inner
            .connections
            .iter()
            .map(|(connection_id, entry)| ConnectionSnapshot {
                connection_id: *connection_id,
                room_id: entry.room_id,
                identity: entry.identity,
                closing: entry.queue.is_closed(),
            })
            .collect();
        connections.sort_by_key(|c| c.connection_id);

        RegistrySnapshot { rooms, connections }
    }
}

impl<E: Environment> LocalDelivery for ConnectionRegistry<E> {
    fn deliver(&self, room_id: Uuid, envelope: Arc<Envelope>, exclude_sender: bool) {
        let report = self.broadcast_local(room_id, &envelope, exclude_sender);
        tracing::trace!(%room_id, delivered = report.delivered, "Remote envelope delivered");
    }
}
