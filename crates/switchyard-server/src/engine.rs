//! Protocol engine: admission, dispatch and call lifecycle.
//!
//! Sits between the transport and the registry. The transport hands it
//! authenticated admissions, inbound text frames and disconnects; the engine
//! validates, updates call records and presence, and fans envelopes out
//! locally and through the bridge.
//!
//! # Dispatch
//!
//! ```text
//! chat room: message ─> everyone (sender included)
//!            typing, presence ─> everyone but the sender
//! call room: offer, answer, ice_candidate, join, leave,
//!            mute_audio, mute_video ─> everyone but the sender,
//!            or only `target_id` when the payload names one
//! ```
//!
//! Anything else is a protocol violation: answered with an `error` envelope
//! and counted. Past `max_violations` the connection is closed with 4002.
//!
//! Presence writes never run on the reader: they are queued and a single
//! writer task applies them in order.

#![allow(clippy::disallowed_types, reason = "Presence receiver slot is taken once")]

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use switchyard_core::{CallState, Environment, HubError};
use switchyard_proto::{
    ClientFrame, CloseCode, Envelope, ErrorPayload, Payload, PresenceStatus, ProtocolError, RoomKind,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    availability::{AvailabilityState, FailureReporter},
    bridge::FanoutBridge,
    collaborators::{MembershipService, PresenceStore},
    registry::{ConnectionId, ConnectionInfo, ConnectionRegistry, Departure, JoinMode, Membership},
    state_store::StateStore,
    store::StoreError,
};

/// Violations tolerated before a connection is closed.
pub const DEFAULT_MAX_VIOLATIONS: u32 = 10;

/// Presence writes that take longer are abandoned and reported.
pub const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_millis(500);

/// Presence updates waiting for the writer. Further updates are dropped.
pub const DEFAULT_PRESENCE_QUEUE_CAPACITY: usize = 1024;

const PRESENCE_COMPONENT: &str = "presence";

/// Engine configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Violations tolerated before closing with 4002
    pub max_violations: u32,
    /// Upper bound on a presence write
    pub presence_timeout: Duration,
    /// Presence updates queued for the writer task
    pub presence_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_violations: DEFAULT_MAX_VIOLATIONS,
            presence_timeout: DEFAULT_PRESENCE_TIMEOUT,
            presence_queue_capacity: DEFAULT_PRESENCE_QUEUE_CAPACITY,
        }
    }
}

/// An authenticated client asking to enter a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmitRequest {
    /// Room to enter
    pub room_id: Uuid,
    /// Endpoint the client connected to
    pub kind: RoomKind,
    /// Verified identity
    pub identity: Uuid,
    /// Client is resuming an earlier session
    pub reconnect: bool,
}

/// What the transport should do after an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading
    Continue,
    /// Stop reading; the writer sends this close code after draining
    Close(CloseCode),
}

/// Validates and routes client traffic.
pub struct ProtocolEngine<E: Environment> {
    env: E,
    config: EngineConfig,
    registry: ConnectionRegistry<E>,
    bridge: FanoutBridge<E>,
    states: Arc<StateStore<E>>,
    membership: Arc<dyn MembershipService>,
    presence: Arc<dyn PresenceStore>,
    availability: Arc<AvailabilityState>,
    reporter: Arc<dyn FailureReporter>,
    /// Serializes read-modify-write of call records on this instance
    call_lock: tokio::sync::Mutex<()>,
    presence_tx: mpsc::Sender<(Uuid, PresenceStatus)>,
    presence_rx: Mutex<Option<mpsc::Receiver<(Uuid, PresenceStatus)>>>,
}

impl<E: Environment> ProtocolEngine<E> {
    /// Create an engine over the hub's components.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        env: E,
        config: EngineConfig,
        registry: ConnectionRegistry<E>,
        bridge: FanoutBridge<E>,
        states: Arc<StateStore<E>>,
        membership: Arc<dyn MembershipService>,
        presence: Arc<dyn PresenceStore>,
        availability: Arc<AvailabilityState>,
        reporter: Arc<dyn FailureReporter>,
    ) -> Self {
        let (presence_tx, presence_rx) = mpsc::channel(config.presence_queue_capacity.max(1));
        Self {
            env,
            config,
            registry,
            bridge,
            states,
            membership,
            presence,
            availability,
            reporter,
            call_lock: tokio::sync::Mutex::new(()),
            presence_tx,
            presence_rx: Mutex::new(Some(presence_rx)),
        }
    }

    /// Admit a connection into a room.
    ///
    /// Call rooms also update the call record: a fresh join adds the
    /// participant, a reconnect must match a live record that already lists
    /// the identity.
    ///
    /// # Errors
    ///
    /// - `HubError::Authorization` if the membership service refuses, or a
    ///   reconnecting identity is not a participant
    /// - `HubError::TerminalState` if the call has ended
    /// - `HubError::RoomNotFound` when reconnecting to a call with no record
    /// - `HubError::DuplicateSession` when reconnecting while already
    ///   connected
    /// - `HubError::RoomKindMismatch`, `HubError::ResourceExhausted` from the
    ///   registry
    pub async fn admit(&self, request: AdmitRequest) -> Result<Membership, HubError> {
        let AdmitRequest { room_id, kind, identity, reconnect } = request;

        if !self.membership.is_member(room_id, identity).await {
            tracing::info!(%room_id, %identity, "Admission refused by membership service");
            return Err(HubError::Authorization { room_id, identity });
        }

        let mode = if reconnect { JoinMode::Resume } else { JoinMode::Fresh };
        let membership = match kind {
            RoomKind::Chat => self.registry.join(room_id, kind, identity, mode)?,
            RoomKind::Call => self.admit_call(room_id, identity, mode).await?,
        };

        self.bridge.publish(room_id, &membership.announcement, false);
        self.update_presence(identity, PresenceStatus::Online);

        tracing::info!(
            %room_id,
            %identity,
            connection_id = %membership.connection_id,
            %kind,
            reconnect,
            "Connection admitted"
        );
        Ok(membership)
    }

    async fn admit_call(&self, room_id: Uuid, identity: Uuid, mode: JoinMode) -> Result<Membership, HubError> {
        let _guard = self.call_lock.lock().await;
        let now = self.env.wall_clock();
        let record = self.load_call(room_id).await;

        let updated = match (mode, record) {
            (JoinMode::Resume, None) => return Err(HubError::RoomNotFound { room_id }),
            (JoinMode::Resume, Some(record)) => {
                if record.is_terminal() {
                    return Err(HubError::TerminalState { room_id });
                }
                if !record.has_participant(identity) {
                    return Err(HubError::Authorization { room_id, identity });
                }
                None
            },
            (JoinMode::Fresh, record) => {
                let mut record = record.unwrap_or_else(|| CallState::new(room_id, now));
                record.add_participant(identity, now)?.then_some(record)
            },
        };

        let membership = self.registry.join(room_id, RoomKind::Call, identity, mode)?;
        if let Some(record) = updated {
            self.save_call(&record).await;
        }
        Ok(membership)
    }

    /// Process one inbound text frame.
    pub async fn handle_text(&self, connection_id: ConnectionId, text: &str) -> Flow {
        self.registry.touch(connection_id);
        let Some(info) = self.registry.connection_info(connection_id) else {
            return Flow::Close(CloseCode::Normal);
        };

        let envelope = match self.decode(info, text) {
            Ok(envelope) => envelope,
            Err(error) => return self.violation(connection_id, info, error),
        };

        match &envelope.payload {
            Payload::Message(_) => self.relay(envelope, false),
            Payload::Presence(presence) => {
                self.update_presence(info.identity, presence.status);
                self.relay(envelope, true);
            },
            Payload::Leave(_) => {
                self.relay(envelope, true);
                self.leave_call(info).await;
                self.registry.close(connection_id, CloseCode::Normal);
                return Flow::Close(CloseCode::Normal);
            },
            _ => self.relay(envelope, true),
        }
        Flow::Continue
    }

    /// Binary frames are not part of the protocol.
    pub fn handle_binary(&self, connection_id: ConnectionId) -> Flow {
        let Some(info) = self.registry.connection_info(connection_id) else {
            return Flow::Close(CloseCode::Normal);
        };
        self.violation(connection_id, info, ProtocolError::Malformed("binary frames are not supported".into()))
    }

    /// Record inbound traffic that carries no envelope (pong, ping).
    pub fn touch(&self, connection_id: ConnectionId) {
        self.registry.touch(connection_id);
    }

    /// Remove a connection whose transport went away.
    ///
    /// The participant stays on the call record so the client can
    /// reconnect. Returns `None` if the connection was already removed.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> Option<Departure> {
        let departure = self.registry.leave(connection_id)?;
        self.bridge.publish(departure.room_id, &departure.announcement, false);

        if !self.registry.is_connected(departure.identity) {
            self.update_presence(departure.identity, PresenceStatus::Offline);
        }

        tracing::info!(
            room_id = %departure.room_id,
            identity = %departure.identity,
            %connection_id,
            member_count = departure.member_count,
            "Connection removed"
        );
        Some(departure)
    }

    /// End a call and close its local connections with 4009.
    ///
    /// Members get a `terminal_state` error first. Returns `false` if the
    /// call had already ended.
    ///
    /// # Errors
    ///
    /// - `HubError::RoomNotFound` if there is no record for the call
    pub async fn end_call(&self, room_id: Uuid) -> Result<bool, HubError> {
        let _guard = self.call_lock.lock().await;
        let Some(mut record) = self.load_call(room_id).await else {
            return Err(HubError::RoomNotFound { room_id });
        };

        let ended = record.end(self.env.wall_clock());
        if ended {
            self.save_call(&record).await;
        }

        let notice = Arc::new(Envelope::error(room_id, ErrorPayload::terminal_state(room_id), self.env.wall_clock()));
        self.registry.broadcast_local(room_id, &notice, false);
        let closed = self.registry.close_room(room_id, CloseCode::TerminalState);

        tracing::info!(%room_id, ended, closed, "Call ended");
        Ok(ended)
    }

    fn decode(&self, info: ConnectionInfo, text: &str) -> Result<Envelope, ProtocolError> {
        let frame = ClientFrame::parse(text)?;
        frame.check_room(info.kind)?;
        frame.into_envelope(info.room_id, info.identity, self.env.wall_clock(), || self.env.random_uuid())
    }

    fn relay(&self, envelope: Envelope, exclude_sender: bool) {
        let room_id = envelope.room_id;
        let envelope = Arc::new(envelope);

        let report = self.registry.broadcast_local(room_id, &envelope, exclude_sender);
        self.bridge.publish(room_id, &envelope, exclude_sender);

        tracing::trace!(
            %room_id,
            kind = %envelope.kind(),
            delivered = report.delivered,
            dropped = report.dropped,
            "Envelope relayed"
        );
    }

    fn violation(&self, connection_id: ConnectionId, info: ConnectionInfo, error: ProtocolError) -> Flow {
        let count = self.registry.record_violation(connection_id);
        tracing::warn!(%connection_id, identity = %info.identity, %error, count, "Protocol violation");

        let reply = Envelope::error(info.room_id, HubError::from(error).to_payload(), self.env.wall_clock());
        self.registry.send_to(connection_id, Arc::new(reply));

        if count > self.config.max_violations {
            tracing::warn!(%connection_id, identity = %info.identity, "Too many protocol violations, closing");
            self.registry.close(connection_id, CloseCode::ProtocolViolation);
            return Flow::Close(CloseCode::ProtocolViolation);
        }
        Flow::Continue
    }

    async fn leave_call(&self, info: ConnectionInfo) {
        if info.kind != RoomKind::Call {
            return;
        }

        let _guard = self.call_lock.lock().await;
        let Some(mut record) = self.load_call(info.room_id).await else {
            return;
        };
        if record.remove_participant(info.identity, self.env.wall_clock()) {
            self.save_call(&record).await;
            tracing::info!(room_id = %info.room_id, identity = %info.identity, status = ?record.status, "Participant left call");
        }
    }

    async fn load_call(&self, room_id: Uuid) -> Option<CallState> {
        match self.states.get(room_id).await {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(%room_id, %error, "Unreadable call record, treating as absent");
                None
            },
        }
    }

    async fn save_call(&self, record: &CallState) {
        if let Err(error) = self.states.save(record).await {
            tracing::error!(room_id = %record.room_id, %error, "Failed to save call record");
        }
    }

    /// Queue a best-effort presence write. Skipped while Degraded.
    fn update_presence(&self, identity: Uuid, status: PresenceStatus) {
        if !self.availability.is_healthy() {
            tracing::trace!(%identity, ?status, "Degraded, skipping presence update");
            return;
        }
        if let Err(error) = self.presence_tx.try_send((identity, status)) {
            tracing::debug!(%identity, ?status, %error, "Presence queue unavailable, dropping update");
        }
    }

    /// Apply queued presence updates in order until cancelled.
    ///
    /// Only the first call does anything; later calls return immediately.
    pub async fn run_presence_writer(&self, cancel: CancellationToken) {
        let Some(mut rx) = self.presence_rx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            tracing::warn!("Presence writer already running");
            return;
        };

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => break,
                next = rx.recv() => next,
            };
            let Some((identity, status)) = next else { break };
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.write_presence(identity, status) => {},
            }
        }
        tracing::debug!("Presence writer stopped");
    }

    async fn write_presence(&self, identity: Uuid, status: PresenceStatus) {
        if !self.availability.is_healthy() {
            return;
        }

        let timeout = self.config.presence_timeout;
        let result = tokio::time::timeout(timeout, self.presence.set_status(identity, status))
            .await
            .unwrap_or(Err(StoreError::Timeout(timeout)));

        if let Err(error) = result {
            tracing::debug!(%identity, %error, "Presence update failed");
            self.reporter.report_failure(PRESENCE_COMPONENT, &error);
        }
    }
}
