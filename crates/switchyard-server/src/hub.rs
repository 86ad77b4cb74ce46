//! Hub context object.
//!
//! Owns one instance of every component and the background loops that drive
//! them. There are no globals: several hubs over clones of one
//! [`MemoryStore`](crate::store::MemoryStore) in a single process behave like
//! separate instances sharing a coordination store.
//!
//! # Lifecycle
//!
//! ```text
//! build ─> recover ─> start ─> (serve) ─> shutdown
//! ```
//!
//! `start` spawns the probe loop, cache sweep, heartbeat/reservation tick and
//! the bridge publisher. `shutdown` stops intake, flushes the publisher,
//! closes every connection with 1001 and waits up to `shutdown_grace` for the
//! loops to finish.

#![allow(clippy::disallowed_types, reason = "Task handle list is never held across an await")]

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use switchyard_core::{Environment, HubError, ResilientCache};
use switchyard_proto::{CloseCode, RoomKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    availability::{AvailabilityController, FailureReporter, ResyncTarget},
    bridge::{BridgeStats, FanoutBridge, RoomSubscriber},
    collaborators::{
        IdentityVerifier, MembershipService, OpenMembership, PresenceStore, StaticVerifier, StorePresence,
    },
    config::HubConfig,
    engine::ProtocolEngine,
    metrics::{AtomicMetrics, HubMetrics, MetricsSnapshot},
    registry::ConnectionRegistry,
    state_store::StateStore,
    store::{CoordinationStore, StoreError},
};

/// Body of `GET /healthz`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// `healthy` or `degraded`
    pub status: String,
    /// This instance
    pub instance_id: Uuid,
    /// Whether new connections are accepted
    pub accepting: bool,
    /// Last availability transition
    pub last_transition: Option<DateTime<Utc>>,
    /// Gauges and counters
    pub metrics: MetricsSnapshot,
    /// Bridge counters
    pub bridge: BridgeStats,
    /// Resync passes run so far
    pub resyncs: u64,
}

/// Builder for [`Hub`].
pub struct HubBuilder<E: Environment> {
    env: E,
    store: Arc<dyn CoordinationStore>,
    config: HubConfig,
    verifier: Arc<dyn IdentityVerifier>,
    membership: Arc<dyn MembershipService>,
    presence: Option<Arc<dyn PresenceStore>>,
    metrics: Arc<AtomicMetrics>,
    instance_id: Option<Uuid>,
}

impl<E: Environment> HubBuilder<E> {
    /// Replace the default configuration.
    #[must_use]
    pub fn config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    /// Bearer token verifier. Defaults to one that accepts nothing.
    #[must_use]
    pub fn verifier(mut self, verifier: Arc<dyn IdentityVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Membership authority. Defaults to [`OpenMembership`].
    #[must_use]
    pub fn membership(mut self, membership: Arc<dyn MembershipService>) -> Self {
        self.membership = membership;
        self
    }

    /// Presence backend. Defaults to [`StorePresence`] over the hub's store.
    #[must_use]
    pub fn presence(mut self, presence: Arc<dyn PresenceStore>) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Fixed instance id. Defaults to a random one.
    #[must_use]
    pub fn instance_id(mut self, instance_id: Uuid) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    /// Wire the components together. Nothing runs until [`Hub::start`].
    pub fn build(self) -> Arc<Hub<E>> {
        let Self { env, store, config, verifier, membership, presence, metrics, instance_id } = self;
        let instance_id = instance_id.unwrap_or_else(|| env.random_uuid());
        let dyn_metrics: Arc<dyn HubMetrics> = metrics.clone();

        let controller = Arc::new(AvailabilityController::new(
            env.clone(),
            Arc::clone(&store),
            config.availability,
            Arc::clone(&dyn_metrics),
        ));
        let reporter: Arc<dyn FailureReporter> = controller.clone();
        let availability = Arc::clone(controller.state());

        let cache = Arc::new(ResilientCache::new(env.clone(), config.cache_capacity));
        let states = Arc::new(StateStore::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&availability),
            Arc::clone(&reporter),
            Arc::clone(&dyn_metrics),
        ));
        let target: Arc<dyn ResyncTarget> = states.clone();
        controller.register(&target);

        let root = CancellationToken::new();
        let bridge = FanoutBridge::new(
            env.clone(),
            instance_id,
            Arc::clone(&store),
            Arc::clone(&availability),
            Arc::clone(&reporter),
            config.publish_queue_capacity,
            config.resubscribe_backoff,
            root.child_token(),
        );
        let subscriber: Arc<dyn RoomSubscriber> = Arc::new(bridge.clone());
        let registry = ConnectionRegistry::new(env.clone(), subscriber, Arc::clone(&dyn_metrics), config.limits);

        let presence = presence.unwrap_or_else(|| Arc::new(StorePresence::new(Arc::clone(&store))));
        let engine = ProtocolEngine::new(
            env.clone(),
            config.engine,
            registry.clone(),
            bridge.clone(),
            Arc::clone(&states),
            membership,
            presence,
            availability,
            reporter,
        );

        tracing::info!(%instance_id, "Hub built");
        Arc::new(Hub {
            env,
            config,
            instance_id,
            controller,
            cache,
            states,
            bridge,
            registry,
            engine,
            verifier,
            metrics,
            root,
            publisher_stop: CancellationToken::new(),
            accepting: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// One hub instance.
pub struct Hub<E: Environment> {
    env: E,
    config: HubConfig,
    instance_id: Uuid,
    controller: Arc<AvailabilityController<E>>,
    cache: Arc<ResilientCache<E>>,
    states: Arc<StateStore<E>>,
    bridge: FanoutBridge<E>,
    registry: ConnectionRegistry<E>,
    engine: ProtocolEngine<E>,
    verifier: Arc<dyn IdentityVerifier>,
    metrics: Arc<AtomicMetrics>,
    root: CancellationToken,
    publisher_stop: CancellationToken,
    accepting: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<E: Environment> Hub<E> {
    /// Start building a hub over `store`.
    pub fn builder(env: E, store: Arc<dyn CoordinationStore>) -> HubBuilder<E> {
        HubBuilder {
            env,
            store,
            config: HubConfig::default(),
            verifier: Arc::new(StaticVerifier::new()),
            membership: Arc::new(OpenMembership),
            presence: None,
            metrics: Arc::new(AtomicMetrics::new()),
            instance_id: None,
        }
    }

    /// Re-create rooms for calls that were live before a restart.
    ///
    /// Each non-terminal record gets a Call room with its remote
    /// subscription, reserved for `recovery_window`. Returns the number of
    /// rooms reserved.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let records = self.states.list_active().await?;

        let mut reserved = 0;
        for record in &records {
            if self.registry.reserve(record.room_id, RoomKind::Call, self.config.recovery_window) {
                reserved += 1;
            } else {
                tracing::warn!(room_id = %record.room_id, "Recovered call collides with a chat room");
            }
        }

        tracing::info!(reserved, window = ?self.config.recovery_window, "Call rooms recovered");
        Ok(reserved)
    }

    /// Spawn the background loops. Calling twice has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            return;
        }

        tasks.push(tokio::spawn(Arc::clone(&self.controller).run(self.root.child_token())));
        tasks.push(tokio::spawn(self.bridge.clone().run_publisher(self.publisher_stop.clone())));
        tasks.push(tokio::spawn(Arc::clone(self).sweep_loop(self.root.child_token())));
        tasks.push(tokio::spawn(Arc::clone(self).tick_loop(self.root.child_token())));
        tasks.push(tokio::spawn(Arc::clone(self).presence_loop(self.root.child_token())));

        tracing::info!(instance_id = %self.instance_id, "Hub started");
    }

    async fn sweep_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.env.sleep(self.config.cache_sweep_interval) => {},
            }
            let removed = self.cache.sweep_expired();
            if removed > 0 {
                tracing::debug!(removed, "Cache sweep");
            }
        }
    }

    async fn tick_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.env.sleep(self.config.tick_interval) => {},
            }
            self.tick();
        }
    }

    async fn presence_loop(self: Arc<Self>, cancel: CancellationToken) {
        self.engine.run_presence_writer(cancel).await;
    }

    /// Run one heartbeat and reservation pass. The tick loop calls this.
    pub fn tick(&self) {
        let now = self.env.now();
        let timed_out = self.registry.tick(now);
        if !timed_out.is_empty() {
            tracing::info!(count = timed_out.len(), "Connections timed out");
        }
        self.registry.reap_reservations(now);
    }

    /// Stop intake, flush outbound traffic, close connections with 1001 and
    /// stop the background loops.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!(instance_id = %self.instance_id, "Hub shutting down");

        self.publisher_stop.cancel();
        let closed = self.registry.close_all(CloseCode::GoingAway);
        self.root.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        let grace = self.config.shutdown_grace;
        let joined = tokio::time::timeout(grace, futures_util::future::join_all(tasks)).await;
        if joined.is_err() {
            tracing::warn!(?grace, "Background tasks did not stop within the grace period");
        }

        tracing::info!(closed, "Hub stopped");
    }

    /// End a call administratively.
    pub async fn end_call(&self, room_id: Uuid) -> Result<bool, HubError> {
        self.engine.end_call(room_id).await
    }

    /// Snapshot for `/healthz`.
    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: self.controller.mode().to_string(),
            instance_id: self.instance_id,
            accepting: self.is_accepting(),
            last_transition: self.controller.state().last_transition(),
            metrics: self.metrics.snapshot(),
            bridge: self.bridge.stats(),
            resyncs: self.controller.resync_count(),
        }
    }

    /// Whether new connections are accepted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// This instance's id.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Configuration in use.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Environment in use.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Protocol engine.
    pub fn engine(&self) -> &ProtocolEngine<E> {
        &self.engine
    }

    /// Connection registry.
    pub fn registry(&self) -> &ConnectionRegistry<E> {
        &self.registry
    }

    /// Fan-out bridge.
    pub fn bridge(&self) -> &FanoutBridge<E> {
        &self.bridge
    }

    /// Availability controller.
    pub fn controller(&self) -> &Arc<AvailabilityController<E>> {
        &self.controller
    }

    /// Call record repository.
    pub fn states(&self) -> &Arc<StateStore<E>> {
        &self.states
    }

    /// Resilience cache.
    pub fn cache(&self) -> &Arc<ResilientCache<E>> {
        &self.cache
    }

    /// Bearer token verifier.
    pub fn verifier(&self) -> &Arc<dyn IdentityVerifier> {
        &self.verifier
    }

    /// In-memory metrics.
    pub fn metrics(&self) -> &Arc<AtomicMetrics> {
        &self.metrics
    }
}
