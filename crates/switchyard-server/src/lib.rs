//! Switchyard production server.
//!
//! Real-time hub for chat and call-signaling rooms over WebSocket, with
//! cross-instance fan-out through a shared coordination store.
//!
//! # Architecture
//!
//! The decision logic lives in [`switchyard_core`] as time-explicit state
//! machines (liveness, probe hysteresis, call lifecycle, cache). This crate
//! wires them to real I/O:
//!
//! - [`ConnectionRegistry`]: local rooms, members, per-connection queues
//! - [`FanoutBridge`]: one publish per message, one listener per room
//! - [`StateStore`]: call records, write-through to the coordination store
//! - [`AvailabilityController`]: healthy/degraded with resync on recovery
//! - [`ProtocolEngine`]: admission, validation, relay
//! - [`Hub`]: owns the above plus the background loops
//! - [`Server`]: axum listener in front of one hub
//!
//! [`SystemEnv`] supplies wall-clock time and OS randomness; tests swap in a
//! simulated environment.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod availability;
pub mod bridge;
pub mod collaborators;
pub mod config;
pub mod engine;
mod error;
pub mod hub;
pub mod metrics;
pub mod outbound;
pub mod registry;
pub mod state_store;
pub mod store;
mod system_env;
pub mod transport;

use std::{net::SocketAddr, sync::Arc};

pub use availability::{AvailabilityConfig, AvailabilityController, AvailabilityState, FailureReporter, ResyncTarget};
pub use bridge::{BridgeStats, FanoutBridge, LocalDelivery, PublishOutcome, RoomSubscriber, SubscriptionHandle};
pub use collaborators::{
    AuthError, Claims, IdentityVerifier, JwtVerifier, MembershipService, OpenMembership, PresenceStore,
    StaticMembership, StaticVerifier, StorePresence, issue_token,
};
pub use config::{HubConfig, ServerRuntimeConfig, StoreBackend, TransportConfig};
pub use engine::{AdmitRequest, EngineConfig, Flow, ProtocolEngine};
pub use error::ServerError;
pub use hub::{HealthReport, Hub, HubBuilder};
pub use metrics::{AtomicMetrics, HubMetrics, MetricsSnapshot, NoopMetrics};
pub use outbound::{Next, OutboundQueue, PushOutcome};
pub use registry::{ConnectionId, ConnectionRegistry, Departure, JoinMode, Membership, RegistryLimits, RegistrySnapshot};
pub use state_store::{SaveOutcome, StateStore};
pub use store::{ChaoticStore, CoordinationStore, MemoryStore, RedbStore, RedisStore, StoreError};
pub use system_env::SystemEnv;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Production Switchyard server.
///
/// One [`Hub`] over the configured store, served by axum.
pub struct Server {
    hub: Arc<Hub<SystemEnv>>,
    listener: TcpListener,
    transport: TransportConfig,
}

impl Server {
    /// Open the store, build and start the hub, and bind the listener.
    ///
    /// Call records left by a previous run are recovered before the listener
    /// accepts anything.
    pub async fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        if config.jwt_secret.is_empty() {
            return Err(ServerError::Config("jwt secret must not be empty".to_string()));
        }

        let store: Arc<dyn CoordinationStore> = match &config.store {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Redb(path) => Arc::new(RedbStore::open(path)?),
            StoreBackend::Redis(url) => Arc::new(RedisStore::connect(url).await?),
        };

        let hub = Hub::builder(SystemEnv::new(), store)
            .config(config.hub)
            .verifier(Arc::new(JwtVerifier::new(config.jwt_secret.as_bytes())))
            .build();

        match hub.recover().await {
            Ok(count) if count > 0 => tracing::info!(count, "Resumed call rooms from store"),
            Ok(_) => {},
            Err(e) => tracing::warn!("Call recovery failed, starting empty: {}", e),
        }

        let listener = TcpListener::bind(&config.bind_address)
            .await
            .map_err(|e| ServerError::Transport(format!("bind {}: {e}", config.bind_address)))?;

        hub.start();

        Ok(Self { hub, listener, transport: config.transport })
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// The hub behind this server.
    pub fn hub(&self) -> &Arc<Hub<SystemEnv>> {
        &self.hub
    }

    /// Serve until `shutdown` is cancelled, then drain the hub.
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        tracing::info!("Server starting on {}", self.local_addr()?);

        let hub = Arc::clone(&self.hub);
        let app = transport::router(Arc::clone(&self.hub), self.transport);

        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                hub.shutdown().await;
            })
            .await?;

        Ok(())
    }

    /// Serve until Ctrl-C.
    pub async fn run(self) -> Result<(), ServerError> {
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                return;
            }
            tracing::info!("Ctrl-C received");
            trigger.cancel();
        });

        self.run_until(shutdown).await
    }
}
