//! Hub and runtime configuration.

use std::{path::PathBuf, time::Duration};

use crate::{
    availability::AvailabilityConfig,
    bridge::{DEFAULT_PUBLISH_QUEUE_CAPACITY, DEFAULT_RESUBSCRIBE_BACKOFF},
    engine::EngineConfig,
    registry::RegistryLimits,
};

/// Entries the resilience cache holds before evicting.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Interval between cache expiry sweeps.
pub const DEFAULT_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between heartbeat and reservation checks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// How long a recovered call room waits for its first reconnect.
pub const DEFAULT_RECOVERY_WINDOW: Duration = Duration::from_secs(120);

/// Time background tasks get to stop during shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Longest a single WebSocket frame write may take before the socket is
/// dropped.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Hub configuration
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Connection and room limits, queue capacity, heartbeats
    pub limits: RegistryLimits,
    /// Protocol violation handling
    pub engine: EngineConfig,
    /// Probe cadence and hysteresis
    pub availability: AvailabilityConfig,
    /// Resilience cache size
    pub cache_capacity: usize,
    /// Resilience cache sweep cadence
    pub cache_sweep_interval: Duration,
    /// Heartbeat and reservation cadence
    pub tick_interval: Duration,
    /// Reservation length for recovered call rooms
    pub recovery_window: Duration,
    /// Cross-instance publish queue size
    pub publish_queue_capacity: usize,
    /// Delay before a room listener resubscribes after a failure
    pub resubscribe_backoff: Duration,
    /// Time allowed for background tasks to stop
    pub shutdown_grace: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            limits: RegistryLimits::default(),
            engine: EngineConfig::default(),
            availability: AvailabilityConfig::default(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_sweep_interval: DEFAULT_CACHE_SWEEP_INTERVAL,
            tick_interval: DEFAULT_TICK_INTERVAL,
            recovery_window: DEFAULT_RECOVERY_WINDOW,
            publish_queue_capacity: DEFAULT_PUBLISH_QUEUE_CAPACITY,
            resubscribe_backoff: DEFAULT_RESUBSCRIBE_BACKOFF,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// WebSocket listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Bound on each frame write; a slower peer is disconnected
    pub write_timeout: Duration,
    /// Browser origins allowed to upgrade. Empty allows any origin.
    ///
    /// Requests without an `Origin` header are not browser requests and are
    /// always let through to authentication.
    pub allowed_origins: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { write_timeout: DEFAULT_WRITE_TIMEOUT, allowed_origins: Vec::new() }
    }
}

/// Coordination store backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StoreBackend {
    /// In-process store; single instance only
    #[default]
    Memory,
    /// Redb database file
    Redb(PathBuf),
    /// Redis server shared by every instance, e.g. `redis://10.0.0.5:6379`
    Redis(String),
}

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:8080")
    pub bind_address: String,
    /// HS256 secret for bearer tokens
    pub jwt_secret: String,
    /// Coordination store backend
    pub store: StoreBackend,
    /// WebSocket listener settings
    pub transport: TransportConfig,
    /// Hub configuration
    pub hub: HubConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            jwt_secret: String::new(),
            store: StoreBackend::Memory,
            transport: TransportConfig::default(),
            hub: HubConfig::default(),
        }
    }
}
