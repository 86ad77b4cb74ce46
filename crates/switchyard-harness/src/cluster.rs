//! Several hubs over one shared store.
//!
//! Each hub is a separate instance: own registry, bridge, controller and
//! instance id. They meet only through the store, exactly as production
//! instances do through Redis. The store is wrapped in a [`ChaoticStore`] so
//! tests can cut it off for everyone at once.

use std::{sync::Arc, time::Duration};

use switchyard_core::HubError;
use switchyard_proto::{Envelope, Kind, RoomKind};
use switchyard_server::{
    AdmitRequest, ChaoticStore, Hub, HubConfig, Membership, MemoryStore, Next, OutboundQueue,
    StoreError,
};
use uuid::Uuid;

use crate::{InvariantRegistry, SimEnv};

/// Hubs sharing one store and one simulated clock.
pub struct Cluster {
    env: SimEnv,
    store: ChaoticStore<MemoryStore>,
    config: HubConfig,
    hubs: Vec<Arc<Hub<SimEnv>>>,
    invariants: InvariantRegistry,
}

impl Cluster {
    /// Start `instances` hubs with the default configuration.
    ///
    /// Must be called inside a tokio runtime; every hub's background loops
    /// are running on return.
    pub fn new(seed: u64, instances: usize) -> Self {
        Self::with_config(seed, instances, HubConfig::default())
    }

    /// Start `instances` hubs with `config`.
    pub fn with_config(seed: u64, instances: usize, config: HubConfig) -> Self {
        let mut cluster = Self {
            env: SimEnv::with_seed(seed),
            store: ChaoticStore::new(MemoryStore::new()),
            config,
            hubs: Vec::with_capacity(instances),
            invariants: InvariantRegistry::standard(),
        };
        for _ in 0..instances {
            let hub = cluster.build_hub();
            hub.start();
            cluster.hubs.push(hub);
        }
        cluster
    }

    fn build_hub(&self) -> Arc<Hub<SimEnv>> {
        Hub::builder(self.env.clone(), Arc::new(self.store.clone())).config(self.config.clone()).build()
    }

    /// Shared clock.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Shared store handle.
    pub fn store(&self) -> &ChaoticStore<MemoryStore> {
        &self.store
    }

    /// Hub `index`.
    pub fn hub(&self, index: usize) -> &Arc<Hub<SimEnv>> {
        &self.hubs[index]
    }

    /// Number of hubs.
    pub fn len(&self) -> usize {
        self.hubs.len()
    }

    /// Whether the cluster has no hubs.
    pub fn is_empty(&self) -> bool {
        self.hubs.is_empty()
    }

    /// Admit `identity` into `room_id` on hub `index`.
    pub async fn connect(
        &self,
        index: usize,
        room_id: Uuid,
        kind: RoomKind,
        identity: Uuid,
    ) -> Result<Membership, HubError> {
        let request = AdmitRequest { room_id, kind, identity, reconnect: false };
        self.hubs[index].engine().admit(request).await
    }

    /// Resume `identity`'s session in `room_id` on hub `index`.
    pub async fn reconnect(
        &self,
        index: usize,
        room_id: Uuid,
        kind: RoomKind,
        identity: Uuid,
    ) -> Result<Membership, HubError> {
        let request = AdmitRequest { room_id, kind, identity, reconnect: true };
        self.hubs[index].engine().admit(request).await
    }

    /// Cut the store off for every hub, or restore it.
    pub fn set_outage(&self, down: bool) {
        self.store.set_outage(down);
    }

    /// Replace hub `index` with a fresh instance over the same store, as if
    /// the process had crashed and restarted. Returns the number of call
    /// rooms recovered.
    pub async fn restart(&mut self, index: usize) -> Result<usize, StoreError> {
        self.hubs[index].shutdown().await;

        let hub = self.build_hub();
        let recovered = hub.recover().await?;
        hub.start();
        self.hubs[index] = hub;

        tracing::debug!(index, recovered, "Hub restarted");
        Ok(recovered)
    }

    /// Run every hub's heartbeat and reservation pass.
    pub fn tick(&self) {
        for hub in &self.hubs {
            hub.tick();
        }
    }

    /// Assert the membership invariants on every hub.
    pub fn assert_invariants(&self, context: &str) {
        for (index, hub) in self.hubs.iter().enumerate() {
            self.invariants.assert_all(&hub.registry().snapshot(), &format!("{context} (hub {index})"));
        }
    }

    /// Shut every hub down.
    pub async fn shutdown(&self) {
        for hub in &self.hubs {
            hub.shutdown().await;
        }
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout`
/// passes. Returns whether it held.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(timeout, poll).await.is_ok()
}

/// Next item from a connection's queue, if one arrives within `timeout`.
pub async fn recv(queue: &OutboundQueue, timeout: Duration) -> Option<Next> {
    tokio::time::timeout(timeout, queue.next()).await.ok()
}

/// Next envelope of `kind`, skipping everything else. `None` on timeout or
/// when the queue closes first.
pub async fn recv_kind(queue: &OutboundQueue, kind: Kind, timeout: Duration) -> Option<Arc<Envelope>> {
    let search = async {
        loop {
            match queue.next().await {
                Next::Envelope(envelope) if envelope.kind() == kind => return Some(envelope),
                Next::Envelope(_) | Next::Ping => {},
                Next::Close(_) => return None,
            }
        }
    };
    tokio::time::timeout(timeout, search).await.ok().flatten()
}
