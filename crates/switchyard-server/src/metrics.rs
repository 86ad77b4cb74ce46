//! Metrics hooks.
//!
//! Components report through [`HubMetrics`] and never depend on a concrete
//! exporter. [`AtomicMetrics`] keeps the values in memory and backs the
//! `/healthz` endpoint.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

/// Sink for hub gauges and counters.
pub trait HubMetrics: Send + Sync + 'static {
    /// Degraded-mode gauge.
    fn set_degraded(&self, degraded: bool);

    /// A read was served from the resilience cache instead of the store.
    fn inc_fallback_hit(&self);

    /// Number of live local connections.
    fn set_active_connections(&self, count: usize);

    /// Number of local rooms.
    fn set_active_rooms(&self, count: usize);

    /// A WebSocket finished its upgrade.
    fn socket_opened(&self);

    /// A WebSocket task ended and released its socket.
    fn socket_closed(&self);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl HubMetrics for NoopMetrics {
    fn set_degraded(&self, _degraded: bool) {}

    fn inc_fallback_hit(&self) {}

    fn set_active_connections(&self, _count: usize) {}

    fn set_active_rooms(&self, _count: usize) {}

    fn socket_opened(&self) {}

    fn socket_closed(&self) {}
}

/// In-memory metrics.
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    degraded: AtomicBool,
    fallback_hits: AtomicU64,
    active_connections: AtomicU64,
    active_rooms: AtomicU64,
    open_sockets: AtomicU64,
}

/// Point-in-time copy of [`AtomicMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Degraded gauge
    pub degraded: bool,
    /// Cache fallback hits since start
    pub fallback_hits: u64,
    /// Live local connections
    pub active_connections: u64,
    /// Local rooms
    pub active_rooms: u64,
    /// Upgraded sockets whose task has not finished
    pub open_sockets: u64,
}

impl AtomicMetrics {
    /// All gauges at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            degraded: self.degraded.load(Ordering::Relaxed),
            fallback_hits: self.fallback_hits.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            active_rooms: self.active_rooms.load(Ordering::Relaxed),
            open_sockets: self.open_sockets.load(Ordering::Relaxed),
        }
    }
}

impl HubMetrics for AtomicMetrics {
    fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Relaxed);
    }

    fn inc_fallback_hit(&self) {
        self.fallback_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn set_active_connections(&self, count: usize) {
        self.active_connections.store(count as u64, Ordering::Relaxed);
    }

    fn set_active_rooms(&self, count: usize) {
        self.active_rooms.store(count as u64, Ordering::Relaxed);
    }

    fn socket_opened(&self) {
        self.open_sockets.fetch_add(1, Ordering::Relaxed);
    }

    fn socket_closed(&self) {
        self.open_sockets.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_metrics_snapshot() {
        let metrics = AtomicMetrics::new();
        metrics.set_degraded(true);
        metrics.inc_fallback_hit();
        metrics.inc_fallback_hit();
        metrics.set_active_connections(3);
        metrics.set_active_rooms(1);
        metrics.socket_opened();
        metrics.socket_opened();
        metrics.socket_closed();

        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                degraded: true,
                fallback_hits: 2,
                active_connections: 3,
                active_rooms: 1,
                open_sockets: 1,
            }
        );
    }
}
