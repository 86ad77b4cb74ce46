//! Heartbeat state machine.
//!
//! Tracks inbound activity for one connection and decides when to ping and
//! when to give up. Uses the action pattern: methods take time as input and
//! return actions for the driver to execute, so the state machine stays pure
//! and is tested with plain durations as instants.
//!
//! # State Machine
//!
//! ```text
//! ┌───────┐  inbound traffic   ┌───────┐
//! │ Alive │<───────────────────│ Alive │ (missed = 0)
//! └───────┘                    └───────┘
//!     │ max_missed intervals without traffic
//!     ↓
//! ┌────────┐
//! │ Closed │ ─> Close(HeartbeatTimeout)
//! └────────┘
//! ```

use std::{ops::Sub, time::Duration};

use switchyard_proto::CloseCode;

/// Interval between server pings.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Consecutive silent intervals tolerated before the connection is reaped.
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;

/// Actions returned by the liveness state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessAction {
    /// Send a WebSocket ping to the peer
    SendPing,

    /// Close the connection
    Close {
        /// Close code to send
        code: CloseCode,
    },
}

/// Liveness configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Time between pings
    pub heartbeat_interval: Duration,
    /// Silent intervals tolerated before closing
    pub max_missed: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_missed: DEFAULT_MAX_MISSED_HEARTBEATS,
        }
    }
}

impl LivenessConfig {
    /// Silence after which the connection is reaped.
    pub fn timeout(&self) -> Duration {
        self.heartbeat_interval * self.max_missed
    }
}

/// Per-connection heartbeat tracker.
///
/// Generic over the instant type so that the same logic runs on real and
/// virtual time.
#[derive(Debug, Clone)]
pub struct Liveness<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    config: LivenessConfig,
    /// Last inbound frame of any kind (data, pong, ping)
    last_inbound: I,
    /// Last ping sent
    last_ping: Option<I>,
    closed: bool,
}

impl<I> Liveness<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Start tracking a connection that was admitted at `now`.
    pub fn new(now: I, config: LivenessConfig) -> Self {
        Self { config, last_inbound: now, last_ping: None, closed: false }
    }

    /// Record inbound traffic. Any frame counts, not only pongs.
    pub fn on_inbound(&mut self, now: I) {
        if now > self.last_inbound {
            self.last_inbound = now;
        }
    }

    /// Number of whole heartbeat intervals without inbound traffic.
    pub fn missed(&self, now: I) -> u32 {
        if now <= self.last_inbound || self.config.heartbeat_interval.is_zero() {
            return 0;
        }

        let silent = now - self.last_inbound;
        let missed = silent.as_nanos() / self.config.heartbeat_interval.as_nanos();
        u32::try_from(missed).unwrap_or(u32::MAX)
    }

    /// Whether the connection has been closed by this state machine.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Advance time.
    ///
    /// Returns `Close` once `max_missed` intervals passed without inbound
    /// traffic, otherwise `SendPing` when a heartbeat interval elapsed since
    /// the last ping. A closed tracker returns nothing.
    pub fn tick(&mut self, now: I) -> Vec<LivenessAction> {
        if self.closed {
            return Vec::new();
        }

        if self.missed(now) >= self.config.max_missed {
            self.closed = true;
            return vec![LivenessAction::Close { code: CloseCode::HeartbeatTimeout }];
        }

        let should_ping = match self.last_ping {
            None => {
                now > self.last_inbound && now - self.last_inbound >= self.config.heartbeat_interval
            },
            Some(last) => now > last && now - last >= self.config.heartbeat_interval,
        };

        if should_ping {
            self.last_ping = Some(now);
            return vec![LivenessAction::SendPing];
        }

        Vec::new()
    }
}
