//! Availability hysteresis.
//!
//! Turns a stream of probe outcomes into Healthy/Degraded transitions. A
//! single failed probe is noise; `failure_threshold` consecutive failures mean
//! the coordination store is gone. Recovery needs `success_threshold`
//! consecutive successes; a store that alternates between answering and
//! failing stays Degraded.
//!
//! ```text
//!            failures >= failure_threshold
//! ┌─────────┐ ──────────────────────────> ┌──────────┐
//! │ Healthy │                             │ Degraded │
//! └─────────┘ <────────────────────────── └──────────┘
//!            successes >= success_threshold
//! ```

use std::fmt;

/// Consecutive failures before entering Degraded.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Consecutive successes before leaving Degraded.
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;

/// Availability of the coordination store as seen by one hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AvailabilityMode {
    /// Store reachable; cross-instance features enabled
    Healthy,
    /// Store unreachable; local-only operation
    Degraded,
}

impl AvailabilityMode {
    /// Compact encoding for atomic storage.
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
        }
    }

    /// Decode from [`AvailabilityMode::as_u8`]. Unknown values read as
    /// Degraded.
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Healthy,
            _ => Self::Degraded,
        }
    }

    /// Whether cross-instance features are enabled.
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl fmt::Display for AvailabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

/// Result of one liveness probe or one dependency call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The store answered in time
    Success,
    /// The store failed or timed out
    Failure,
}

/// Mode change produced by [`ProbeTracker::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Mode before the change
    pub from: AvailabilityMode,
    /// Mode after the change
    pub to: AvailabilityMode,
}

impl Transition {
    /// Whether this is a Degraded→Healthy recovery.
    pub fn is_recovery(&self) -> bool {
        self.from == AvailabilityMode::Degraded && self.to == AvailabilityMode::Healthy
    }
}

/// Probe tracker configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Consecutive failures before Degraded
    pub failure_threshold: u32,
    /// Consecutive successes before Healthy
    pub success_threshold: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
        }
    }
}

/// Hysteresis state machine over probe outcomes.
///
/// Starts Healthy. Thresholds of zero are treated as one.
#[derive(Debug, Clone)]
pub struct ProbeTracker {
    config: ProbeConfig,
    mode: AvailabilityMode,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl ProbeTracker {
    /// Create a tracker in Healthy mode.
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            config,
            mode: AvailabilityMode::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }

    /// Current mode.
    pub fn mode(&self) -> AvailabilityMode {
        self.mode
    }

    /// Consecutive failures recorded so far.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Record one outcome. Returns the transition if the mode changed.
    pub fn record(&mut self, outcome: ProbeOutcome) -> Option<Transition> {
        match outcome {
            ProbeOutcome::Success => {
                self.consecutive_failures = 0;
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);

                if self.mode == AvailabilityMode::Degraded
                    && self.consecutive_successes >= self.config.success_threshold.max(1)
                {
                    return Some(self.transition(AvailabilityMode::Healthy));
                }
            },
            ProbeOutcome::Failure => {
                self.consecutive_successes = 0;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);

                if self.mode == AvailabilityMode::Healthy
                    && self.consecutive_failures >= self.config.failure_threshold.max(1)
                {
                    return Some(self.transition(AvailabilityMode::Degraded));
                }
            },
        }

        None
    }

    fn transition(&mut self, to: AvailabilityMode) -> Transition {
        let from = self.mode;
        self.mode = to;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        Transition { from, to }
    }
}

impl Default for ProbeTracker {
    fn default() -> Self {
        Self::new(ProbeConfig::default())
    }
}
