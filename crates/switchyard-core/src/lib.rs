//! Switchyard core logic.
//!
//! Pure state machines and data structures shared by the server runtime and
//! the simulation harness. Nothing in this crate performs I/O or reads the
//! clock directly: time and randomness come from an [`env::Environment`], and
//! state machines take the current instant as a parameter and return what the
//! caller should do.
//!
//! # Components
//!
//! - [`env::Environment`]: time and randomness abstraction
//! - [`liveness::Liveness`]: per-connection heartbeat state machine
//! - [`probe::ProbeTracker`]: Healthy/Degraded hysteresis over probe outcomes
//! - [`cache::ResilientCache`]: bounded LRU map with per-entry TTL
//! - [`call_state::CallState`]: call lifecycle record
//! - [`error::HubError`]: client-facing error taxonomy

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod cache;
pub mod call_state;
pub mod env;
pub mod error;
pub mod liveness;
pub mod probe;

pub use cache::{CacheMap, ResilientCache};
pub use call_state::{CallState, CallStatus};
pub use env::Environment;
pub use error::HubError;
pub use liveness::{Liveness, LivenessAction, LivenessConfig};
pub use probe::{AvailabilityMode, ProbeConfig, ProbeOutcome, ProbeTracker, Transition};
