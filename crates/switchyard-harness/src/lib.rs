//! Deterministic test harness for Switchyard.
//!
//! # Simulated environment
//!
//! [`SimEnv`] replaces the system clock and OS entropy with a manual clock
//! and a seeded RNG. Heartbeats, reservations and cache TTLs only move when a
//! test calls [`SimEnv::advance`], and connection ids repeat across runs with
//! the same seed.
//!
//! # Invariant Testing
//!
//! The `invariants` module checks properties of a hub's membership map that
//! must hold after every operation. Use [`InvariantRegistry::standard()`] for
//! the registry invariants.
//!
//! # Clusters
//!
//! [`Cluster`] runs several hubs in one process over one shared store, which
//! is how cross-instance fan-out, outages and restarts are exercised without
//! a network.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cluster;
pub mod invariants;
pub mod sim_env;

pub use cluster::{Cluster, recv, recv_kind, wait_until};
pub use invariants::{
    Invariant, InvariantRegistry, InvariantResult, MemberIndexConsistent, NoIdleRooms,
    SubscriptionPerRoom, Violation,
};
pub use sim_env::{SimEnv, SimInstant};
