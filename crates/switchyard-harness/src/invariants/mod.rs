//! Invariant checking for hub membership state.
//!
//! Invariants are properties of a [`RegistrySnapshot`] that must hold after
//! every join, leave, tick and shutdown, whatever the interleaving. Tests
//! take a snapshot after each step and run the registry against it.
//!
//! # Usage
//!
//! ```ignore
//! let invariants = InvariantRegistry::standard();
//! invariants.assert_all(&hub.registry().snapshot(), "after join");
//! ```

mod checks;

pub use checks::{MemberIndexConsistent, NoIdleRooms, SubscriptionPerRoom};
use switchyard_server::RegistrySnapshot;

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// Invariant violation with context.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Name of the violated invariant.
    pub invariant: &'static str,
    /// Description of what went wrong.
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// A property of the membership map.
pub trait Invariant: Send + Sync {
    /// Invariant name for error reporting.
    fn name(&self) -> &'static str;

    /// Check the invariant against a snapshot.
    fn check(&self, state: &RegistrySnapshot) -> InvariantResult;
}

/// Collection of invariants run together.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Registry with every membership invariant:
    ///
    /// - [`MemberIndexConsistent`]: rooms and connections agree
    /// - [`SubscriptionPerRoom`]: every local room holds its subscription
    /// - [`NoIdleRooms`]: rooms without members exist only while reserved
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(MemberIndexConsistent);
        registry.add(SubscriptionPerRoom);
        registry.add(NoIdleRooms);
        registry
    }

    /// Add an invariant.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Check all invariants, returning every violation found.
    pub fn check_all(&self, state: &RegistrySnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.invariants.iter().filter_map(|inv| inv.check(state).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Check all invariants, panicking with every violation found.
    #[allow(clippy::panic, reason = "Test assertion helper")]
    pub fn assert_all(&self, state: &RegistrySnapshot, context: &str) {
        if let Err(violations) = self.check_all(state) {
            let messages: Vec<_> = violations.iter().map(ToString::to_string).collect();
            panic!("Invariant violation {context}:\n  {}", messages.join("\n  "));
        }
    }
}
