//! Production [`Environment`]: real clocks and OS randomness.
//!
//! - `std::time::Instant` for deadlines and heartbeats
//! - `chrono::Utc::now` for envelope and record timestamps
//! - getrandom for connection ids, instance ids and correlation ids
//! - tokio sleep for background loops
//!
//! Behavior is non-deterministic; tests that need reproducible time use the
//! harness environment instead.

use std::time::Duration;

use chrono::{DateTime, Utc};
use switchyard_core::Environment;

/// Production environment using system time and the OS RNG.
///
/// # Panics
///
/// Panics if the OS RNG fails. Connection and correlation ids must not be
/// predictable, so the hub does not run without it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    #[allow(clippy::disallowed_methods)]
    fn wall_clock(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_advances() {
        let env = SystemEnv::new();

        let t1 = env.now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = env.now();

        assert!(t2 > t1);
    }

    #[test]
    fn random_ids_differ() {
        let env = SystemEnv::new();

        assert_ne!(env.random_u64(), env.random_u64());
        let id = env.random_uuid();
        assert_eq!(id.get_version_num(), 4);
    }

    #[test]
    fn wall_clock_is_after_epoch() {
        assert!(SystemEnv::new().wall_clock() > DateTime::<Utc>::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn sleep_waits() {
        let env = SystemEnv::new();

        let start = env.now();
        env.sleep(Duration::from_millis(50)).await;

        assert!(env.now() - start >= Duration::from_millis(50));
    }
}
