//! Property-based tests for `ConnectionRegistry`.
//!
//! Random sequences of joins, leaves, broadcasts, reservations and clock
//! advances must keep the membership map consistent, keep exactly one
//! subscription per room, and deliver each broadcast once per member.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use proptest::prelude::*;
use switchyard_core::Environment;
use switchyard_harness::{InvariantRegistry, SimEnv};
use switchyard_proto::{Envelope, Message, Payload, RoomKind};
use switchyard_server::{
    ConnectionId, ConnectionRegistry, JoinMode, LocalDelivery, NoopMetrics, RegistryLimits,
    RoomSubscriber, SubscriptionHandle,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const ROOMS: u128 = 4;

#[derive(Default)]
struct CountingSubscriber {
    live: AtomicUsize,
}

impl RoomSubscriber for CountingSubscriber {
    fn ensure_subscribed(&self, room_id: Uuid, _delivery: Arc<dyn LocalDelivery>) -> SubscriptionHandle {
        self.live.fetch_add(1, Ordering::SeqCst);
        SubscriptionHandle::new(room_id, CancellationToken::new())
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        drop(handle);
    }
}

#[derive(Debug, Clone)]
enum Op {
    Join { room: u128, identity: u128, resume: bool },
    Leave { pick: usize },
    Broadcast { room: u128 },
    Reserve { room: u128 },
    Advance { secs: u64 },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..ROOMS, 0u128..6, any::<bool>())
            .prop_map(|(room, identity, resume)| Op::Join { room, identity, resume }),
        3 => any::<usize>().prop_map(|pick| Op::Leave { pick }),
        2 => (0..ROOMS).prop_map(|room| Op::Broadcast { room }),
        1 => (0..ROOMS).prop_map(|room| Op::Reserve { room }),
        1 => (1u64..90).prop_map(|secs| Op::Advance { secs }),
    ]
}

fn room_id(room: u128) -> Uuid {
    Uuid::from_u128(0x1000 + room)
}

/// Last room is a call room, the rest are chat rooms.
fn kind_of(room: u128) -> RoomKind {
    if room == ROOMS - 1 { RoomKind::Call } else { RoomKind::Chat }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: every operation sequence preserves the membership
    /// invariants and the subscription count matches the room count
    #[test]
    fn prop_registry_stays_consistent(
        seed in any::<u64>(),
        ops in prop::collection::vec(op(), 1..40)
    ) {
        let env = SimEnv::with_seed(seed);
        let subscriber = Arc::new(CountingSubscriber::default());
        let registry = ConnectionRegistry::new(
            env.clone(),
            subscriber.clone(),
            Arc::new(NoopMetrics),
            RegistryLimits::default(),
        );
        let invariants = InvariantRegistry::standard();
        let mut live: Vec<ConnectionId> = Vec::new();

        for (step, op) in ops.into_iter().enumerate() {
            match op {
                Op::Join { room, identity, resume } => {
                    let identity = Uuid::from_u128(identity + 1);
                    let mode = if resume { JoinMode::Resume } else { JoinMode::Fresh };
                    let already = registry.has_identity(room_id(room), identity);
                    match registry.join(room_id(room), kind_of(room), identity, mode) {
                        Ok(membership) => {
                            prop_assert!(!(resume && already));
                            live.push(membership.connection_id);
                        },
                        Err(_) => prop_assert!(resume && already),
                    }
                },
                Op::Leave { pick } => {
                    if !live.is_empty() {
                        let connection_id = live.swap_remove(pick % live.len());
                        prop_assert!(registry.leave(connection_id).is_some());
                        prop_assert!(registry.leave(connection_id).is_none());
                    }
                },
                Op::Broadcast { room } => {
                    let envelope = Arc::new(Envelope::new(
                        room_id(room),
                        Uuid::from_u128(0xFFFF),
                        Payload::Message(Message::text("property")),
                        env.wall_clock(),
                    ));
                    let report = registry.broadcast_local(room_id(room), &envelope, false);
                    prop_assert_eq!(report.delivered, registry.member_count(room_id(room)));
                    prop_assert!(report.overflowed.is_empty());
                },
                Op::Reserve { room } => {
                    prop_assert!(registry.reserve(room_id(room), kind_of(room), Duration::from_secs(120)));
                },
                Op::Advance { secs } => {
                    env.advance(Duration::from_secs(secs));
                    registry.reap_reservations(env.now());
                },
            }

            let snapshot = registry.snapshot();
            if let Err(violations) = invariants.check_all(&snapshot) {
                let messages: Vec<String> = violations.iter().map(ToString::to_string).collect();
                prop_assert!(false, "step {}: {}", step, messages.join("; "));
            }
            prop_assert_eq!(subscriber.live.load(Ordering::SeqCst), registry.room_count());
            prop_assert_eq!(registry.connection_count(), live.len());
        }
    }

    /// Property: leaving every connection without reservations leaves no
    /// rooms and no subscriptions behind
    #[test]
    fn prop_full_teardown_releases_everything(
        seed in any::<u64>(),
        joins in prop::collection::vec((0..ROOMS, 0u128..6), 1..30)
    ) {
        let env = SimEnv::with_seed(seed);
        let subscriber = Arc::new(CountingSubscriber::default());
        let registry = ConnectionRegistry::new(
            env,
            subscriber.clone(),
            Arc::new(NoopMetrics),
            RegistryLimits::default(),
        );

        let mut connections = Vec::new();
        for (room, identity) in joins {
            let membership = registry
                .join(room_id(room), kind_of(room), Uuid::from_u128(identity + 1), JoinMode::Fresh)
                .unwrap();
            connections.push(membership.connection_id);
        }

        for connection_id in connections {
            registry.leave(connection_id);
        }

        prop_assert_eq!(registry.room_count(), 0);
        prop_assert_eq!(registry.connection_count(), 0);
        prop_assert_eq!(subscriber.live.load(Ordering::SeqCst), 0);
    }
}
