//! Multi-instance scenarios: fan-out, degraded mode, restart recovery,
//! cache eviction and recovery resync.

use std::time::Duration;

use futures_util::FutureExt;
use switchyard_core::{AvailabilityMode, CallState, CallStatus, HubError, call_state::CALL_STATE_TTL};
use switchyard_harness::{Cluster, SimEnv, recv_kind, wait_until};
use switchyard_proto::{Kind, Payload, RoomKind};
use switchyard_server::{CoordinationStore, HubConfig, Next};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(150);

const MESSAGE: &str = r#"{"type":"message","payload":{"content":"hello"}}"#;
const TYPING: &str = r#"{"type":"typing","payload":{"is_typing":true}}"#;

fn room() -> Uuid {
    Uuid::from_u128(0x7000)
}

fn alice() -> Uuid {
    Uuid::from_u128(0xA1)
}

fn bob() -> Uuid {
    Uuid::from_u128(0xB0)
}

fn carol() -> Uuid {
    Uuid::from_u128(0xC0)
}

async fn subscribed_everywhere(cluster: &Cluster, room_id: Uuid) -> bool {
    wait_until(WAIT, || (0..cluster.len()).all(|i| cluster.hub(i).registry().is_subscribed(room_id))).await
}

async fn probe_all(cluster: &Cluster, times: usize) {
    for _ in 0..times {
        for i in 0..cluster.len() {
            cluster.hub(i).controller().probe_once().await;
        }
    }
}

#[tokio::test]
async fn chat_message_reaches_local_and_remote_members() {
    let cluster = Cluster::new(1, 2);
    let a = cluster.connect(0, room(), RoomKind::Chat, alice()).await.unwrap();
    let b = cluster.connect(0, room(), RoomKind::Chat, bob()).await.unwrap();
    let c = cluster.connect(1, room(), RoomKind::Chat, carol()).await.unwrap();
    assert!(subscribed_everywhere(&cluster, room()).await);

    cluster.hub(0).engine().handle_text(a.connection_id, MESSAGE).await;

    for queue in [&b.queue, &c.queue] {
        let envelope = recv_kind(queue, Kind::Message, WAIT).await.unwrap();
        assert_eq!(envelope.sender_id, alice());
        assert_eq!(envelope.room_id, room());
        let Payload::Message(message) = &envelope.payload else { panic!("expected message payload") };
        assert_eq!(message.content, "hello");
    }

    // Sender sees its own message once; its instance ignores the echo from the store.
    assert!(recv_kind(&a.queue, Kind::Message, WAIT).await.is_some());
    assert!(recv_kind(&a.queue, Kind::Message, QUIET).await.is_none());
    assert!(recv_kind(&c.queue, Kind::Message, QUIET).await.is_none());

    cluster.assert_invariants("after cross-instance message");
    cluster.shutdown().await;
}

#[tokio::test]
async fn typing_skips_sender_on_every_instance() {
    let cluster = Cluster::new(2, 2);
    let a = cluster.connect(0, room(), RoomKind::Chat, alice()).await.unwrap();
    let b = cluster.connect(1, room(), RoomKind::Chat, bob()).await.unwrap();
    // Second session of bob on the first instance must not see his own typing either.
    let b2 = cluster.connect(0, room(), RoomKind::Chat, bob()).await.unwrap();
    assert!(subscribed_everywhere(&cluster, room()).await);

    cluster.hub(1).engine().handle_text(b.connection_id, TYPING).await;

    let envelope = recv_kind(&a.queue, Kind::Typing, WAIT).await.unwrap();
    assert_eq!(envelope.sender_id, bob());
    assert!(recv_kind(&b.queue, Kind::Typing, QUIET).await.is_none());
    assert!(recv_kind(&b2.queue, Kind::Typing, QUIET).await.is_none());

    cluster.shutdown().await;
}

#[tokio::test]
async fn joins_are_announced_across_instances() {
    let cluster = Cluster::new(3, 2);
    let a = cluster.connect(0, room(), RoomKind::Chat, alice()).await.unwrap();
    assert!(wait_until(WAIT, || cluster.hub(0).registry().is_subscribed(room())).await);

    let _b = cluster.connect(1, room(), RoomKind::Chat, bob()).await.unwrap();

    let joined = recv_kind(&a.queue, Kind::Joined, WAIT).await.unwrap();
    assert_eq!(joined.sender_id, alice());
    // The remote announcement carries the remote instance's member count.
    let remote = recv_kind(&a.queue, Kind::Joined, WAIT).await.unwrap();
    assert_eq!(remote.sender_id, bob());
    let Payload::Joined(count) = &remote.payload else { panic!("expected joined payload") };
    assert_eq!(count.member_count, 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn degraded_mode_keeps_local_delivery() {
    let cluster = Cluster::new(4, 2);
    let a = cluster.connect(0, room(), RoomKind::Chat, alice()).await.unwrap();
    let b = cluster.connect(0, room(), RoomKind::Chat, bob()).await.unwrap();
    let c = cluster.connect(1, room(), RoomKind::Chat, carol()).await.unwrap();
    assert!(subscribed_everywhere(&cluster, room()).await);

    cluster.set_outage(true);
    probe_all(&cluster, 3).await;
    assert_eq!(cluster.hub(0).controller().mode(), AvailabilityMode::Degraded);
    assert_eq!(cluster.hub(0).health().status, "degraded");

    let skipped_before = cluster.hub(0).bridge().stats().skipped;
    cluster.hub(0).engine().handle_text(a.connection_id, MESSAGE).await;

    let envelope = recv_kind(&b.queue, Kind::Message, WAIT).await.unwrap();
    assert_eq!(envelope.sender_id, alice());
    assert!(recv_kind(&c.queue, Kind::Message, QUIET).await.is_none());
    assert_eq!(cluster.hub(0).bridge().stats().skipped, skipped_before + 1);

    // New connections are still admitted while degraded.
    let late = cluster.connect(0, room(), RoomKind::Chat, Uuid::from_u128(0xD0)).await;
    assert!(late.is_ok());

    cluster.assert_invariants("while degraded");
    cluster.shutdown().await;
}

#[tokio::test]
async fn calls_created_while_degraded_reach_the_store_after_one_resync() {
    let cluster = Cluster::new(5, 2);
    cluster.set_outage(true);
    probe_all(&cluster, 3).await;
    assert_eq!(cluster.hub(0).controller().mode(), AvailabilityMode::Degraded);

    let _a = cluster.connect(0, room(), RoomKind::Call, alice()).await.unwrap();
    let _b = cluster.connect(0, room(), RoomKind::Call, bob()).await.unwrap();
    assert_eq!(cluster.hub(0).states().pending_count(), 1);

    cluster.set_outage(false);
    probe_all(&cluster, 1).await;
    assert_eq!(cluster.hub(0).controller().mode(), AvailabilityMode::Degraded);
    probe_all(&cluster, 1).await;
    assert_eq!(cluster.hub(0).controller().mode(), AvailabilityMode::Healthy);
    assert_eq!(cluster.hub(0).controller().resync_count(), 1);
    assert_eq!(cluster.hub(0).states().pending_count(), 0);

    // Further successes do not resync again.
    probe_all(&cluster, 2).await;
    assert_eq!(cluster.hub(0).controller().resync_count(), 1);

    let stored = cluster.store().inner().get(&CallState::key_for(room())).await.unwrap().unwrap();
    let record = CallState::from_json(&stored).unwrap();
    assert_eq!(record.status, CallStatus::Active);
    assert_eq!(record.participant_ids, vec![alice(), bob()]);

    cluster.shutdown().await;
}

#[tokio::test]
async fn publish_resumes_after_recovery() {
    let config = HubConfig { resubscribe_backoff: Duration::from_millis(20), ..HubConfig::default() };
    let cluster = Cluster::with_config(6, 2, config);
    let a = cluster.connect(0, room(), RoomKind::Chat, alice()).await.unwrap();
    let c = cluster.connect(1, room(), RoomKind::Chat, carol()).await.unwrap();
    assert!(subscribed_everywhere(&cluster, room()).await);

    cluster.set_outage(true);
    probe_all(&cluster, 3).await;
    assert!(
        wait_until(WAIT, || (0..cluster.len()).all(|i| cluster.hub(i).bridge().stats().live_subscriptions == 0))
            .await
    );
    cluster.hub(0).engine().handle_text(a.connection_id, MESSAGE).await;
    assert!(recv_kind(&c.queue, Kind::Message, QUIET).await.is_none());

    cluster.set_outage(false);
    probe_all(&cluster, 2).await;
    assert_eq!(cluster.hub(1).controller().mode(), AvailabilityMode::Healthy);
    assert!(subscribed_everywhere(&cluster, room()).await);

    cluster.hub(0).engine().handle_text(a.connection_id, r#"{"type":"message","payload":{"content":"back"}}"#).await;
    let envelope = recv_kind(&c.queue, Kind::Message, WAIT).await.unwrap();
    let Payload::Message(message) = &envelope.payload else { panic!("expected message payload") };
    assert_eq!(message.content, "back");

    cluster.assert_invariants("after recovery");
    cluster.shutdown().await;
}

#[tokio::test]
async fn restart_recovers_calls_for_reconnecting_participants() {
    let mut cluster = Cluster::new(7, 1);
    let _a = cluster.connect(0, room(), RoomKind::Call, alice()).await.unwrap();
    let _b = cluster.connect(0, room(), RoomKind::Call, bob()).await.unwrap();

    let recovered = cluster.restart(0).await.unwrap();
    assert_eq!(recovered, 1);

    let snapshot = cluster.hub(0).registry().snapshot();
    assert_eq!(snapshot.rooms.len(), 1);
    assert!(snapshot.rooms[0].reserved);
    assert!(snapshot.rooms[0].members.is_empty());
    cluster.assert_invariants("after restart");

    let stranger = cluster.reconnect(0, room(), RoomKind::Call, carol()).await;
    assert!(matches!(stranger, Err(HubError::Authorization { .. })));

    let a = cluster.reconnect(0, room(), RoomKind::Call, alice()).await.unwrap();
    match a.queue.next().await {
        Next::Envelope(envelope) => {
            assert_eq!(envelope.kind(), Kind::Reconnected);
            assert_eq!(envelope.sender_id, alice());
        },
        other => panic!("expected reconnected envelope, got {other:?}"),
    }

    let duplicate = cluster.reconnect(0, room(), RoomKind::Call, alice()).await;
    assert!(matches!(duplicate, Err(HubError::DuplicateSession { .. })));

    let snapshot = cluster.hub(0).registry().snapshot();
    assert!(!snapshot.rooms[0].reserved);
    cluster.assert_invariants("after reconnect");
    cluster.shutdown().await;
}

#[tokio::test]
async fn unclaimed_reservations_expire() {
    let mut cluster = Cluster::new(8, 1);
    let _a = cluster.connect(0, room(), RoomKind::Call, alice()).await.unwrap();
    cluster.restart(0).await.unwrap();
    assert_eq!(cluster.hub(0).registry().room_count(), 1);

    cluster.env().advance(Duration::from_secs(60));
    cluster.tick();
    assert_eq!(cluster.hub(0).registry().room_count(), 1);

    cluster.env().advance(Duration::from_secs(61));
    cluster.tick();
    assert_eq!(cluster.hub(0).registry().room_count(), 0);
    cluster.assert_invariants("after reservation expiry");

    // The record survives; a late reconnect still finds the call.
    let late = cluster.reconnect(0, room(), RoomKind::Call, alice()).await;
    assert!(late.is_ok());
    cluster.shutdown().await;
}

#[tokio::test]
async fn cache_evicts_least_recently_used() {
    let config = HubConfig { cache_capacity: 2, ..HubConfig::default() };
    let cluster = Cluster::with_config(9, 1, config);
    let cache = cluster.hub(0).cache();

    cache.put("k1", b"one".to_vec(), CALL_STATE_TTL);
    cache.put("k2", b"two".to_vec(), CALL_STATE_TTL);
    assert!(cache.get("k1").is_some());

    let evicted = cache.put("k3", b"three".to_vec(), CALL_STATE_TTL);
    assert_eq!(evicted, vec!["k2".to_string()]);
    assert!(cache.get("k2").is_none());
    assert!(cache.get("k1").is_some());
    assert!(cache.get("k3").is_some());
    assert_eq!(cache.len(), 2);

    cluster.shutdown().await;
}

#[tokio::test]
async fn heartbeats_follow_the_simulated_clock() {
    let cluster = Cluster::new(10, 1);
    let a = cluster.connect(0, room(), RoomKind::Chat, alice()).await.unwrap();
    while a.queue.next().now_or_never().is_some() {}

    cluster.env().advance(Duration::from_secs(21));
    cluster.tick();
    assert_eq!(a.queue.next().now_or_never(), Some(Next::Ping));

    cluster.env().advance(Duration::from_secs(40));
    cluster.tick();
    assert!(matches!(a.queue.next().await, Next::Close(code) if code.code() == 4004));
    assert!(a.queue.is_closed());

    cluster.assert_invariants("after heartbeat timeout");
    cluster.shutdown().await;
}

#[test]
fn seeded_clusters_share_nothing_but_the_seed() {
    let a = SimEnv::with_seed(11);
    let b = SimEnv::with_seed(11);
    a.advance(Duration::from_secs(5));
    assert_eq!(b.elapsed(), Duration::ZERO);
}
