//! Redis backend against a live server.
//!
//! Runs only when `SWITCHYARD_REDIS_URL` points at a Redis instance, e.g.
//! `SWITCHYARD_REDIS_URL=redis://127.0.0.1:6379 cargo test --test redis_store`.
//! Without it every test returns immediately.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use switchyard_proto::{Kind, RoomKind};
use switchyard_server::{AdmitRequest, CoordinationStore, Hub, Next, RedisStore, SystemEnv};
use uuid::Uuid;

async fn store() -> Option<RedisStore> {
    let url = std::env::var("SWITCHYARD_REDIS_URL").ok()?;
    Some(RedisStore::connect(&url).await.unwrap())
}

#[tokio::test]
async fn key_value_contract() {
    let Some(store) = store().await else { return };
    let prefix = format!("switchyard-test:{}:", Uuid::new_v4());

    store.ping().await.unwrap();
    store.set(&format!("{prefix}a"), Bytes::from_static(b"1"), None).await.unwrap();
    store.set(&format!("{prefix}b"), Bytes::from_static(b"2"), Some(Duration::from_secs(60))).await.unwrap();
    store.set(&format!("{prefix}short"), Bytes::from_static(b"3"), Some(Duration::from_millis(1))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(store.get(&format!("{prefix}a")).await.unwrap(), Some(Bytes::from_static(b"1")));
    assert_eq!(store.get(&format!("{prefix}short")).await.unwrap(), None);

    let mut keys: Vec<String> = store.scan_prefix(&prefix).await.unwrap().into_iter().map(|(k, _)| k).collect();
    keys.sort();
    assert_eq!(keys, vec![format!("{prefix}a"), format!("{prefix}b")]);

    assert!(store.delete(&format!("{prefix}a")).await.unwrap());
    assert!(!store.delete(&format!("{prefix}a")).await.unwrap());
    store.delete(&format!("{prefix}b")).await.unwrap();
}

#[tokio::test]
async fn publish_crosses_connections() {
    let (Some(a), Some(b)) = (store().await, store().await) else { return };
    let channel = format!("switchyard-test:{}", Uuid::new_v4());

    let mut sub = b.subscribe(&channel).await.unwrap();
    assert_eq!(a.publish(&channel, Bytes::from_static(b"hello")).await.unwrap(), 1);

    let got = tokio::time::timeout(Duration::from_secs(2), sub.recv()).await.unwrap();
    assert_eq!(got, Some(Bytes::from_static(b"hello")));
}

#[tokio::test]
async fn hubs_on_separate_connections_share_rooms() {
    let (Some(a), Some(b)) = (store().await, store().await) else { return };
    let hub_a = Hub::builder(SystemEnv::new(), Arc::new(a)).build();
    let hub_b = Hub::builder(SystemEnv::new(), Arc::new(b)).build();
    hub_a.start();
    hub_b.start();

    let room_id = Uuid::new_v4();
    let request = |identity| AdmitRequest { room_id, kind: RoomKind::Chat, identity, reconnect: false };
    let alice_id = Uuid::new_v4();
    let alice = hub_a.engine().admit(request(alice_id)).await.unwrap();
    let bob = hub_b.engine().admit(request(Uuid::new_v4())).await.unwrap();

    // Bob's listener subscribes in the background; resend until it is up
    let frame = r#"{"type":"message","payload":{"content":"across processes"}}"#;
    let delivered = async {
        loop {
            hub_a.engine().handle_text(alice.connection_id, frame).await;
            while let Ok(next) = tokio::time::timeout(Duration::from_millis(200), bob.queue.next()).await {
                if let Next::Envelope(envelope) = next {
                    if envelope.kind() == Kind::Message {
                        return envelope;
                    }
                }
            }
        }
    };
    let envelope = tokio::time::timeout(Duration::from_secs(10), delivered).await.unwrap();
    assert_eq!(envelope.sender_id, alice_id);

    hub_a.shutdown().await;
    hub_b.shutdown().await;
}
