//! Crash recovery tests for `RedbStore`.
//!
//! Call records written by one hub must be found by a hub opened on the same
//! database file after the first one is gone, simulating a process restart.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use switchyard_core::{CallState, CallStatus, HubError};
use switchyard_proto::{Kind, RoomKind};
use switchyard_server::{AdmitRequest, CoordinationStore, Hub, Next, RedbStore, SystemEnv};
use tempfile::tempdir;
use uuid::Uuid;

fn room() -> Uuid {
    Uuid::from_u128(0xCA11)
}

fn alice() -> Uuid {
    Uuid::from_u128(0xA)
}

fn bob() -> Uuid {
    Uuid::from_u128(0xB)
}

fn request(identity: Uuid, reconnect: bool) -> AdmitRequest {
    AdmitRequest { room_id: room(), kind: RoomKind::Call, identity, reconnect }
}

/// Shut the hub down and wait until nothing holds the database any more.
async fn stop(hub: Arc<Hub<SystemEnv>>) {
    hub.shutdown().await;
    for _ in 0..200 {
        if hub.bridge().stats().listeners == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    drop(hub);
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_raw_entries_survive_reopen() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("switchyard.redb");

    {
        let store = RedbStore::open(&db_path).unwrap();
        store.set("call_state:1", Bytes::from_static(b"one"), None).await.unwrap();
        store.set("call_state:2", Bytes::from_static(b"two"), Some(Duration::from_secs(3600))).await.unwrap();
        store.set("presence:1", Bytes::from_static(b"{}"), Some(Duration::from_millis(1))).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(20)).await;

    {
        let store = RedbStore::open(&db_path).unwrap();
        assert_eq!(store.get("call_state:1").await.unwrap(), Some(Bytes::from_static(b"one")));
        assert_eq!(store.get("call_state:2").await.unwrap(), Some(Bytes::from_static(b"two")));
        assert_eq!(store.get("presence:1").await.unwrap(), None);

        let mut keys: Vec<String> =
            store.scan_prefix("call_state:").await.unwrap().into_iter().map(|(k, _)| k).collect();
        keys.sort();
        assert_eq!(keys, vec!["call_state:1".to_string(), "call_state:2".to_string()]);
    }
}

#[tokio::test]
async fn test_live_call_survives_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("switchyard.redb");

    {
        let store = RedbStore::open(&db_path).unwrap();
        let hub = Hub::builder(SystemEnv::new(), Arc::new(store)).build();
        hub.start();

        let _a = hub.engine().admit(request(alice(), false)).await.unwrap();
        let _b = hub.engine().admit(request(bob(), false)).await.unwrap();

        stop(hub).await;
    }

    let store = RedbStore::open(&db_path).unwrap();
    let stored = store.get(&CallState::key_for(room())).await.unwrap().unwrap();
    let record = CallState::from_json(&stored).unwrap();
    assert_eq!(record.status, CallStatus::Active);
    assert_eq!(record.participant_ids, vec![alice(), bob()]);

    let hub = Hub::builder(SystemEnv::new(), Arc::new(store)).build();
    let active = hub.states().list_active().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(hub.recover().await.unwrap(), 1);
    hub.start();

    let a = hub.engine().admit(request(alice(), true)).await.unwrap();
    match a.queue.next().await {
        Next::Envelope(envelope) => assert_eq!(envelope.kind(), Kind::Reconnected),
        other => panic!("expected reconnected, got {other:?}"),
    }

    let stranger = hub.engine().admit(request(Uuid::from_u128(0xC), true)).await;
    assert!(matches!(stranger, Err(HubError::Authorization { .. })));

    stop(hub).await;
}

#[tokio::test]
async fn test_ended_call_is_not_recovered() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("switchyard.redb");

    {
        let store = RedbStore::open(&db_path).unwrap();
        let hub = Hub::builder(SystemEnv::new(), Arc::new(store)).build();
        hub.start();

        let _a = hub.engine().admit(request(alice(), false)).await.unwrap();
        assert!(hub.end_call(room()).await.unwrap());

        stop(hub).await;
    }

    let store = RedbStore::open(&db_path).unwrap();
    let hub = Hub::builder(SystemEnv::new(), Arc::new(store)).build();
    assert_eq!(hub.recover().await.unwrap(), 0);
    assert_eq!(hub.registry().room_count(), 0);

    let rejoin = hub.engine().admit(request(alice(), true)).await;
    assert!(matches!(rejoin, Err(HubError::TerminalState { .. })));
    let fresh = hub.engine().admit(request(bob(), false)).await;
    assert!(matches!(fresh, Err(HubError::TerminalState { .. })));
}
