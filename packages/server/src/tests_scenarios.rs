//! End-to-end scenarios exercised at the registry/room layer.
//!
//! These drive the same message flow a session would: join through the
//! registry, send updates on the room handle, observe broadcast frames on
//! the per-session queues.

use std::sync::Arc;
use std::time::Duration;

use coedit_auth::{Principal, Role};
use coedit_crdt::{covers, Replica};
use coedit_protocol::{ErrorCode, ServerMessage};
use coedit_store::{Acl, DocumentMeta, DocumentStore, MemStore, Permission};
use tokio::sync::mpsc;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update};

use crate::config::ServerConfig;
use crate::registry::RoomRegistry;
use crate::room::{RoomHandle, RoomMsg, RoomSignal, SessionHandle, SessionId};

fn principal(id: &str, role: Role) -> Principal {
    Principal {
        principal_id: id.into(),
        display_name: id.to_uppercase(),
        role,
        permissions: Vec::new(),
    }
}

fn config(overrides: impl FnOnce(&mut ServerConfig)) -> Arc<ServerConfig> {
    let mut config = ServerConfig {
        persist_interval: Duration::from_millis(50),
        ..ServerConfig::default()
    };
    overrides(&mut config);
    Arc::new(config)
}

async fn seeded_registry(config: Arc<ServerConfig>) -> (Arc<RoomRegistry>, Arc<MemStore>) {
    let store = Arc::new(MemStore::new());
    let mut acl = Acl::new();
    acl.insert("bob".into(), Permission::Write);
    acl.insert("carol".into(), Permission::Read);
    store
        .create(&DocumentMeta::new("doc-1", "Notes", "alice"), &acl)
        .await
        .unwrap();
    let registry = RoomRegistry::new(store.clone(), config);
    (registry, store)
}

struct Client {
    session_id: SessionId,
    frames: mpsc::Receiver<ServerMessage>,
    signals: mpsc::Receiver<RoomSignal>,
    room: RoomHandle,
    /// Local replica, kept in sync the way a real editor would.
    replica: Replica,
}

impl Client {
    async fn join(
        registry: &RoomRegistry,
        doc_id: &str,
        who: Principal,
        capacity: usize,
    ) -> Result<Self, ErrorCode> {
        let session_id = Uuid::new_v4();
        let (handle, frames, signals) = SessionHandle::new(session_id, who, capacity);
        let (accept, room) = registry.join(doc_id, handle).await?;
        let replica = Replica::decode(&accept.document_state).expect("join state decodes");
        Ok(Self {
            session_id,
            frames,
            signals,
            room,
            replica,
        })
    }

    /// Edit the local replica and return the update a client would ship.
    fn edit(&mut self, at: u32, text: &str) -> Vec<u8> {
        let scratch = Doc::new();
        let content = scratch.get_or_insert_text("content");
        {
            let mut txn = scratch.transact_mut();
            txn.apply_update(Update::decode_v1(&self.replica.encode()).unwrap())
                .unwrap();
        }
        let before = {
            let txn = scratch.transact();
            txn.state_vector()
        };
        {
            let mut txn = scratch.transact_mut();
            content.insert(&mut txn, at, text);
        }
        let update = {
            let txn = scratch.transact();
            txn.encode_state_as_update_v1(&before)
        };
        self.replica.merge(&update).unwrap();
        update
    }

    async fn send_update(&self, update: Vec<u8>) {
        self.room
            .send(RoomMsg::Update {
                session_id: self.session_id,
                update,
            })
            .await
            .unwrap();
    }

    /// Pull frames until the predicate consumes one, applying peer updates
    /// to the local replica on the way.
    async fn pump_until(&mut self, mut done: impl FnMut(&ServerMessage) -> bool) {
        loop {
            let frame = self.frames.recv().await.expect("room closed frame queue");
            if let ServerMessage::DocumentUpdate { update, .. } = &frame {
                self.replica.merge(update).unwrap();
            }
            if done(&frame) {
                return;
            }
        }
    }

    fn text(&self) -> String {
        let doc = Doc::new();
        let content = doc.get_or_insert_text("content");
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(Update::decode_v1(&self.replica.encode()).unwrap())
                .unwrap();
        }
        let txn = doc.transact();
        content.get_string(&txn)
    }
}

#[tokio::test]
async fn two_writers_converge() {
    let (registry, _store) = seeded_registry(config(|_| {})).await;

    let mut alice = Client::join(&registry, "doc-1", principal("alice", Role::Editor), 256)
        .await
        .unwrap();
    let mut bob = Client::join(&registry, "doc-1", principal("bob", Role::Editor), 256)
        .await
        .unwrap();

    let update_a = alice.edit(0, "hello");
    let update_b = bob.edit(0, "world");
    alice.send_update(update_a).await;
    bob.send_update(update_b).await;

    // Each writer sees exactly one ack and the peer's update.
    let mut alice_acks = 0;
    alice
        .pump_until(|frame| {
            if matches!(frame, ServerMessage::DocumentUpdateAck { .. }) {
                alice_acks += 1;
            }
            matches!(frame, ServerMessage::DocumentUpdate { .. })
        })
        .await;
    let mut bob_acks = 0;
    bob.pump_until(|frame| {
        if matches!(frame, ServerMessage::DocumentUpdateAck { .. }) {
            bob_acks += 1;
        }
        matches!(frame, ServerMessage::DocumentUpdate { .. })
    })
    .await;
    // Finish pumping the straggler ack if it came after the update.
    if alice_acks == 0 {
        alice
            .pump_until(|frame| matches!(frame, ServerMessage::DocumentUpdateAck { .. }))
            .await;
    }
    if bob_acks == 0 {
        bob.pump_until(|frame| matches!(frame, ServerMessage::DocumentUpdateAck { .. }))
            .await;
    }

    // Both replicas converge, each insertion present exactly once.
    assert_eq!(alice.replica.state_vector(), bob.replica.state_vector());
    let text = alice.text();
    assert_eq!(text.matches("hello").count(), 1);
    assert_eq!(text.matches("world").count(), 1);

    // A fresh join observes the same merged history.
    let late = Client::join(&registry, "doc-1", principal("carol", Role::Viewer), 256)
        .await
        .unwrap();
    assert_eq!(late.replica.state_vector(), alice.replica.state_vector());
}

#[tokio::test]
async fn viewer_cannot_write() {
    let (registry, _store) = seeded_registry(config(|_| {})).await;

    let mut alice = Client::join(&registry, "doc-1", principal("alice", Role::Editor), 256)
        .await
        .unwrap();
    let mut carol = Client::join(&registry, "doc-1", principal("carol", Role::Viewer), 256)
        .await
        .unwrap();

    let vector_before = carol.replica.state_vector();
    let update = carol.edit(0, "sneaky");
    carol.send_update(update).await;

    carol
        .pump_until(|frame| {
            matches!(
                frame,
                ServerMessage::Error {
                    code: ErrorCode::InsufficientPermissions,
                    ..
                }
            )
        })
        .await;

    // Alice saw nothing but carol's arrival; the room state is untouched.
    match alice.frames.try_recv() {
        Ok(ServerMessage::UserJoined { .. }) => {}
        Ok(other) => panic!("unexpected frame {other:?}"),
        Err(_) => {}
    }
    assert!(alice.frames.try_recv().is_err());
    let late = Client::join(&registry, "doc-1", principal("bob", Role::Editor), 256)
        .await
        .unwrap();
    assert_eq!(late.replica.state_vector(), vector_before);
}

#[tokio::test(start_paused = true)]
async fn reconnect_recovers_state() {
    let (registry, _store) = seeded_registry(config(|_| {})).await;

    let mut alice = Client::join(&registry, "doc-1", principal("alice", Role::Editor), 256)
        .await
        .unwrap();
    let update = alice.edit(0, "persist me");
    alice.send_update(update).await;
    alice
        .pump_until(|frame| matches!(frame, ServerMessage::DocumentUpdateAck { .. }))
        .await;
    let vector_v1 = alice.replica.state_vector();

    // Disconnect: leave and let the room persist.
    alice
        .room
        .send(RoomMsg::Leave {
            session_id: alice.session_id,
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // A new session from the same principal finds everything it wrote.
    let rejoined = Client::join(&registry, "doc-1", principal("alice", Role::Editor), 256)
        .await
        .unwrap();
    assert!(covers(&rejoined.replica.state_vector(), &vector_v1));
    assert_eq!(rejoined.text(), "persist me");
}

#[tokio::test]
async fn slow_consumer_is_closed_without_stalling_writers() {
    let (registry, _store) = seeded_registry(config(|_| {})).await;

    let mut alice = Client::join(&registry, "doc-1", principal("alice", Role::Editor), 4096)
        .await
        .unwrap();
    // Bob stops reading his socket; his queue is shallow.
    let mut bob = Client::join(&registry, "doc-1", principal("bob", Role::Editor), 64)
        .await
        .unwrap();

    let mut updates = Vec::with_capacity(2000);
    for _ in 0..2000 {
        updates.push(alice.edit(0, "x"));
    }
    for update in updates {
        alice.send_update(update).await;
    }

    // Bob is closed out-of-band, not via his jammed frame queue.
    assert_eq!(
        bob.signals.recv().await.unwrap(),
        RoomSignal::Close(ErrorCode::SlowConsumer)
    );

    // Every one of alice's updates is acknowledged.
    let mut last_seq = 0;
    let mut saw_bob_leave = false;
    while last_seq < 2000 {
        let frame = alice.frames.recv().await.unwrap();
        match frame {
            ServerMessage::DocumentUpdateAck { seq, .. } => last_seq = last_seq.max(seq),
            ServerMessage::UserLeft { principal_id, .. } => {
                assert_eq!(principal_id, "bob");
                saw_bob_leave = true;
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert!(saw_bob_leave);
}

#[tokio::test(start_paused = true)]
async fn idle_rooms_are_destroyed_and_recreated_from_durable_state() {
    let config = config(|c| c.room_idle_ttl = Duration::from_millis(100));
    let (registry, _store) = seeded_registry(config).await;

    let mut alice = Client::join(&registry, "doc-1", principal("alice", Role::Editor), 256)
        .await
        .unwrap();
    let update = alice.edit(0, "outlives the room");
    alice.send_update(update).await;
    alice
        .pump_until(|frame| matches!(frame, ServerMessage::DocumentUpdateAck { .. }))
        .await;

    alice
        .room
        .send(RoomMsg::Leave {
            session_id: alice.session_id,
        })
        .await
        .unwrap();

    // Let the room persist and sit idle past the TTL, then sweep.
    tokio::time::sleep(Duration::from_millis(400)).await;
    registry.sweep().await;
    assert!(!registry.has_room("doc-1").await);

    // The next join builds a fresh room from the durable record.
    let rejoined = Client::join(&registry, "doc-1", principal("bob", Role::Editor), 256)
        .await
        .unwrap();
    assert_eq!(rejoined.text(), "outlives the room");
    assert!(registry.has_room("doc-1").await);
}

#[tokio::test]
async fn access_revoked_mid_session() {
    let (registry, _store) = seeded_registry(config(|_| {})).await;

    let mut alice = Client::join(&registry, "doc-1", principal("alice", Role::Editor), 256)
        .await
        .unwrap();
    let mut bob = Client::join(&registry, "doc-1", principal("bob", Role::Editor), 256)
        .await
        .unwrap();

    // Bob is downgraded to read-only.
    let mut acl = Acl::new();
    acl.insert("bob".into(), Permission::Read);
    registry.acl_changed("doc-1", acl).await;

    bob.pump_until(|frame| {
        matches!(
            frame,
            ServerMessage::AccessChanged {
                has_write_access: false,
                ..
            }
        )
    })
    .await;

    // His writes are now rejected...
    let update = bob.edit(0, "rejected");
    bob.send_update(update).await;
    bob.pump_until(|frame| {
        matches!(
            frame,
            ServerMessage::Error {
                code: ErrorCode::InsufficientPermissions,
                ..
            }
        )
    })
    .await;

    // ...but he remains joined and still reads peer updates.
    let update = alice.edit(0, "still visible to bob");
    alice.send_update(update).await;
    bob.pump_until(|frame| matches!(frame, ServerMessage::DocumentUpdate { .. }))
        .await;
    assert!(bob.text().contains("still visible to bob"));
}
