//! Per-document room actor.
//!
//! A room is the single serialization domain for one document: exactly one
//! task owns the authoritative [`Replica`], the participant set and the dirty
//! flag, and processes its inbox strictly in order. Everything else talks to
//! it through [`RoomMsg`].

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use coedit_auth::{Principal, Role};
use coedit_crdt::Replica;
use coedit_protocol::{DocumentSummary, ErrorCode, PeerInfo, ServerMessage};
use coedit_store::{
    effective_permission, Acl, DocumentMeta, DocumentStore, Permission, StoreError,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;

pub type SessionId = Uuid;

/// Out-of-band notice from a room to a session. Delivered on a dedicated
/// channel so it cannot be blocked by a full frame queue.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomSignal {
    /// The room removed this participant; the session falls back to the
    /// authenticated phase.
    Ejected { document_id: String },
    /// The session must close with this error.
    Close(ErrorCode),
}

/// A room's sending end of one session.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub principal: Principal,
    frames: mpsc::Sender<ServerMessage>,
    signals: mpsc::Sender<RoomSignal>,
}

impl SessionHandle {
    pub fn new(
        session_id: SessionId,
        principal: Principal,
        outbound_capacity: usize,
    ) -> (
        Self,
        mpsc::Receiver<ServerMessage>,
        mpsc::Receiver<RoomSignal>,
    ) {
        let (frames_tx, frames_rx) = mpsc::channel(outbound_capacity);
        let (signals_tx, signals_rx) = mpsc::channel(4);
        (
            Self {
                session_id,
                principal,
                frames: frames_tx,
                signals: signals_tx,
            },
            frames_rx,
            signals_rx,
        )
    }

    /// Non-blocking enqueue. A full or closed queue is an error the room
    /// treats as a slow consumer.
    fn enqueue(&self, msg: ServerMessage) -> Result<(), ()> {
        self.frames.try_send(msg).map_err(|_| ())
    }

    fn signal(&self, signal: RoomSignal) {
        let _ = self.signals.try_send(signal);
    }
}

/// Successful join response; carries the full document state so initial sync
/// has exactly one code path.
#[derive(Debug, Clone)]
pub struct JoinAccept {
    pub metadata: DocumentSummary,
    pub has_write_access: bool,
    pub users: Vec<PeerInfo>,
    pub document_state: Vec<u8>,
}

pub enum RoomMsg {
    Join {
        handle: SessionHandle,
        reply: oneshot::Sender<Result<JoinAccept, ErrorCode>>,
    },
    Leave {
        session_id: SessionId,
    },
    Update {
        session_id: SessionId,
        update: Vec<u8>,
    },
    Cursor {
        session_id: SessionId,
        cursor: serde_json::Value,
    },
    AclChanged {
        acl: Acl,
    },
    /// Sweep handshake: retire when empty, clean and idle for `ttl`.
    RetireIfIdle {
        ttl: Duration,
        reply: oneshot::Sender<bool>,
    },
    /// Flush dirty state and stop.
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
#[derive(Debug)]
pub struct RoomHandle {
    pub doc_id: String,
    tx: mpsc::Sender<RoomMsg>,
}

impl RoomHandle {
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn send(&self, msg: RoomMsg) -> Result<(), RoomGone> {
        self.tx.send(msg).await.map_err(|_| RoomGone)
    }

    pub fn try_send(&self, msg: RoomMsg) -> Result<(), RoomGone> {
        self.tx.try_send(msg).map_err(|_| RoomGone)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("room is gone")]
pub struct RoomGone;

struct Participant {
    handle: SessionHandle,
    permission: Permission,
    cursor: Option<serde_json::Value>,
    pending_cursor: Option<serde_json::Value>,
    last_cursor_broadcast: Option<Instant>,
    joined_at: Instant,
}

pub struct Room {
    doc_id: String,
    store: Arc<dyn DocumentStore>,
    config: Arc<ServerConfig>,
    inbox: mpsc::Receiver<RoomMsg>,

    loaded: bool,
    replica: Replica,
    meta: DocumentMeta,
    acl: Acl,

    participants: BTreeMap<SessionId, Participant>,
    seq: u64,
    dirty: bool,
    merges_since_snapshot: u64,
    last_snapshot_at: Instant,
    persist_backoff: Duration,
    next_persist_at: Instant,
    idle_since: Option<Instant>,
}

/// Spawn a room actor for a document. State is loaded lazily on the first
/// join; until then the actor idles on its inbox.
pub fn spawn(
    doc_id: String,
    store: Arc<dyn DocumentStore>,
    config: Arc<ServerConfig>,
) -> RoomHandle {
    let (tx, inbox) = mpsc::channel(config.room_inbox_capacity);
    let now = Instant::now();
    let room = Room {
        meta: DocumentMeta::new(doc_id.clone(), "", ""),
        doc_id: doc_id.clone(),
        store,
        persist_backoff: config.persist_interval,
        config,
        inbox,
        loaded: false,
        replica: Replica::new(),
        acl: Acl::new(),
        participants: BTreeMap::new(),
        seq: 0,
        dirty: false,
        merges_since_snapshot: 0,
        last_snapshot_at: now,
        next_persist_at: now,
        idle_since: Some(now),
    };
    tokio::spawn(room.run());
    RoomHandle { doc_id, tx }
}

impl Room {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.persist_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(document_id = %self.doc_id, "room started");

        loop {
            tokio::select! {
                maybe = self.inbox.recv() => {
                    let Some(msg) = maybe else { break };
                    if self.handle(msg).await.is_break() {
                        break;
                    }
                }
                _ = tick.tick() => self.on_tick().await,
            }
        }

        self.flush().await;
        debug!(document_id = %self.doc_id, "room stopped");
    }

    async fn handle(&mut self, msg: RoomMsg) -> ControlFlow<()> {
        match msg {
            RoomMsg::Join { handle, reply } => return self.on_join(handle, reply).await,
            RoomMsg::Leave { session_id } => self.on_leave(session_id),
            RoomMsg::Update { session_id, update } => self.on_update(session_id, update),
            RoomMsg::Cursor { session_id, cursor } => self.on_cursor(session_id, cursor),
            RoomMsg::AclChanged { acl } => self.on_acl_changed(acl),
            RoomMsg::RetireIfIdle { ttl, reply } => {
                let retire = self.participants.is_empty()
                    && !self.dirty
                    && self
                        .idle_since
                        .is_some_and(|since| since.elapsed() >= ttl);
                let _ = reply.send(retire);
                if retire {
                    info!(document_id = %self.doc_id, "room retired");
                    return ControlFlow::Break(());
                }
            }
            RoomMsg::Shutdown { reply } => {
                self.flush().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_join(
        &mut self,
        handle: SessionHandle,
        reply: oneshot::Sender<Result<JoinAccept, ErrorCode>>,
    ) -> ControlFlow<()> {
        if !self.loaded {
            match self.store.load(&self.doc_id).await {
                Ok(record) => {
                    if let Some(state) = record.state {
                        match Replica::decode(&state.state_bytes) {
                            Ok(replica) => self.replica = replica,
                            Err(e) => {
                                error!(document_id = %self.doc_id, error = %e,
                                       "persisted state is corrupt");
                                let _ = reply.send(Err(ErrorCode::Unavailable));
                                return ControlFlow::Break(());
                            }
                        }
                    }
                    self.meta = record.meta;
                    self.acl = record.acl;
                    self.loaded = true;
                }
                Err(StoreError::NotFound) => {
                    let _ = reply.send(Err(ErrorCode::DocumentNotFound));
                    return ControlFlow::Break(());
                }
                Err(e) => {
                    warn!(document_id = %self.doc_id, error = %e, "state load failed");
                    let _ = reply.send(Err(ErrorCode::Unavailable));
                    return ControlFlow::Break(());
                }
            }
        }

        let principal = &handle.principal;
        let Some(base) = effective_permission(&self.meta, &self.acl, &principal.principal_id)
        else {
            let _ = reply.send(Err(ErrorCode::InsufficientPermissions));
            return ControlFlow::Continue(());
        };
        let permission = cap_for_role(base, principal.role);

        let accept = JoinAccept {
            metadata: summary(&self.meta),
            has_write_access: permission.can_write(),
            users: self
                .participants
                .values()
                .filter(|p| p.handle.session_id != handle.session_id)
                .map(|p| peer_info(&p.handle.principal))
                .collect(),
            document_state: self.replica.encode(),
        };

        let rejoin = self.participants.contains_key(&handle.session_id);
        let session_id = handle.session_id;
        let joined = peer_info(principal);
        self.participants.insert(
            session_id,
            Participant {
                handle,
                permission,
                cursor: None,
                pending_cursor: None,
                last_cursor_broadcast: None,
                joined_at: Instant::now(),
            },
        );
        self.idle_since = None;

        let _ = reply.send(Ok(accept));
        if !rejoin {
            self.broadcast(
                Some(session_id),
                ServerMessage::UserJoined {
                    document_id: self.doc_id.clone(),
                    user: joined,
                },
            );
        }

        // Seed the newcomer with the peers' last known cursor positions.
        let cursors: Vec<(String, serde_json::Value)> = self
            .participants
            .iter()
            .filter(|(id, _)| **id != session_id)
            .filter_map(|(_, p)| {
                p.cursor
                    .clone()
                    .map(|c| (p.handle.principal.principal_id.clone(), c))
            })
            .collect();
        for (principal_id, cursor) in cursors {
            self.send_to(
                session_id,
                ServerMessage::CursorUpdate {
                    document_id: self.doc_id.clone(),
                    principal_id,
                    cursor,
                },
            );
        }
        ControlFlow::Continue(())
    }

    fn on_leave(&mut self, session_id: SessionId) {
        let Some(participant) = self.participants.remove(&session_id) else {
            return;
        };
        self.note_leave(&participant);
        self.broadcast(
            None,
            ServerMessage::UserLeft {
                document_id: self.doc_id.clone(),
                principal_id: participant.handle.principal.principal_id.clone(),
            },
        );
    }

    fn on_update(&mut self, session_id: SessionId, update: Vec<u8>) {
        let Some(participant) = self.participants.get(&session_id) else {
            return;
        };
        let origin = participant.handle.principal.principal_id.clone();

        if !participant.permission.can_write() {
            self.send_to(
                session_id,
                ServerMessage::error(
                    ErrorCode::InsufficientPermissions,
                    "write access required",
                ),
            );
            return;
        }
        if update.is_empty() {
            self.send_to(
                session_id,
                ServerMessage::error(ErrorCode::InvalidUpdateData, "empty update"),
            );
            return;
        }

        match self.replica.merge(&update) {
            Err(e) => {
                debug!(document_id = %self.doc_id, error = %e, "rejected update");
                self.send_to(
                    session_id,
                    ServerMessage::error(ErrorCode::InvalidUpdateData, e.to_string()),
                );
            }
            Ok(outcome) => match outcome.effective {
                None => {
                    // Redundant: acknowledge, never re-broadcast.
                    self.send_to(
                        session_id,
                        ServerMessage::DocumentUpdateAck {
                            document_id: self.doc_id.clone(),
                            seq: self.seq,
                        },
                    );
                }
                Some(effective) => {
                    self.seq += 1;
                    self.dirty = true;
                    self.merges_since_snapshot += 1;
                    let seq = self.seq;
                    self.send_to(
                        session_id,
                        ServerMessage::DocumentUpdateAck {
                            document_id: self.doc_id.clone(),
                            seq,
                        },
                    );
                    self.broadcast(
                        Some(session_id),
                        ServerMessage::DocumentUpdate {
                            document_id: self.doc_id.clone(),
                            origin_principal_id: origin,
                            update: effective,
                            seq,
                        },
                    );
                }
            },
        }
    }

    fn on_cursor(&mut self, session_id: SessionId, cursor: serde_json::Value) {
        let min_interval = self.config.cursor_min_interval;
        let Some(participant) = self.participants.get_mut(&session_id) else {
            return;
        };
        participant.cursor = Some(cursor.clone());

        let now = Instant::now();
        let due = participant
            .last_cursor_broadcast
            .map_or(true, |at| now.duration_since(at) >= min_interval);
        if !due {
            participant.pending_cursor = Some(cursor);
            return;
        }
        participant.last_cursor_broadcast = Some(now);
        participant.pending_cursor = None;
        let principal_id = participant.handle.principal.principal_id.clone();
        self.broadcast(
            Some(session_id),
            ServerMessage::CursorUpdate {
                document_id: self.doc_id.clone(),
                principal_id,
                cursor,
            },
        );
    }

    fn on_acl_changed(&mut self, acl: Acl) {
        if !self.loaded {
            return;
        }
        self.acl = acl;

        let mut downgraded = Vec::new();
        let mut revoked = Vec::new();
        for (id, participant) in self.participants.iter_mut() {
            let principal = &participant.handle.principal;
            match effective_permission(&self.meta, &self.acl, &principal.principal_id)
                .map(|base| cap_for_role(base, principal.role))
            {
                None => revoked.push(*id),
                Some(permission) if permission != participant.permission => {
                    participant.permission = permission;
                    downgraded.push((*id, permission));
                }
                Some(_) => {}
            }
        }

        for (id, permission) in downgraded {
            self.send_to(
                id,
                ServerMessage::AccessChanged {
                    document_id: self.doc_id.clone(),
                    has_write_access: permission.can_write(),
                },
            );
        }
        for id in revoked {
            let Some(participant) = self.participants.remove(&id) else {
                continue;
            };
            let _ = participant.handle.enqueue(ServerMessage::AccessRevoked {
                document_id: self.doc_id.clone(),
                reason: "access revoked".into(),
            });
            participant.handle.signal(RoomSignal::Ejected {
                document_id: self.doc_id.clone(),
            });
            self.note_leave(&participant);
            self.broadcast(
                None,
                ServerMessage::UserLeft {
                    document_id: self.doc_id.clone(),
                    principal_id: participant.handle.principal.principal_id.clone(),
                },
            );
        }
    }

    async fn on_tick(&mut self) {
        self.flush_pending_cursors();
        if !self.loaded {
            return;
        }

        // Evaluate before persisting so "dirty for too long" still counts.
        let want_snapshot = self.merges_since_snapshot >= self.config.snapshot_update_threshold
            || (self.dirty
                && self.last_snapshot_at.elapsed() >= self.config.snapshot_time_threshold);

        if self.dirty && Instant::now() >= self.next_persist_at {
            let state = self.replica.encode();
            let vector = self.replica.encode_state_vector();
            match self.store.save_state(&self.doc_id, &state, &vector).await {
                Ok(()) => {
                    self.dirty = false;
                    self.persist_backoff = self.config.persist_interval;
                    self.next_persist_at = Instant::now();
                }
                Err(e) => {
                    warn!(document_id = %self.doc_id, error = %e,
                          backoff = ?self.persist_backoff, "state save failed");
                    self.next_persist_at = Instant::now() + self.persist_backoff;
                    self.persist_backoff =
                        (self.persist_backoff * 2).min(self.config.persist_backoff_cap);
                }
            }
        }

        if want_snapshot {
            let state = self.replica.encode();
            match self.store.snapshot(&self.doc_id, &state).await {
                Ok(snapshot_id) => {
                    debug!(document_id = %self.doc_id, snapshot_id = %snapshot_id, "snapshot");
                    self.merges_since_snapshot = 0;
                    self.last_snapshot_at = Instant::now();
                }
                Err(e) => {
                    warn!(document_id = %self.doc_id, error = %e, "snapshot failed");
                }
            }
        }
    }

    fn flush_pending_cursors(&mut self) {
        let min_interval = self.config.cursor_min_interval;
        let now = Instant::now();
        let mut flushable = Vec::new();
        for (id, participant) in self.participants.iter_mut() {
            let due = participant
                .last_cursor_broadcast
                .map_or(true, |at| now.duration_since(at) >= min_interval);
            if !due {
                continue;
            }
            if let Some(cursor) = participant.pending_cursor.take() {
                participant.last_cursor_broadcast = Some(now);
                flushable.push((
                    *id,
                    participant.handle.principal.principal_id.clone(),
                    cursor,
                ));
            }
        }
        for (id, principal_id, cursor) in flushable {
            self.broadcast(
                Some(id),
                ServerMessage::CursorUpdate {
                    document_id: self.doc_id.clone(),
                    principal_id,
                    cursor,
                },
            );
        }
    }

    /// Force-save dirty state with a bounded retry budget. Used on shutdown
    /// and when the actor winds down.
    async fn flush(&mut self) {
        if !self.dirty || !self.loaded {
            return;
        }
        let state = self.replica.encode();
        let vector = self.replica.encode_state_vector();
        for attempt in 1..=3u32 {
            match self.store.save_state(&self.doc_id, &state, &vector).await {
                Ok(()) => {
                    self.dirty = false;
                    return;
                }
                Err(e) => {
                    warn!(document_id = %self.doc_id, attempt, error = %e, "flush failed");
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
            }
        }
        error!(document_id = %self.doc_id, "giving up on final flush, state lost");
    }

    /// Enqueue to one participant, evicting it as a slow consumer on a full
    /// queue.
    fn send_to(&mut self, session_id: SessionId, msg: ServerMessage) {
        let Some(participant) = self.participants.get(&session_id) else {
            return;
        };
        if participant.handle.enqueue(msg).is_err() {
            self.evict_slow(session_id);
        }
    }

    /// Fan a frame out to every participant except `except`. Slow consumers
    /// are evicted on the spot and their departure is announced, which may in
    /// turn evict further participants; the work queue handles the cascade.
    fn broadcast(&mut self, except: Option<SessionId>, msg: ServerMessage) {
        let mut queue = vec![(except, msg)];
        while let Some((except, msg)) = queue.pop() {
            let mut slow = Vec::new();
            for (id, participant) in &self.participants {
                if Some(*id) == except {
                    continue;
                }
                if participant.handle.enqueue(msg.clone()).is_err() {
                    slow.push(*id);
                }
            }
            for id in slow {
                let Some(participant) = self.participants.remove(&id) else {
                    continue;
                };
                warn!(document_id = %self.doc_id, session_id = %id,
                      "outbound queue overflow, evicting slow consumer");
                participant
                    .handle
                    .signal(RoomSignal::Close(ErrorCode::SlowConsumer));
                self.note_leave(&participant);
                queue.push((
                    None,
                    ServerMessage::UserLeft {
                        document_id: self.doc_id.clone(),
                        principal_id: participant.handle.principal.principal_id.clone(),
                    },
                ));
            }
        }
    }

    fn evict_slow(&mut self, session_id: SessionId) {
        let Some(participant) = self.participants.remove(&session_id) else {
            return;
        };
        warn!(document_id = %self.doc_id, session_id = %session_id,
              "outbound queue overflow, evicting slow consumer");
        participant
            .handle
            .signal(RoomSignal::Close(ErrorCode::SlowConsumer));
        self.note_leave(&participant);
        self.broadcast(
            None,
            ServerMessage::UserLeft {
                document_id: self.doc_id.clone(),
                principal_id: participant.handle.principal.principal_id.clone(),
            },
        );
    }

    fn note_leave(&mut self, participant: &Participant) {
        debug!(document_id = %self.doc_id,
               principal_id = %participant.handle.principal.principal_id,
               connected = ?participant.joined_at.elapsed(),
               "participant left");
        if self.participants.is_empty() {
            self.idle_since = Some(Instant::now());
        }
    }
}

fn cap_for_role(base: Permission, role: Role) -> Permission {
    if role.can_write() {
        base
    } else {
        Permission::Read
    }
}

fn summary(meta: &DocumentMeta) -> DocumentSummary {
    DocumentSummary {
        id: meta.doc_id.clone(),
        title: meta.title.clone(),
        owner_id: meta.owner_id.clone(),
        public: meta.public,
        created_at: meta.created_at,
        updated_at: meta.updated_at,
    }
}

fn peer_info(principal: &Principal) -> PeerInfo {
    PeerInfo {
        principal_id: principal.principal_id.clone(),
        display_name: principal.display_name.clone(),
        role: principal.role.as_str().to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coedit_store::MemStore;
    use yrs::updates::decoder::Decode;
    use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update};

    fn principal(id: &str, role: Role) -> Principal {
        Principal {
            principal_id: id.into(),
            display_name: id.to_uppercase(),
            role,
            permissions: Vec::new(),
        }
    }

    fn test_config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig {
            persist_interval: Duration::from_millis(50),
            ..ServerConfig::default()
        })
    }

    async fn seeded_store() -> Arc<MemStore> {
        let store = Arc::new(MemStore::new());
        let mut acl = Acl::new();
        acl.insert("bob".into(), Permission::Write);
        acl.insert("carol".into(), Permission::Read);
        store
            .create(&DocumentMeta::new("doc-1", "Notes", "alice"), &acl)
            .await
            .unwrap();
        store
    }

    #[derive(Debug)]
    struct Peer {
        session_id: SessionId,
        frames: mpsc::Receiver<ServerMessage>,
        signals: mpsc::Receiver<RoomSignal>,
        accept: JoinAccept,
    }

    async fn join_as(
        room: &RoomHandle,
        session_id: SessionId,
        who: Principal,
        capacity: usize,
    ) -> Result<Peer, ErrorCode> {
        let (handle, frames, signals) = SessionHandle::new(session_id, who, capacity);
        let (reply_tx, reply_rx) = oneshot::channel();
        room.send(RoomMsg::Join {
            handle,
            reply: reply_tx,
        })
        .await
        .expect("room alive");
        let accept = reply_rx.await.expect("join reply")?;
        Ok(Peer {
            session_id,
            frames,
            signals,
            accept,
        })
    }

    async fn join(room: &RoomHandle, who: Principal, capacity: usize) -> Result<Peer, ErrorCode> {
        join_as(room, Uuid::new_v4(), who, capacity).await
    }

    /// Build an update editing on top of `base`, the way a client would.
    fn make_update(base: &[u8], text: &str) -> Vec<u8> {
        update_series(base, &[text]).pop().unwrap()
    }

    /// A series of sequential updates from one client, each building on the
    /// previous.
    fn update_series(base: &[u8], inserts: &[&str]) -> Vec<Vec<u8>> {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("content");
        if !base.is_empty() {
            let mut txn = doc.transact_mut();
            txn.apply_update(Update::decode_v1(base).unwrap()).unwrap();
        }
        let mut out = Vec::new();
        for insert in inserts {
            let before = {
                let txn = doc.transact();
                txn.state_vector()
            };
            {
                let mut txn = doc.transact_mut();
                text.insert(&mut txn, 0, insert);
            }
            let txn = doc.transact();
            out.push(txn.encode_state_as_update_v1(&before));
        }
        out
    }

    fn text_of(state: &[u8]) -> String {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("content");
        if !state.is_empty() {
            let mut txn = doc.transact_mut();
            txn.apply_update(Update::decode_v1(state).unwrap()).unwrap();
        }
        let txn = doc.transact();
        text.get_string(&txn)
    }

    #[tokio::test]
    async fn join_delivers_full_state_and_roster() {
        let store = seeded_store().await;
        let room = spawn("doc-1".into(), store, test_config());

        let mut alice = join(&room, principal("alice", Role::Editor), 64)
            .await
            .unwrap();
        assert!(alice.accept.has_write_access);
        assert!(alice.accept.users.is_empty());
        assert_eq!(alice.accept.metadata.id, "doc-1");
        assert_eq!(alice.accept.metadata.title, "Notes");

        let bob = join(&room, principal("bob", Role::Editor), 64)
            .await
            .unwrap();
        assert_eq!(bob.accept.users.len(), 1);
        assert_eq!(bob.accept.users[0].principal_id, "alice");

        // Alice is told about bob.
        match alice.frames.recv().await.unwrap() {
            ServerMessage::UserJoined { user, .. } => assert_eq!(user.principal_id, "bob"),
            other => panic!("expected user-joined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_is_acked_broadcast_and_never_echoed() {
        let store = seeded_store().await;
        let room = spawn("doc-1".into(), store, test_config());

        let mut alice = join(&room, principal("alice", Role::Editor), 64)
            .await
            .unwrap();
        let mut bob = join(&room, principal("bob", Role::Editor), 64)
            .await
            .unwrap();
        let _ = alice.frames.recv().await; // user-joined for bob

        let update = make_update(&alice.accept.document_state, "hello");
        room.send(RoomMsg::Update {
            session_id: alice.session_id,
            update: update.clone(),
        })
        .await
        .unwrap();

        match alice.frames.recv().await.unwrap() {
            ServerMessage::DocumentUpdateAck { seq, .. } => assert_eq!(seq, 1),
            other => panic!("expected ack, got {other:?}"),
        }
        match bob.frames.recv().await.unwrap() {
            ServerMessage::DocumentUpdate {
                origin_principal_id,
                seq,
                ..
            } => {
                assert_eq!(origin_principal_id, "alice");
                assert_eq!(seq, 1);
            }
            other => panic!("expected document-update, got {other:?}"),
        }
        // Exactly one ack, zero update frames for the originator.
        assert!(alice.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn redundant_update_is_acked_but_not_rebroadcast() {
        let store = seeded_store().await;
        let room = spawn("doc-1".into(), store, test_config());

        let mut alice = join(&room, principal("alice", Role::Editor), 64)
            .await
            .unwrap();
        let mut bob = join(&room, principal("bob", Role::Editor), 64)
            .await
            .unwrap();
        let _ = alice.frames.recv().await;

        let update = make_update(&alice.accept.document_state, "hello");
        for _ in 0..2 {
            room.send(RoomMsg::Update {
                session_id: alice.session_id,
                update: update.clone(),
            })
            .await
            .unwrap();
        }

        // Two acks for the originator, the duplicate with an unchanged seq.
        let acks: Vec<u64> = [
            alice.frames.recv().await.unwrap(),
            alice.frames.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|m| match m {
            ServerMessage::DocumentUpdateAck { seq, .. } => seq,
            other => panic!("expected ack, got {other:?}"),
        })
        .collect();
        assert_eq!(acks, vec![1, 1]);

        // Peers see the update exactly once.
        assert!(matches!(
            bob.frames.recv().await.unwrap(),
            ServerMessage::DocumentUpdate { .. }
        ));
        assert!(bob.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn reader_updates_are_rejected_without_touching_state() {
        let store = seeded_store().await;
        let room = spawn("doc-1".into(), store, test_config());

        let mut alice = join(&room, principal("alice", Role::Editor), 64)
            .await
            .unwrap();
        let mut carol = join(&room, principal("carol", Role::Viewer), 64)
            .await
            .unwrap();
        let _ = alice.frames.recv().await;

        let update = make_update(&carol.accept.document_state, "sneaky");
        room.send(RoomMsg::Update {
            session_id: carol.session_id,
            update,
        })
        .await
        .unwrap();

        match carol.frames.recv().await.unwrap() {
            ServerMessage::Error { code, .. } => {
                assert_eq!(code, ErrorCode::InsufficientPermissions)
            }
            other => panic!("expected error, got {other:?}"),
        }
        // Peers saw nothing, and a fresh join observes unchanged content.
        assert!(alice.frames.try_recv().is_err());
        let late = join(&room, principal("bob", Role::Editor), 64)
            .await
            .unwrap();
        assert_eq!(text_of(&late.accept.document_state), "");
    }

    #[tokio::test]
    async fn empty_update_is_invalid() {
        let store = seeded_store().await;
        let room = spawn("doc-1".into(), store, test_config());
        let mut alice = join(&room, principal("alice", Role::Editor), 64)
            .await
            .unwrap();

        room.send(RoomMsg::Update {
            session_id: alice.session_id,
            update: Vec::new(),
        })
        .await
        .unwrap();

        match alice.frames.recv().await.unwrap() {
            ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidUpdateData),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_update_is_reported_to_sender_only() {
        let store = seeded_store().await;
        let room = spawn("doc-1".into(), store, test_config());

        let mut alice = join(&room, principal("alice", Role::Editor), 64)
            .await
            .unwrap();
        let mut bob = join(&room, principal("bob", Role::Editor), 64)
            .await
            .unwrap();
        let _ = alice.frames.recv().await;

        room.send(RoomMsg::Update {
            session_id: bob.session_id,
            update: vec![0xff, 0x00, 0xff],
        })
        .await
        .unwrap();

        match bob.frames.recv().await.unwrap() {
            ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidUpdateData),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(alice.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn join_of_unknown_document_fails() {
        let store = Arc::new(MemStore::new());
        let room = spawn("ghost".into(), store, test_config());
        let err = join(&room, principal("alice", Role::Editor), 64)
            .await
            .unwrap_err();
        assert_eq!(err, ErrorCode::DocumentNotFound);
    }

    #[tokio::test]
    async fn join_without_any_grant_fails() {
        let store = seeded_store().await;
        let room = spawn("doc-1".into(), store, test_config());
        let err = join(&room, principal("mallory", Role::Editor), 64)
            .await
            .unwrap_err();
        assert_eq!(err, ErrorCode::InsufficientPermissions);
    }

    #[tokio::test]
    async fn rejoin_of_same_session_is_idempotent() {
        let store = seeded_store().await;
        let room = spawn("doc-1".into(), store, test_config());

        let session_id = Uuid::new_v4();
        let _first = join_as(&room, session_id, principal("alice", Role::Editor), 64)
            .await
            .unwrap();
        let _second = join_as(&room, session_id, principal("alice", Role::Editor), 64)
            .await
            .unwrap();

        // A third party sees a single participant entry.
        let bob = join(&room, principal("bob", Role::Editor), 64)
            .await
            .unwrap();
        assert_eq!(bob.accept.users.len(), 1);
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_and_the_room_keeps_going() {
        let store = seeded_store().await;
        let room = spawn("doc-1".into(), store, test_config());

        let mut alice = join(&room, principal("alice", Role::Editor), 1024)
            .await
            .unwrap();
        // Bob never reads his frames.
        let mut bob = join(&room, principal("bob", Role::Editor), 2)
            .await
            .unwrap();
        let _ = alice.frames.recv().await;

        let updates = update_series(
            &alice.accept.document_state,
            &["a", "b", "c", "d", "e", "f", "g", "h"],
        );
        let total = updates.len() as u64;
        for update in updates {
            room.send(RoomMsg::Update {
                session_id: alice.session_id,
                update,
            })
            .await
            .unwrap();
        }

        assert_eq!(
            bob.signals.recv().await.unwrap(),
            RoomSignal::Close(ErrorCode::SlowConsumer)
        );

        // Every update was acknowledged to alice, undelayed by bob.
        let mut acked = 0;
        let mut saw_bob_leave = false;
        while acked < total {
            match alice.frames.recv().await.unwrap() {
                ServerMessage::DocumentUpdateAck { seq, .. } => acked = acked.max(seq),
                ServerMessage::UserLeft { principal_id, .. } => {
                    assert_eq!(principal_id, "bob");
                    saw_bob_leave = true;
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert!(saw_bob_leave);
    }

    #[tokio::test]
    async fn acl_change_downgrades_and_revokes() {
        let store = seeded_store().await;
        let room = spawn("doc-1".into(), store, test_config());

        let mut alice = join(&room, principal("alice", Role::Editor), 64)
            .await
            .unwrap();
        let mut bob = join(&room, principal("bob", Role::Editor), 64)
            .await
            .unwrap();
        let _ = alice.frames.recv().await;

        // Bob drops from write to read.
        let mut acl = Acl::new();
        acl.insert("bob".into(), Permission::Read);
        room.send(RoomMsg::AclChanged { acl }).await.unwrap();

        match bob.frames.recv().await.unwrap() {
            ServerMessage::AccessChanged {
                has_write_access, ..
            } => assert!(!has_write_access),
            other => panic!("expected access-changed, got {other:?}"),
        }

        // His next update is rejected, but he still receives peer updates.
        let update = make_update(&bob.accept.document_state, "nope");
        room.send(RoomMsg::Update {
            session_id: bob.session_id,
            update,
        })
        .await
        .unwrap();
        match bob.frames.recv().await.unwrap() {
            ServerMessage::Error { code, .. } => {
                assert_eq!(code, ErrorCode::InsufficientPermissions)
            }
            other => panic!("expected error, got {other:?}"),
        }

        let update = make_update(&alice.accept.document_state, "hello");
        room.send(RoomMsg::Update {
            session_id: alice.session_id,
            update,
        })
        .await
        .unwrap();
        assert!(matches!(
            bob.frames.recv().await.unwrap(),
            ServerMessage::DocumentUpdate { .. }
        ));

        // Bob loses read entirely: ejected with access-revoked.
        room.send(RoomMsg::AclChanged { acl: Acl::new() })
            .await
            .unwrap();
        assert!(matches!(
            bob.frames.recv().await.unwrap(),
            ServerMessage::AccessRevoked { .. }
        ));
        assert!(matches!(
            bob.signals.recv().await.unwrap(),
            RoomSignal::Ejected { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dirty_state_persists_on_tick_and_retries_after_failure() {
        let store = seeded_store().await;
        let room = spawn("doc-1".into(), store.clone(), test_config());

        let alice = join(&room, principal("alice", Role::Editor), 64)
            .await
            .unwrap();
        let update = make_update(&alice.accept.document_state, "durable");
        room.send(RoomMsg::Update {
            session_id: alice.session_id,
            update,
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let saved = store.saved_state("doc-1").expect("state persisted");
        assert_eq!(text_of(&saved.state_bytes), "durable");

        // Saves start failing: the dirty flag survives and the save is
        // retried once the store recovers.
        store.set_fail_saves(true);
        let update = make_update(&saved.state_bytes, " more");
        room.send(RoomMsg::Update {
            session_id: alice.session_id,
            update,
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let stale = store.saved_state("doc-1").unwrap();
        assert_eq!(text_of(&stale.state_bytes), "durable");

        store.set_fail_saves(false);
        tokio::time::sleep(Duration::from_secs(2)).await;
        let fresh = store.saved_state("doc-1").unwrap();
        assert_eq!(text_of(&fresh.state_bytes), " moredurable");
    }

    #[tokio::test(start_paused = true)]
    async fn cursor_updates_are_throttled_and_coalesced() {
        let store = seeded_store().await;
        let room = spawn("doc-1".into(), store, test_config());

        let alice = join(&room, principal("alice", Role::Editor), 64)
            .await
            .unwrap();
        let mut bob = join(&room, principal("bob", Role::Editor), 64)
            .await
            .unwrap();

        for i in 0..5 {
            room.send(RoomMsg::Cursor {
                session_id: alice.session_id,
                cursor: serde_json::json!({ "offset": i }),
            })
            .await
            .unwrap();
        }

        // First one goes out immediately.
        match bob.frames.recv().await.unwrap() {
            ServerMessage::CursorUpdate { cursor, .. } => {
                assert_eq!(cursor, serde_json::json!({ "offset": 0 }))
            }
            other => panic!("expected cursor-update, got {other:?}"),
        }

        // The rest are coalesced; only the latest arrives after the tick.
        tokio::time::sleep(Duration::from_millis(200)).await;
        match bob.frames.recv().await.unwrap() {
            ServerMessage::CursorUpdate { cursor, .. } => {
                assert_eq!(cursor, serde_json::json!({ "offset": 4 }))
            }
            other => panic!("expected cursor-update, got {other:?}"),
        }
        assert!(bob.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn retire_handshake_respects_participants_and_ttl() {
        let store = seeded_store().await;
        let room = spawn("doc-1".into(), store, test_config());

        let alice = join(&room, principal("alice", Role::Editor), 64)
            .await
            .unwrap();

        // Occupied rooms refuse to retire.
        let (reply_tx, reply_rx) = oneshot::channel();
        room.send(RoomMsg::RetireIfIdle {
            ttl: Duration::ZERO,
            reply: reply_tx,
        })
        .await
        .unwrap();
        assert!(!reply_rx.await.unwrap());

        room.send(RoomMsg::Leave {
            session_id: alice.session_id,
        })
        .await
        .unwrap();

        let (reply_tx, reply_rx) = oneshot::channel();
        room.send(RoomMsg::RetireIfIdle {
            ttl: Duration::ZERO,
            reply: reply_tx,
        })
        .await
        .unwrap();
        assert!(reply_rx.await.unwrap());

        // The actor is gone afterwards.
        tokio::time::timeout(Duration::from_secs(1), async {
            while !room.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("room actor exits");
    }

    #[tokio::test]
    async fn shutdown_flushes_dirty_state() {
        let store = seeded_store().await;
        let room = spawn("doc-1".into(), store.clone(), test_config());

        let alice = join(&room, principal("alice", Role::Editor), 64)
            .await
            .unwrap();
        let update = make_update(&alice.accept.document_state, "flushed");
        room.send(RoomMsg::Update {
            session_id: alice.session_id,
            update,
        })
        .await
        .unwrap();

        let (reply_tx, reply_rx) = oneshot::channel();
        room.send(RoomMsg::Shutdown { reply: reply_tx })
            .await
            .unwrap();
        reply_rx.await.unwrap();

        let saved = store.saved_state("doc-1").expect("flushed on shutdown");
        assert_eq!(text_of(&saved.state_bytes), "flushed");
    }
}
