//! Room lifecycle: lazy creation, join routing, idle sweep.

use std::collections::HashMap;
use std::sync::Arc;

use coedit_protocol::ErrorCode;
use coedit_store::{Acl, DocumentStore};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::room::{self, JoinAccept, RoomHandle, RoomMsg, SessionHandle};

/// Owns every live room. Creation is exclusive per document id; destruction
/// happens only through the sweep handshake, so a join and a destroy cannot
/// race.
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, RoomHandle>>,
    store: Arc<dyn DocumentStore>,
    config: Arc<ServerConfig>,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, config: Arc<ServerConfig>) -> Arc<Self> {
        Arc::new(Self {
            rooms: Mutex::new(HashMap::new()),
            store,
            config,
        })
    }

    /// Fetch the room for a document, creating it if absent or dead.
    async fn handle_for(&self, doc_id: &str) -> RoomHandle {
        let mut rooms = self.rooms.lock().await;
        if let Some(handle) = rooms.get(doc_id) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }
        debug!(document_id = %doc_id, "creating room");
        let handle = room::spawn(doc_id.to_owned(), self.store.clone(), self.config.clone());
        rooms.insert(doc_id.to_owned(), handle.clone());
        handle
    }

    /// Join a session into a document's room. Retries once when the room
    /// dies between lookup and reply (e.g. a concurrent retire).
    pub async fn join(
        &self,
        doc_id: &str,
        handle: SessionHandle,
    ) -> Result<(JoinAccept, RoomHandle), ErrorCode> {
        for _ in 0..2 {
            let room = self.handle_for(doc_id).await;
            let (reply_tx, reply_rx) = oneshot::channel();
            let msg = RoomMsg::Join {
                handle: handle.clone(),
                reply: reply_tx,
            };
            if room.send(msg).await.is_err() {
                continue;
            }
            match reply_rx.await {
                Ok(Ok(accept)) => return Ok((accept, room)),
                Ok(Err(code)) => return Err(code),
                Err(_) => continue,
            }
        }
        Err(ErrorCode::Unavailable)
    }

    /// Inform a live room that the document's ACL changed. A document with
    /// no room has nothing to do; the next join reloads from the store.
    pub async fn acl_changed(&self, doc_id: &str, acl: Acl) {
        let handle = {
            let rooms = self.rooms.lock().await;
            rooms.get(doc_id).cloned()
        };
        if let Some(handle) = handle {
            let _ = handle.send(RoomMsg::AclChanged { acl }).await;
        }
    }

    /// Destroy rooms that are empty, clean and idle for at least the idle
    /// TTL. Holds the registry lock for the duration so creations cannot
    /// interleave with destruction.
    pub async fn sweep(&self) {
        let mut rooms = self.rooms.lock().await;
        let mut retired = Vec::new();
        for (doc_id, handle) in rooms.iter() {
            if handle.is_closed() {
                retired.push(doc_id.clone());
                continue;
            }
            let (reply_tx, reply_rx) = oneshot::channel();
            let msg = RoomMsg::RetireIfIdle {
                ttl: self.config.room_idle_ttl,
                reply: reply_tx,
            };
            // A full inbox means the room is busy, hence not idle.
            if handle.try_send(msg).is_err() {
                continue;
            }
            match reply_rx.await {
                Ok(false) => {}
                Ok(true) | Err(_) => retired.push(doc_id.clone()),
            }
        }
        for doc_id in retired {
            debug!(document_id = %doc_id, "destroying room");
            rooms.remove(&doc_id);
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: watch::Sender<bool>) -> JoinHandle<()> {
        let registry = self.clone();
        let mut shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(registry.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => registry.sweep().await,
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Flush and stop every room. Part of graceful shutdown.
    pub async fn shutdown_all(&self) {
        let handles: Vec<RoomHandle> = {
            let mut rooms = self.rooms.lock().await;
            rooms.drain().map(|(_, handle)| handle).collect()
        };
        info!(rooms = handles.len(), "flushing rooms");
        for handle in handles {
            let (reply_tx, reply_rx) = oneshot::channel();
            if handle.send(RoomMsg::Shutdown { reply: reply_tx }).await.is_ok() {
                let _ = reply_rx.await;
            }
        }
    }

    /// Whether a live room exists for the document.
    pub async fn has_room(&self, doc_id: &str) -> bool {
        let rooms = self.rooms.lock().await;
        rooms.get(doc_id).is_some_and(|h| !h.is_closed())
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }
}
