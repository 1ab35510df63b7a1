//! In-memory document store for tests and demo mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::types::{Acl, DocumentMeta, DurableRecord, PersistedState, SnapshotInfo};
use crate::{DocumentStore, StoreError};

#[derive(Clone)]
struct MemDoc {
    meta: DocumentMeta,
    acl: Acl,
    state: Option<PersistedState>,
    snapshots: Vec<SnapshotInfo>,
}

pub struct MemStore {
    docs: Mutex<HashMap<String, MemDoc>>,
    snapshot_seq: AtomicU64,
    fail_saves: AtomicBool,
    keep_snapshots: usize,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            docs: Mutex::new(HashMap::new()),
            snapshot_seq: AtomicU64::new(0),
            fail_saves: AtomicBool::new(false),
            keep_snapshots: 16,
        }
    }

    /// Make subsequent `save_state` calls fail with `Unavailable`. Used to
    /// exercise retry/backoff paths.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn saved_state(&self, doc_id: &str) -> Option<PersistedState> {
        self.docs
            .lock()
            .expect("mem store poisoned")
            .get(doc_id)
            .and_then(|d| d.state.clone())
    }
}

#[async_trait]
impl DocumentStore for MemStore {
    async fn load(&self, doc_id: &str) -> Result<DurableRecord, StoreError> {
        let docs = self.docs.lock().expect("mem store poisoned");
        let doc = docs.get(doc_id).ok_or(StoreError::NotFound)?;
        Ok(DurableRecord {
            meta: doc.meta.clone(),
            acl: doc.acl.clone(),
            state: doc.state.clone(),
        })
    }

    async fn save_state(
        &self,
        doc_id: &str,
        state: &[u8],
        state_vector: &[u8],
    ) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        let mut docs = self.docs.lock().expect("mem store poisoned");
        let doc = docs.get_mut(doc_id).ok_or(StoreError::NotFound)?;
        doc.state = Some(PersistedState {
            state_bytes: state.to_vec(),
            state_vector: state_vector.to_vec(),
        });
        doc.meta.updated_at = Utc::now();
        Ok(())
    }

    async fn save_metadata(
        &self,
        doc_id: &str,
        meta: &DocumentMeta,
        acl: &Acl,
    ) -> Result<(), StoreError> {
        let mut docs = self.docs.lock().expect("mem store poisoned");
        let doc = docs.get_mut(doc_id).ok_or(StoreError::NotFound)?;
        doc.meta = meta.clone();
        doc.acl = acl.clone();
        Ok(())
    }

    async fn create(&self, meta: &DocumentMeta, acl: &Acl) -> Result<(), StoreError> {
        let mut docs = self.docs.lock().expect("mem store poisoned");
        if docs.contains_key(&meta.doc_id) {
            return Err(StoreError::Conflict);
        }
        docs.insert(
            meta.doc_id.clone(),
            MemDoc {
                meta: meta.clone(),
                acl: acl.clone(),
                state: None,
                snapshots: Vec::new(),
            },
        );
        Ok(())
    }

    async fn snapshot(&self, doc_id: &str, state: &[u8]) -> Result<String, StoreError> {
        let mut docs = self.docs.lock().expect("mem store poisoned");
        let doc = docs.get_mut(doc_id).ok_or(StoreError::NotFound)?;
        let seq = self.snapshot_seq.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-{seq:06}", Utc::now().timestamp_millis());
        doc.snapshots.insert(
            0,
            SnapshotInfo {
                snapshot_id: id.clone(),
                created_at: Utc::now(),
                size: state.len() as u64,
            },
        );
        doc.snapshots.truncate(self.keep_snapshots);
        Ok(id)
    }

    async fn list_snapshots(&self, doc_id: &str) -> Result<Vec<SnapshotInfo>, StoreError> {
        let docs = self.docs.lock().expect("mem store poisoned");
        let doc = docs.get(doc_id).ok_or(StoreError::NotFound)?;
        Ok(doc.snapshots.clone())
    }
}
