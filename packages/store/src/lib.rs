//! Durable storage for document metadata, ACLs and CRDT state.
//!
//! Rooms are the only writers of a document's state and already serialize
//! per document; the store still guards against interleaved partial writes
//! with a per-document lock. Writes are durable before returning.

use async_trait::async_trait;

mod fs;
mod mem;
mod types;

pub use fs::{valid_doc_id, FsStore};
pub use mem::MemStore;
pub use types::{effective_permission, Acl, DocumentMeta, DurableRecord, Permission, PersistedState, SnapshotInfo};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document not found")]
    NotFound,

    #[error("write conflict")]
    Conflict,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Durable store of per-document records.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load a document's metadata, ACL and latest persisted state.
    async fn load(&self, doc_id: &str) -> Result<DurableRecord, StoreError>;

    /// Atomically overwrite the latest state. The previous latest is rolled
    /// into an implicit snapshot when the age policy triggers.
    async fn save_state(
        &self,
        doc_id: &str,
        state: &[u8],
        state_vector: &[u8],
    ) -> Result<(), StoreError>;

    /// Overwrite metadata and ACL.
    async fn save_metadata(
        &self,
        doc_id: &str,
        meta: &DocumentMeta,
        acl: &Acl,
    ) -> Result<(), StoreError>;

    /// Seed a new document. Fails with `Conflict` when the id exists.
    async fn create(&self, meta: &DocumentMeta, acl: &Acl) -> Result<(), StoreError>;

    /// Append an explicit snapshot of the given state.
    async fn snapshot(&self, doc_id: &str, state: &[u8]) -> Result<String, StoreError>;

    /// Snapshots for a document, newest first.
    async fn list_snapshots(&self, doc_id: &str) -> Result<Vec<SnapshotInfo>, StoreError>;
}
