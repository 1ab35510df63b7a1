use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Document-level grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
}

impl Permission {
    pub fn can_write(self) -> bool {
        self == Permission::Write
    }
}

/// Direct grants, principal id to permission. Owner and public-read grants
/// are implicit and never stored here.
pub type Acl = BTreeMap<String, Permission>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub doc_id: String,
    pub title: String,
    pub owner_id: String,
    pub public: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentMeta {
    pub fn new(doc_id: impl Into<String>, title: impl Into<String>, owner_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            doc_id: doc_id.into(),
            title: title.into(),
            owner_id: owner_id.into(),
            public: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Latest persisted CRDT state alongside its state vector.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedState {
    pub state_bytes: Vec<u8>,
    pub state_vector: Vec<u8>,
}

/// Everything the store holds for one document.
#[derive(Debug, Clone)]
pub struct DurableRecord {
    pub meta: DocumentMeta,
    pub acl: Acl,
    pub state: Option<PersistedState>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotInfo {
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub size: u64,
}

/// The stronger of a principal's direct ACL entry and the implicit grants:
/// the owner always writes, public documents grant read to everyone.
/// `None` means no access at all.
pub fn effective_permission(
    meta: &DocumentMeta,
    acl: &Acl,
    principal_id: &str,
) -> Option<Permission> {
    if meta.owner_id == principal_id {
        return Some(Permission::Write);
    }
    let direct = acl.get(principal_id).copied();
    let implicit = meta.public.then_some(Permission::Read);
    match (direct, implicit) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}
