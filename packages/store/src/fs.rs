//! Filesystem-backed document store.
//!
//! Layout: one directory per document under the root.
//!
//! ```text
//! <root>/<doc_id>/meta.json      metadata + ACL
//! <root>/<doc_id>/state.bin      latest merged CRDT state
//! <root>/<doc_id>/state.vector   state vector of state.bin
//! <root>/<doc_id>/snapshots/     append-only snapshot history
//! ```
//!
//! Every write lands in a temp file and is renamed into place after fsync,
//! so readers never observe a partial write.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::types::{Acl, DocumentMeta, DurableRecord, PersistedState, SnapshotInfo};
use crate::{DocumentStore, StoreError};

const META_FILE: &str = "meta.json";
const STATE_FILE: &str = "state.bin";
const VECTOR_FILE: &str = "state.vector";
const SNAPSHOT_DIR: &str = "snapshots";

/// Document ids double as directory names; keep them path-safe.
pub fn valid_doc_id(doc_id: &str) -> bool {
    !doc_id.is_empty()
        && doc_id.len() <= 128
        && doc_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[derive(Serialize, Deserialize)]
struct MetaFile {
    meta: DocumentMeta,
    acl: Acl,
}

pub struct FsStore {
    root: PathBuf,
    keep_snapshots: usize,
    implicit_snapshot_age: Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    snapshot_seq: AtomicU64,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_policy(root, 16, Duration::from_secs(300))
    }

    /// `keep_snapshots` bounds retention; `implicit_snapshot_age` is how old
    /// the newest snapshot may get before `save_state` rolls the previous
    /// latest state into a new one.
    pub fn with_policy(
        root: impl Into<PathBuf>,
        keep_snapshots: usize,
        implicit_snapshot_age: Duration,
    ) -> Self {
        Self {
            root: root.into(),
            keep_snapshots,
            implicit_snapshot_age,
            locks: Mutex::new(HashMap::new()),
            snapshot_seq: AtomicU64::new(0),
        }
    }

    fn doc_dir(&self, doc_id: &str) -> Result<PathBuf, StoreError> {
        if !valid_doc_id(doc_id) {
            return Err(StoreError::NotFound);
        }
        Ok(self.root.join(doc_id))
    }

    fn doc_lock(&self, doc_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        locks
            .entry(doc_id.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn next_snapshot_id(&self) -> String {
        let seq = self.snapshot_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{seq:06}", Utc::now().timestamp_millis())
    }

    async fn read_meta(&self, dir: &Path) -> Result<MetaFile, StoreError> {
        let bytes = match fs::read(dir.join(META_FILE)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::NotFound),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Unavailable(format!("corrupt metadata: {e}")))
    }

    async fn write_meta(&self, dir: &Path, file: &MetaFile) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(file)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        write_atomic(&dir.join(META_FILE), &bytes).await
    }

    /// Snapshot entries sorted newest first.
    async fn snapshot_entries(&self, dir: &Path) -> Result<Vec<(String, PathBuf)>, StoreError> {
        let snap_dir = dir.join(SNAPSHOT_DIR);
        let mut entries = Vec::new();
        let mut reader = match fs::read_dir(&snap_dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = reader.next_entry().await? {
            let path = entry.path();
            if let Some(id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".bin"))
            {
                entries.push((id.to_owned(), path));
            }
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries)
    }

    async fn prune_snapshots(&self, dir: &Path) -> Result<(), StoreError> {
        let entries = self.snapshot_entries(dir).await?;
        for (id, path) in entries.into_iter().skip(self.keep_snapshots) {
            debug!(snapshot_id = %id, "pruning snapshot");
            fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn write_snapshot(&self, dir: &Path, state: &[u8]) -> Result<String, StoreError> {
        let snap_dir = dir.join(SNAPSHOT_DIR);
        fs::create_dir_all(&snap_dir).await?;
        let id = self.next_snapshot_id();
        write_atomic(&snap_dir.join(format!("{id}.bin")), state).await?;
        self.prune_snapshots(dir).await?;
        Ok(id)
    }

    /// Roll the current latest state into a snapshot if the newest snapshot
    /// has aged past the implicit-snapshot threshold.
    async fn maybe_roll_previous(&self, dir: &Path) -> Result<(), StoreError> {
        let state_path = dir.join(STATE_FILE);
        if !fs::try_exists(&state_path).await? {
            return Ok(());
        }
        let newest_ms = self
            .snapshot_entries(dir)
            .await?
            .first()
            .and_then(|(id, _)| snapshot_timestamp(id).map(|t| t.timestamp_millis()));
        let stale = match newest_ms {
            None => true,
            Some(ms) => {
                Utc::now().timestamp_millis() - ms >= self.implicit_snapshot_age.as_millis() as i64
            }
        };
        if stale {
            let previous = fs::read(&state_path).await?;
            self.write_snapshot(dir, &previous).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FsStore {
    async fn load(&self, doc_id: &str) -> Result<DurableRecord, StoreError> {
        let dir = self.doc_dir(doc_id)?;
        let MetaFile { meta, acl } = self.read_meta(&dir).await?;
        let state = match fs::read(dir.join(STATE_FILE)).await {
            Ok(state_bytes) => {
                let state_vector = match fs::read(dir.join(VECTOR_FILE)).await {
                    Ok(v) => v,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
                    Err(e) => return Err(e.into()),
                };
                Some(PersistedState {
                    state_bytes,
                    state_vector,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(DurableRecord { meta, acl, state })
    }

    async fn save_state(
        &self,
        doc_id: &str,
        state: &[u8],
        state_vector: &[u8],
    ) -> Result<(), StoreError> {
        let dir = self.doc_dir(doc_id)?;
        let lock = self.doc_lock(doc_id);
        let _guard = lock.lock().await;

        let mut meta_file = self.read_meta(&dir).await?;
        self.maybe_roll_previous(&dir).await?;
        write_atomic(&dir.join(STATE_FILE), state).await?;
        write_atomic(&dir.join(VECTOR_FILE), state_vector).await?;
        meta_file.meta.updated_at = Utc::now();
        self.write_meta(&dir, &meta_file).await?;
        Ok(())
    }

    async fn save_metadata(
        &self,
        doc_id: &str,
        meta: &DocumentMeta,
        acl: &Acl,
    ) -> Result<(), StoreError> {
        let dir = self.doc_dir(doc_id)?;
        let lock = self.doc_lock(doc_id);
        let _guard = lock.lock().await;

        // Confirm the document exists before overwriting.
        self.read_meta(&dir).await?;
        self.write_meta(
            &dir,
            &MetaFile {
                meta: meta.clone(),
                acl: acl.clone(),
            },
        )
        .await
    }

    async fn create(&self, meta: &DocumentMeta, acl: &Acl) -> Result<(), StoreError> {
        let dir = self.doc_dir(&meta.doc_id)?;
        let lock = self.doc_lock(&meta.doc_id);
        let _guard = lock.lock().await;

        if fs::try_exists(dir.join(META_FILE)).await? {
            return Err(StoreError::Conflict);
        }
        fs::create_dir_all(&dir).await?;
        self.write_meta(
            &dir,
            &MetaFile {
                meta: meta.clone(),
                acl: acl.clone(),
            },
        )
        .await
    }

    async fn snapshot(&self, doc_id: &str, state: &[u8]) -> Result<String, StoreError> {
        let dir = self.doc_dir(doc_id)?;
        let lock = self.doc_lock(doc_id);
        let _guard = lock.lock().await;

        self.read_meta(&dir).await?;
        self.write_snapshot(&dir, state).await
    }

    async fn list_snapshots(&self, doc_id: &str) -> Result<Vec<SnapshotInfo>, StoreError> {
        let dir = self.doc_dir(doc_id)?;
        self.read_meta(&dir).await?;
        let mut infos = Vec::new();
        for (id, path) in self.snapshot_entries(&dir).await? {
            let size = fs::metadata(&path).await?.len();
            let created_at = snapshot_timestamp(&id).unwrap_or_else(Utc::now);
            infos.push(SnapshotInfo {
                snapshot_id: id,
                created_at,
                size,
            });
        }
        Ok(infos)
    }
}

fn snapshot_timestamp(id: &str) -> Option<DateTime<Utc>> {
    let millis: i64 = id.split('-').next()?.parse().ok()?;
    DateTime::<Utc>::from_timestamp_millis(millis)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    Ok(())
}
