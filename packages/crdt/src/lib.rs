//! Opaque CRDT replica for collaborative documents.
//!
//! A [`Replica`] is the authoritative merged state a room holds for one
//! document. Clients ship Yjs-compatible binary updates; the replica merges
//! them without interpreting their contents. Only three operations matter to
//! callers: `state_vector`, `diff`, and `merge`.

use std::sync::{Arc, Mutex};

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Subscription, Transact, Update};

/// Errors that can occur while merging or decoding CRDT data.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("malformed update: {0}")]
    MalformedUpdate(String),

    #[error("malformed state vector: {0}")]
    MalformedStateVector(String),
}

/// Result of merging an update into a replica.
#[derive(Debug)]
pub struct MergeOutcome {
    /// The subset of the update that was new to this replica, re-encoded.
    /// `None` when the update was fully redundant.
    pub effective: Option<Vec<u8>>,
}

impl MergeOutcome {
    pub fn is_redundant(&self) -> bool {
        self.effective.is_none()
    }
}

/// A merged CRDT replica for a single document.
///
/// Merge is commutative, associative and idempotent; two replicas that have
/// observed the same set of operations report equal state vectors regardless
/// of merge order.
pub struct Replica {
    doc: Doc,
    /// Diff actually applied by the last transaction. The update observer
    /// sees deletions too, which state vectors alone do not cover.
    applied: Arc<Mutex<Option<Vec<u8>>>>,
    _update_sub: Subscription,
}

impl Replica {
    /// Create an empty replica.
    pub fn new() -> Self {
        let doc = Doc::new();
        let applied = Arc::new(Mutex::new(None));
        let sink = applied.clone();
        let sub = doc
            .observe_update_v1(move |_txn, event| {
                *sink.lock().expect("update sink poisoned") = Some(event.update.clone());
            })
            .expect("fresh doc accepts an update observer");
        Self {
            doc,
            applied,
            _update_sub: sub,
        }
    }

    /// Reconstruct a replica from previously encoded state.
    pub fn decode(state: &[u8]) -> Result<Self, MergeError> {
        let replica = Self::new();
        let update = Update::decode_v1(state)
            .map_err(|e| MergeError::MalformedUpdate(e.to_string()))?;
        {
            let mut txn = replica.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| MergeError::MalformedUpdate(e.to_string()))?;
        }
        Ok(replica)
    }

    /// Encode the full state as a single update.
    ///
    /// Applying the result to an empty replica reproduces this replica's
    /// history. State bytes are not canonical; compare state vectors instead.
    pub fn encode(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// The compact summary of operations this replica has observed.
    pub fn state_vector(&self) -> StateVector {
        let txn = self.doc.transact();
        txn.state_vector()
    }

    /// Wire encoding of the state vector.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.state_vector().encode_v1()
    }

    /// Encode every operation not summarized by `remote`.
    pub fn diff(&self, remote: &[u8]) -> Result<Vec<u8>, MergeError> {
        let sv = StateVector::decode_v1(remote)
            .map_err(|e| MergeError::MalformedStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Merge a binary update into this replica.
    ///
    /// All-or-nothing: a malformed update leaves the replica untouched.
    /// Zero-length input is malformed by definition. The outcome carries the
    /// diff the transaction actually applied; a fully redundant update
    /// produces no transaction event and merges to `effective: None`.
    pub fn merge(&mut self, update: &[u8]) -> Result<MergeOutcome, MergeError> {
        if update.is_empty() {
            return Err(MergeError::MalformedUpdate("empty update".into()));
        }
        let decoded = Update::decode_v1(update)
            .map_err(|e| MergeError::MalformedUpdate(e.to_string()))?;

        self.applied.lock().expect("update sink poisoned").take();
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| MergeError::MalformedUpdate(e.to_string()))?;
        }
        let effective = self.applied.lock().expect("update sink poisoned").take();
        Ok(MergeOutcome { effective })
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

/// True when `observed` summarizes every operation in `other`.
pub fn covers(observed: &StateVector, other: &StateVector) -> bool {
    other.iter().all(|(client, clock)| observed.get(client) >= *clock)
}

/// Decode a wire-encoded state vector.
pub fn decode_state_vector(bytes: &[u8]) -> Result<StateVector, MergeError> {
    StateVector::decode_v1(bytes).map_err(|e| MergeError::MalformedStateVector(e.to_string()))
}
