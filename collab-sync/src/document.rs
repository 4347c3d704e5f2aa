//! The replicated document shared by every component of a session.
//!
//! `ReplicatedDoc` is a thin handle over a yrs [`Doc`]. Cloning the handle
//! shares the same underlying document. Everything that crosses a component
//! boundary is serialized to bytes.

use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Subscription, Transact, Update};

use crate::error::SyncError;

/// Transaction origin tagging updates that came from the network.
const REMOTE_ORIGIN: &str = "collab-sync:remote";

/// Shared handle to the session's CRDT document.
#[derive(Clone)]
pub struct ReplicatedDoc {
    doc: Doc,
}

impl ReplicatedDoc {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Wrap an existing yrs document.
    pub fn from_doc(doc: Doc) -> Self {
        Self { doc }
    }

    /// Access the underlying yrs document for local edits.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Encode the full document state as a single update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the compact state vector.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode the updates a peer with `remote_state_vector` is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, SyncError> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| SyncError::Decode(format!("state vector: {e}")))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Apply an update delta or a full-state snapshot received from the network.
    ///
    /// Updates applied here are not reported to [`observe_local_updates`](Self::observe_local_updates).
    pub fn apply_update(&self, update: &[u8]) -> Result<(), SyncError> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| SyncError::Decode(format!("update: {e}")))?;
        let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
        txn.apply_update(decoded)
            .map_err(|e| SyncError::Document(format!("failed to apply update: {e}")))
    }

    /// Forward every locally produced update to `tx`.
    ///
    /// The observer stays registered for as long as the returned
    /// [`Subscription`] is alive.
    pub fn observe_local_updates(
        &self,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<Subscription, SyncError> {
        let remote = Origin::from(REMOTE_ORIGIN);
        self.doc
            .observe_update_v1(move |txn, event| {
                if txn.origin() == Some(&remote) {
                    return;
                }
                let _ = tx.send(event.update.clone());
            })
            .map_err(|e| SyncError::Document(format!("cannot observe updates: {e:?}")))
    }
}

impl Default for ReplicatedDoc {
    fn default() -> Self {
        Self::new()
    }
}
