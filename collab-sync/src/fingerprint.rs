//! State fingerprints for cheap divergence checks.
//!
//! A fingerprint is the base64-encoded SHA-256 digest of a document's encoded
//! state vector. Two copies that have seen the same edits produce the same
//! fingerprint, so the server can announce its fingerprint and the client can
//! tell whether it is behind without exchanging document contents.

use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha256};

use crate::document::ReplicatedDoc;

/// Fingerprint of the document's current state.
pub fn fingerprint(doc: &ReplicatedDoc) -> String {
    fingerprint_state_vector(&doc.encode_state_vector())
}

/// Fingerprint of already-encoded state-vector bytes.
pub fn fingerprint_state_vector(state_vector: &[u8]) -> String {
    let digest = Sha256::digest(state_vector);
    STANDARD.encode(digest)
}
