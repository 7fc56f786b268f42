//! Opaque identifier generation.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generates a fresh opaque identifier for any entity (requests, payments,
/// sessions, ...).
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Produces a synthetic, 64-hex-char "transaction hash" for a [`Payment`]
/// row that must be recorded before chain submission actually happened (e.g.
/// an executor failure prior to submit). This preserves the uniqueness
/// invariant on `Payment::tx_hash` without being confused for a real chain
/// signature: callers MUST pair it with a `PAYMENT:failed` ledger entry so
/// readers can tell the two apart.
///
/// [`Payment`]: crate::models::Payment
pub fn synthetic_tx_hash() -> String {
    let mut hasher = Sha256::new();
    hasher.update(Uuid::new_v4().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn synthetic_hash_looks_like_a_real_signature() {
        let hash = synthetic_tx_hash();
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(new_id(), new_id());
    }
}
