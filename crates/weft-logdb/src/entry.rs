//! Signed log entries.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use weft_types::{EntryId, NodeId};

use crate::error::LogDbError;

type Result<T> = std::result::Result<T, LogDbError>;

/// A single entry in a database's causal DAG.
///
/// Entries are immutable and content addressed: the entry id is the BLAKE3
/// hash of the postcard encoding, which is also the id of the block the
/// entry is stored in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Name of the database this entry belongs to.
    pub db: String,
    /// The mutation being recorded.
    pub op: Operation,
    /// Entries this one causally follows. Sorted and deduplicated.
    pub predecessors: Vec<EntryId>,
    /// Lamport clock: `1 + max(predecessor clocks)`, or 1 for a root.
    pub clock: u64,
    /// Public key of the writer.
    pub author: NodeId,
    /// ed25519 signature over [`LogEntry::signing_hash`], split in two
    /// halves because serde does not derive for `[u8; 64]`.
    pub signature_r: [u8; 32],
    pub signature_s: [u8; 32],
}

/// A database mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Set `key` to `value`.
    Put {
        /// Key.
        key: String,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Remove `key`.
    Delete {
        /// Key.
        key: String,
    },
}

impl Operation {
    /// The key this operation touches.
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }

    /// The value written, `None` for a delete.
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Self::Put { value, .. } => Some(value),
            Self::Delete { .. } => None,
        }
    }
}

/// Signed content of a [`LogEntry`] (everything but the signature).
#[derive(Serialize)]
struct SignedContent<'a> {
    db: &'a str,
    op: &'a Operation,
    predecessors: &'a [EntryId],
    clock: u64,
    author: NodeId,
}

impl LogEntry {
    /// Hash that the author signs.
    pub fn signing_hash(
        db: &str,
        op: &Operation,
        predecessors: &[EntryId],
        clock: u64,
        author: NodeId,
    ) -> Result<[u8; 32]> {
        let content = SignedContent {
            db,
            op,
            predecessors,
            clock,
            author,
        };
        let bytes = postcard::to_allocvec(&content)?;
        Ok(blake3::hash(&bytes).into())
    }

    /// Create and sign an entry. Predecessors are sorted and deduplicated
    /// before signing.
    pub fn new_signed(
        db: &str,
        op: Operation,
        mut predecessors: Vec<EntryId>,
        clock: u64,
        signing_key: &SigningKey,
    ) -> Result<Self> {
        predecessors.sort_unstable();
        predecessors.dedup();
        let author = NodeId::from(signing_key.verifying_key().to_bytes());

        let hash = Self::signing_hash(db, &op, &predecessors, clock, author)?;
        let sig_bytes = signing_key.sign(&hash).to_bytes();
        let mut signature_r = [0u8; 32];
        let mut signature_s = [0u8; 32];
        signature_r.copy_from_slice(&sig_bytes[..32]);
        signature_s.copy_from_slice(&sig_bytes[32..]);

        Ok(Self {
            db: db.to_string(),
            op,
            predecessors,
            clock,
            author,
            signature_r,
            signature_s,
        })
    }

    /// Reconstruct the 64-byte signature from its two halves.
    pub fn signature_bytes(&self) -> [u8; 64] {
        let mut sig = [0u8; 64];
        sig[..32].copy_from_slice(&self.signature_r);
        sig[32..].copy_from_slice(&self.signature_s);
        sig
    }

    /// Check the signature against `author`.
    ///
    /// Returns `false` for an invalid key, a signature mismatch or content
    /// that cannot be hashed.
    pub fn verify_signature(&self) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(self.author.as_bytes()) else {
            return false;
        };
        let Ok(hash) = Self::signing_hash(
            &self.db,
            &self.op,
            &self.predecessors,
            self.clock,
            self.author,
        ) else {
            return false;
        };
        let signature = Signature::from_bytes(&self.signature_bytes());
        verifying_key.verify(&hash, &signature).is_ok()
    }

    /// Block encoding of this entry.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode an entry from its block bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }

    /// Content id of this entry.
    pub fn id(&self) -> Result<EntryId> {
        Ok(EntryId::from_data(&self.encode()?))
    }
}
