//! Messages exchanged on a database's pub/sub topic.

use serde::{Deserialize, Serialize};
use weft_types::{DbAddress, EntryId};

use crate::error::LogDbError;

/// A message on `<root>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbMessage {
    /// The sender's current heads. Receivers fetch whatever they lack.
    Heads {
        /// Database the heads belong to.
        address: DbAddress,
        /// Head entry ids.
        heads: Vec<EntryId>,
    },
}

impl DbMessage {
    /// Serialize with postcard.
    pub fn encode(&self) -> Result<Vec<u8>, LogDbError> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Deserialize from postcard bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, LogDbError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}
