//! Write access policy.

use std::collections::HashSet;
use std::str::FromStr;

use weft_net::{PeerId, node_id_of};
use weft_types::NodeId;

use crate::error::LogDbError;

/// Allow-list entry that admits every writer.
pub const ANY_WRITER: &str = "*";

/// Who may write to a database.
///
/// Fixed when the database is opened. Entries by other authors are still
/// stored and replicated but never show up in reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPolicy {
    write: Vec<String>,
    any: bool,
    writers: HashSet<NodeId>,
}

impl AccessPolicy {
    /// Build a policy from `*` and peer id strings.
    ///
    /// Hex-encoded node ids are accepted as well. Anything else is rejected.
    pub fn new<I, S>(write: I) -> Result<Self, LogDbError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let write: Vec<String> = write.into_iter().map(Into::into).collect();
        let mut any = false;
        let mut writers = HashSet::new();

        for entry in &write {
            let entry = entry.trim();
            if entry == ANY_WRITER {
                any = true;
            } else if let Ok(node) = NodeId::from_str(entry) {
                writers.insert(node);
            } else if let Ok(peer) = PeerId::from_str(entry) {
                let node = node_id_of(&peer).ok_or_else(|| {
                    LogDbError::InvalidPolicy(format!("{entry} is not an ed25519 peer"))
                })?;
                writers.insert(node);
            } else {
                return Err(LogDbError::InvalidPolicy(entry.to_string()));
            }
        }

        Ok(Self { write, any, writers })
    }

    /// A policy admitting every writer.
    pub fn open() -> Self {
        Self {
            write: vec![ANY_WRITER.to_string()],
            any: true,
            writers: HashSet::new(),
        }
    }

    /// Whether entries by `author` are accepted into the view.
    pub fn allows(&self, author: &NodeId) -> bool {
        self.any || self.writers.contains(author)
    }

    /// The allow-list as configured.
    pub fn write_list(&self) -> &[String] {
        &self.write
    }
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self::open()
    }
}
