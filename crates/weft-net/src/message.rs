//! Block exchange messages.
//!
//! Serialized with postcard over a request-response stream.

use serde::{Deserialize, Serialize};
use weft_types::ContentId;

/// A request for a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockRequest {
    /// Fetch the block with this content id.
    Get(ContentId),
}

/// Response to a [`BlockRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockResponse {
    /// The block bytes. The requester verifies them against the id.
    Found(Vec<u8>),
    /// The responder does not hold the block.
    NotFound,
}
