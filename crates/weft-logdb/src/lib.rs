//! Replicated, eventually consistent log database.
//!
//! Every write is a signed [`LogEntry`] stored as one block in the
//! content-addressed store and linked to the entries it follows, forming a
//! causal DAG. Replicas announce their heads over pub/sub and pull whatever
//! they are missing through block exchange.
//!
//! Conflicts resolve last-writer-wins: for each key the entry with the
//! highest `(clock, id)` among allow-listed authors wins, where `clock` is a
//! Lamport clock. Any two replicas that know the same entries show the same
//! values, whatever order the entries arrived in.

mod access;
mod database;
mod entry;
mod error;
mod message;
mod replica;
mod replicator;
mod store;

#[cfg(test)]
mod tests;

pub use access::{ANY_WRITER, AccessPolicy};
pub use database::{Database, DbState, DbUpdate, OpenOptions};
pub use entry::{LogEntry, Operation};
pub use error::LogDbError;
pub use message::DbMessage;
pub use replica::{Inserted, MergeReport, ReplicaState, Winner};
pub use replicator::{FetchRetry, MAX_WALK};
pub use store::HeadsFile;
