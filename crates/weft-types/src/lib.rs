//! Shared types and identifiers for Weft.
//!
//! This crate defines the core types used across the Weft workspace:
//! identifiers ([`NodeId`], [`EntryId`], [`ContentId`]), network addressing
//! ([`ListenAddress`], [`TransportKind`], [`PeerRecord`]), database addressing
//! ([`DbAddress`], [`DbType`]) and the fault taxonomy ([`FaultKind`]) every
//! crate-level error maps onto.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

/// Error returned when a hex identifier cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identifier: {0}")]
pub struct ParseIdError(String);

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create an ID by hashing arbitrary data with BLAKE3.
            pub fn from_data(data: &[u8]) -> Self {
                Self(blake3::hash(data).into())
            }

            /// Return the raw 32-byte representation.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                decode_hex32(s)
                    .map(Self)
                    .ok_or_else(|| ParseIdError(s.to_string()))
            }
        }
    };
}

define_id!(
    /// Identifier for a node: the raw 32-byte ed25519 public key.
    NodeId
);

define_id!(
    /// Identifier for a log entry: `blake3(encoded_entry)`.
    EntryId
);

define_id!(
    /// Content-addressed identifier for a stored block: `blake3(block_bytes)`.
    ContentId
);

// A log entry is persisted as exactly one block, so the two IDs are the same hash.
impl From<EntryId> for ContentId {
    fn from(id: EntryId) -> Self {
        Self(id.0)
    }
}

impl From<ContentId> for EntryId {
    fn from(id: ContentId) -> Self {
        Self(id.0)
    }
}

/// Decode a 64-character hex string into 32 bytes.
fn decode_hex32(s: &str) -> Option<[u8; 32]> {
    let raw = s.as_bytes();
    if raw.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        let hi = (raw[i * 2] as char).to_digit(16)?;
        let lo = (raw[i * 2 + 1] as char).to_digit(16)?;
        *byte = ((hi << 4) | lo) as u8;
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// Network addressing
// ---------------------------------------------------------------------------

/// Transport kinds a node can listen on or be reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Plain TCP.
    Tcp,
    /// WebSocket over TCP.
    WebSocket,
    /// Browser-compatible WebRTC without signalling (`/webrtc-direct`).
    WebRtcDirect,
    /// Circuit relay v2 through a third peer.
    Relay,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Tcp => "tcp",
            Self::WebSocket => "ws",
            Self::WebRtcDirect => "webrtc-direct",
            Self::Relay => "relay",
        };
        f.write_str(s)
    }
}

/// One listen or announce address of a node.
///
/// Rendered through [`fmt::Display`] as a multiaddr string, e.g.
/// `/ip4/10.0.0.5/tcp/4001/p2p/12D3Koo...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenAddress {
    /// Which transport the address belongs to.
    pub transport: TransportKind,
    /// IPv4/IPv6 literal or DNS name.
    pub host: String,
    /// Port (TCP for tcp/ws, UDP for webrtc-direct).
    pub port: u16,
    /// Optional `/p2p/<peer>` suffix.
    pub peer: Option<String>,
}

impl ListenAddress {
    /// Build an address without a peer suffix.
    pub fn new(transport: TransportKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            transport,
            host: host.into(),
            port,
            peer: None,
        }
    }

    /// Attach a `/p2p/<peer>` suffix.
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = Some(peer.into());
        self
    }

    fn host_protocol(&self) -> &'static str {
        if self.host.parse::<std::net::Ipv4Addr>().is_ok() {
            "ip4"
        } else if self.host.parse::<std::net::Ipv6Addr>().is_ok() {
            "ip6"
        } else {
            "dns4"
        }
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.host_protocol(), self.host)?;
        match self.transport {
            TransportKind::Tcp => write!(f, "/tcp/{}", self.port)?,
            TransportKind::WebSocket => write!(f, "/tcp/{}/ws", self.port)?,
            TransportKind::WebRtcDirect => write!(f, "/udp/{}/webrtc-direct", self.port)?,
            TransportKind::Relay => write!(f, "/tcp/{}/p2p-circuit", self.port)?,
        }
        if let Some(peer) = &self.peer {
            write!(f, "/p2p/{peer}")?;
        }
        Ok(())
    }
}

/// What the discovery layer knows about a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Peer ID string (base58).
    pub peer_id: String,
    /// Known multiaddrs for the peer.
    pub addresses: BTreeSet<String>,
    /// Unix timestamp (seconds) the peer was last seen by any discovery source.
    pub last_seen: u64,
    /// Agent version reported via identify, if any.
    pub agent_version: Option<String>,
}

impl PeerRecord {
    /// Create a record on first contact.
    pub fn new(peer_id: impl Into<String>, now: u64) -> Self {
        Self {
            peer_id: peer_id.into(),
            addresses: BTreeSet::new(),
            last_seen: now,
            agent_version: None,
        }
    }

    /// Merge newly discovered addresses and bump `last_seen`.
    ///
    /// Returns `true` if any address was new.
    pub fn refresh<I, S>(&mut self, addresses: I, now: u64) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.last_seen = self.last_seen.max(now);
        let before = self.addresses.len();
        self.addresses.extend(addresses.into_iter().map(Into::into));
        self.addresses.len() != before
    }

    /// Whether the record has not been refreshed for `ttl_secs`.
    pub fn is_stale(&self, now: u64, ttl_secs: u64) -> bool {
        now.saturating_sub(self.last_seen) > ttl_secs
    }
}

// ---------------------------------------------------------------------------
// Database addressing
// ---------------------------------------------------------------------------

/// Stable address of a replicated database: `<root>/<name>`.
///
/// Nodes that open the same address join the same replicated log. The
/// address string doubles as the pub/sub topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DbAddress {
    /// Storage namespace root, e.g. `/weft`.
    pub root: String,
    /// Database name.
    pub name: String,
}

impl DbAddress {
    /// Build an address, trimming a trailing `/` from the root.
    pub fn new(root: impl Into<String>, name: impl Into<String>) -> Self {
        let root = root.into();
        Self {
            root: root.trim_end_matches('/').to_string(),
            name: name.into(),
        }
    }

    /// Pub/sub topic that carries head announcements for this database.
    pub fn topic(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DbAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.root, self.name)
    }
}

impl FromStr for DbAddress {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('/') {
            Some((root, name)) if !name.is_empty() => Ok(Self::new(root, name)),
            _ => Err(ParseIdError(s.to_string())),
        }
    }
}

/// Variant of the replicated log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    /// Append-only event log. Deletes are not supported.
    #[default]
    Events,
    /// Key-value store with deletes.
    KeyValue,
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Events => f.write_str("events"),
            Self::KeyValue => f.write_str("keyvalue"),
        }
    }
}

impl FromStr for DbType {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "events" | "eventlog" | "log" => Ok(Self::Events),
            "keyvalue" | "kv" | "keyvalues" => Ok(Self::KeyValue),
            _ => Err(ParseIdError(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Faults
// ---------------------------------------------------------------------------

/// Coarse fault classes shared by every crate-level error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Identity or storage I/O failure, including corrupt files.
    Io,
    /// Key generation failed.
    KeyGen,
    /// A single dial attempt failed. Recoverable.
    Dial,
    /// A bounded wait expired.
    Timeout,
    /// Access policy violation on database open or write.
    Access,
    /// A malformed or unverifiable remote entry.
    Merge,
    /// Invalid or missing configuration.
    Config,
    /// Anything else (closed channels, codec failures).
    Internal,
}

impl FaultKind {
    /// Faults that callers are expected to retry or ignore.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Dial | Self::Timeout | Self::Merge)
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Io => "IOFault",
            Self::KeyGen => "KeyGenFault",
            Self::Dial => "DialFault",
            Self::Timeout => "TimeoutFault",
            Self::Access => "AccessFault",
            Self::Merge => "MergeFault",
            Self::Config => "ConfigFault",
            Self::Internal => "InternalFault",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
