//! Networking for weft nodes, on libp2p.
//!
//! - [`NodeIdentity`]: the durable ed25519 identity.
//! - [`NetworkService`] / [`NetworkHandle`]: one swarm task speaking TCP,
//!   WebSocket, WebRTC-direct and circuit relay, with AutoNAT, DCUtR and UPnP.
//! - [`Discovery`]: bootstrap dialing, Kademlia random walks and reconnects.
//! - [`PubSub`]: gossipsub topics with bounded local fan-out.
//! - Block exchange over `/weft/blocks/1.0.0` with integrity checks.
//! - DHT record validation ([`Validators`]).
//!
//! The database layer only sees the [`Broadcast`] and [`BlockExchange`]
//! traits, so tests can run it over an in-memory network.

mod behaviour;
mod config;
mod discovery;
mod error;
mod identity;
mod message;
mod protocol;
mod pubsub;
mod records;
mod service;

use bytes::Bytes;
use weft_types::ContentId;

pub use behaviour::{IDENTIFY_PROTOCOL, KAD_PROTOCOL, WeftBehaviour, agent_version};
pub use config::{DEFAULT_BOOTSTRAP, NetConfig};
pub use discovery::{Discovery, PeerReconnector};
pub use error::NetError;
pub use identity::{NodeIdentity, node_id_of, peer_id_of};
pub use libp2p::{Multiaddr, PeerId};
pub use message::{BlockRequest, BlockResponse};
pub use protocol::{BLOCK_PROTOCOL, BlockCodec, MAX_MESSAGE_SIZE};
pub use pubsub::{PubSub, PubsubEvent, PubsubLimits, Subscription, TopicRegistry};
pub use records::{
    InvalidRecord, RecordValidator, SignedRecord, SignedRecordValidator, Validators,
    WEFT_NAMESPACE, address_key,
};
pub use service::{NetworkEvent, NetworkHandle, NetworkService, ProviderStream, peer_of};

/// Topic publish/subscribe.
#[async_trait::async_trait]
pub trait Broadcast: Send + Sync {
    /// Publish `data` on `topic`. Succeeds even if nobody is subscribed.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), NetError>;

    /// Subscribe to `topic`.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, NetError>;

    /// Drop the local subscriptions of `topic`.
    async fn unsubscribe(&self, topic: &str) -> Result<(), NetError>;
}

/// Fetching and announcing content-addressed blocks.
#[async_trait::async_trait]
pub trait BlockExchange: Send + Sync {
    /// Fetch a block, asking `hint` first. `Ok(None)` if no peer had it.
    ///
    /// Returned bytes always hash to `id`.
    async fn fetch(&self, id: ContentId, hint: Option<PeerId>) -> Result<Option<Bytes>, NetError>;

    /// Announce that this node can serve `id`.
    async fn provide(&self, id: ContentId) -> Result<(), NetError>;
}

#[async_trait::async_trait]
impl Broadcast for NetworkHandle {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), NetError> {
        NetworkHandle::publish(self, topic, data).await
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, NetError> {
        NetworkHandle::subscribe(self, topic).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), NetError> {
        NetworkHandle::unsubscribe(self, topic).await
    }
}

#[async_trait::async_trait]
impl BlockExchange for NetworkHandle {
    async fn fetch(&self, id: ContentId, hint: Option<PeerId>) -> Result<Option<Bytes>, NetError> {
        self.fetch_block(id, hint).await
    }

    async fn provide(&self, id: ContentId) -> Result<(), NetError> {
        NetworkHandle::provide(self, id).await
    }
}
