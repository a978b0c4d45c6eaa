//! Composite libp2p behaviour and swarm construction.

use std::time::Duration;

use libp2p::core::muxing::StreamMuxerBox;
use libp2p::identity::Keypair;
use libp2p::kad::store::MemoryStore;
use libp2p::request_response::{self, ProtocolSupport};
use libp2p::swarm::NetworkBehaviour;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::{
    StreamProtocol, Swarm, SwarmBuilder, autonat, dcutr, gossipsub, identify, kad, mdns, noise,
    ping, relay, tcp, upnp, yamux,
};
use libp2p::Transport as _;
use tracing::info;

use crate::config::NetConfig;
use crate::error::NetError;
use crate::identity::NodeIdentity;
use crate::protocol::{BLOCK_PROTOCOL, BlockCodec};

/// Kademlia protocol name.
pub const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/weft/kad/1.0.0");

/// Identify protocol version string.
pub const IDENTIFY_PROTOCOL: &str = "/weft/id/1.0.0";

/// Agent version advertised over identify.
pub fn agent_version() -> String {
    format!("weft/{}", env!("CARGO_PKG_VERSION"))
}

/// The swarm type every weft node runs.
pub type WeftSwarm = Swarm<WeftBehaviour>;

/// Everything a weft node speaks.
#[derive(NetworkBehaviour)]
pub struct WeftBehaviour {
    /// Reserve slots on and dial through circuit relays.
    pub relay_client: relay::client::Behaviour,
    /// Serve as a circuit relay for others.
    pub relay_server: Toggle<relay::Behaviour>,
    /// Upgrade relayed connections to direct ones.
    pub dcutr: dcutr::Behaviour,
    /// Learn whether we are publicly reachable.
    pub autonat: autonat::Behaviour,
    /// Ask the local gateway for a port mapping.
    pub upnp: Toggle<upnp::tokio::Behaviour>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    /// Routing, providers and records.
    pub kad: kad::Behaviour<MemoryStore>,
    /// LAN discovery.
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub gossipsub: gossipsub::Behaviour,
    /// Block exchange.
    pub blocks: request_response::Behaviour<BlockCodec>,
}

impl WeftBehaviour {
    fn new(
        key: &Keypair,
        relay_client: relay::client::Behaviour,
        config: &NetConfig,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let peer_id = key.public().to_peer_id();

        let relay_server = config
            .relay_server
            .then(|| relay::Behaviour::new(peer_id, relay::Config::default()));

        let upnp = config.upnp.then(upnp::tokio::Behaviour::default);

        let mdns = if config.mdns {
            Some(mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)?)
        } else {
            None
        };

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL.to_string(), key.public())
                .with_agent_version(agent_version()),
        );

        let mut kad_config = kad::Config::new(KAD_PROTOCOL);
        kad_config.set_query_timeout(config.lookup_timeout);
        kad_config.set_record_filtering(kad::StoreInserts::FilterBoth);
        let mut kad = kad::Behaviour::with_config(peer_id, MemoryStore::new(peer_id), kad_config);
        kad.set_mode(Some(kad::Mode::Server));

        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .heartbeat_interval(Duration::from_secs(1))
            .validation_mode(gossipsub::ValidationMode::Strict)
            .max_transmit_size(crate::protocol::MAX_MESSAGE_SIZE)
            .build()
            .map_err(|e| e.to_string())?;
        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(key.clone()),
            gossipsub_config,
        )?;

        let blocks = request_response::Behaviour::new(
            [(BLOCK_PROTOCOL, ProtocolSupport::Full)],
            request_response::Config::default().with_request_timeout(config.dial_timeout * 3),
        );

        Ok(Self {
            relay_client,
            relay_server: relay_server.into(),
            dcutr: dcutr::Behaviour::new(peer_id),
            autonat: autonat::Behaviour::new(peer_id, autonat::Config::default()),
            upnp: upnp.into(),
            identify,
            ping: ping::Behaviour::new(ping::Config::new()),
            kad,
            mdns: mdns.into(),
            gossipsub,
            blocks,
        })
    }
}

/// Assemble the transport stack and behaviour into a swarm.
///
/// Every transport is always built; `config` decides which ones listen.
pub async fn build_swarm(identity: &NodeIdentity, config: &NetConfig) -> Result<WeftSwarm, NetError> {
    let transport_err = |e: &dyn std::fmt::Display| NetError::Transport(e.to_string());
    let behaviour_config = config.clone();

    let swarm = SwarmBuilder::with_existing_identity(identity.keypair())
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| transport_err(&e))?
        .with_other_transport(|key| -> Result<_, Box<dyn std::error::Error + Send + Sync>> {
            let certificate =
                libp2p_webrtc::tokio::Certificate::generate(&mut rand::thread_rng())?;
            Ok(libp2p_webrtc::tokio::Transport::new(key.clone(), certificate)
                .map(|(peer_id, conn), _| (peer_id, StreamMuxerBox::new(conn))))
        })
        .map_err(|e| transport_err(&e))?
        .with_dns()
        .map_err(|e| transport_err(&e))?
        .with_websocket(noise::Config::new, yamux::Config::default)
        .await
        .map_err(|e| transport_err(&e))?
        .with_relay_client(noise::Config::new, yamux::Config::default)
        .map_err(|e| transport_err(&e))?
        .with_behaviour(|key, relay_client| WeftBehaviour::new(key, relay_client, &behaviour_config))
        .map_err(|e| transport_err(&e))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(config.idle_timeout))
        .build();

    info!(peer_id = %swarm.local_peer_id(), "swarm built");
    Ok(swarm)
}
