//! Network configuration.

use std::time::Duration;

use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use tracing::warn;
use weft_types::{ListenAddress, TransportKind};

use crate::error::NetError;

/// Well-known public bootstrap peers.
pub const DEFAULT_BOOTSTRAP: &[&str] = &[
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
];

/// Configuration for the libp2p network service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Interface to bind listeners on.
    pub host_bind: String,
    /// TCP port (also the UDP port for WebRTC-direct). 0 picks a free port.
    pub port: u16,
    /// WebSocket port. Defaults to `port + 1`, or 0 when `port` is 0.
    pub ws_port: Option<u16>,
    /// Listen on plain TCP.
    pub tcp: bool,
    /// Listen on WebSocket.
    pub websocket: bool,
    /// Listen on WebRTC-direct.
    pub webrtc: bool,
    /// Public IPv4 address to announce.
    pub announce_host: Option<String>,
    /// Public DNS name to announce.
    pub announce_domain: Option<String>,
    /// Extra bootstrap multiaddrs.
    pub bootstrap: Vec<String>,
    /// Include [`DEFAULT_BOOTSTRAP`].
    pub default_bootstrap: bool,
    /// Enable mDNS discovery on the local network.
    pub mdns: bool,
    /// Enable UPnP port mapping.
    pub upnp: bool,
    /// Act as a circuit relay for other peers.
    pub relay_server: bool,
    /// Bound for a single dial attempt.
    #[serde(with = "secs")]
    pub dial_timeout: Duration,
    /// Bound for DHT lookups.
    #[serde(with = "secs")]
    pub lookup_timeout: Duration,
    /// Interval between Kademlia random walks.
    #[serde(with = "secs")]
    pub random_walk_interval: Duration,
    /// How long an idle connection is kept open.
    #[serde(with = "secs")]
    pub idle_timeout: Duration,
    /// Maximum concurrent subscribers of the network event stream.
    pub max_event_subscribers: usize,
    /// Maximum local subscribers per pub/sub topic.
    pub max_topic_subscribers: usize,
    /// Queue depth of each pub/sub subscriber.
    pub subscriber_queue: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            host_bind: "0.0.0.0".to_string(),
            port: 0,
            ws_port: None,
            tcp: true,
            websocket: true,
            webrtc: true,
            announce_host: None,
            announce_domain: None,
            bootstrap: Vec::new(),
            default_bootstrap: true,
            mdns: true,
            upnp: true,
            relay_server: true,
            dial_timeout: Duration::from_secs(10),
            lookup_timeout: Duration::from_secs(30),
            random_walk_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            max_event_subscribers: 64,
            max_topic_subscribers: 16,
            subscriber_queue: 256,
        }
    }
}

impl NetConfig {
    /// A configuration for tests: loopback, TCP only, no external discovery.
    pub fn local() -> Self {
        Self {
            host_bind: "127.0.0.1".to_string(),
            websocket: false,
            webrtc: false,
            default_bootstrap: false,
            mdns: false,
            upnp: false,
            relay_server: false,
            dial_timeout: Duration::from_secs(5),
            lookup_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Effective WebSocket port.
    pub fn effective_ws_port(&self) -> u16 {
        match self.ws_port {
            Some(p) => p,
            None if self.port == 0 => 0,
            None => self.port.saturating_add(1),
        }
    }

    /// The listen addresses for every enabled transport.
    pub fn listen_addresses(&self) -> Vec<ListenAddress> {
        let mut out = Vec::new();
        if self.tcp {
            out.push(ListenAddress::new(TransportKind::Tcp, &self.host_bind, self.port));
        }
        if self.websocket {
            out.push(ListenAddress::new(
                TransportKind::WebSocket,
                &self.host_bind,
                self.effective_ws_port(),
            ));
        }
        if self.webrtc {
            out.push(ListenAddress::new(
                TransportKind::WebRtcDirect,
                &self.host_bind,
                self.port,
            ));
        }
        out
    }

    /// Parsed listen multiaddrs.
    pub fn listen_multiaddrs(&self) -> Result<Vec<Multiaddr>, NetError> {
        self.listen_addresses()
            .iter()
            .map(|a| {
                a.to_string().parse().map_err(|e| NetError::Config(format!("listen address {a}: {e}")))
            })
            .collect()
    }

    /// External addresses to advertise to peers.
    pub fn announce_multiaddrs(&self) -> Vec<Multiaddr> {
        let hosts = self.announce_host.iter().chain(self.announce_domain.iter());
        hosts
            .filter_map(|host| {
                let addr = ListenAddress::new(TransportKind::Tcp, host.as_str(), self.port);
                match addr.to_string().parse() {
                    Ok(ma) => Some(ma),
                    Err(e) => {
                        warn!(%addr, error = %e, "ignoring invalid announce address");
                        None
                    }
                }
            })
            .collect()
    }

    /// Bootstrap addresses to dial. Unparseable entries are logged and skipped.
    pub fn bootstrap_multiaddrs(&self) -> Vec<Multiaddr> {
        let defaults = DEFAULT_BOOTSTRAP
            .iter()
            .filter(|_| self.default_bootstrap)
            .map(|s| s.to_string());
        defaults
            .chain(self.bootstrap.iter().cloned())
            .filter(|s| !s.trim().is_empty())
            .filter_map(|s| match s.trim().parse::<Multiaddr>() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!(addr = %s, error = %e, "ignoring unparseable bootstrap address");
                    None
                }
            })
            .collect()
    }

    /// Reject values that can never work.
    pub fn validate(&self) -> Result<(), NetError> {
        if !self.tcp && !self.websocket && !self.webrtc {
            return Err(NetError::Config("no transport enabled".into()));
        }
        if self.tcp && self.websocket && self.port != 0 && self.effective_ws_port() == self.port {
            return Err(NetError::Config(format!(
                "tcp and websocket cannot share port {}",
                self.port
            )));
        }
        if self.max_event_subscribers == 0 {
            return Err(NetError::Config("max_event_subscribers must be > 0".into()));
        }
        Ok(())
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
