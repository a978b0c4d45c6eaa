//! Integration test: the fallback transports on loopback.
//!
//! Plain TCP is covered everywhere else. These scenarios turn on WebSocket,
//! WebRTC-direct and the circuit relay and dial over each one.

use std::time::Duration;

use weft_net::{Multiaddr, NetConfig, NetworkEvent, NetworkHandle, NetworkService, NodeIdentity, PeerId};

const WAIT: Duration = Duration::from_secs(20);

async fn start(seed: u8, config: NetConfig) -> (NetworkService, NetworkHandle) {
    let identity = NodeIdentity::from_secret([seed; 32]).unwrap();
    NetworkService::start(&identity, config).await.unwrap()
}

/// Wait for a listen address containing `marker` and return it with a
/// `/p2p/` suffix.
async fn listen_addr(handle: &NetworkHandle, marker: &str) -> Multiaddr {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let found = handle
            .listen_addrs()
            .await
            .unwrap()
            .into_iter()
            .find(|a| a.to_string().contains(marker));
        if let Some(addr) = found {
            return format!("{addr}/p2p/{}", handle.local_peer_id()).parse().unwrap();
        }
        assert!(tokio::time::Instant::now() < deadline, "no {marker} listen address");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_for_relay(handle: &NetworkHandle, relay: PeerId) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !handle.relays().await.unwrap().iter().any(|(p, _)| *p == relay) {
        assert!(tokio::time::Instant::now() < deadline, "relay never identified");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_dial_over_websocket() {
    let (mut sa, a) = start(
        11,
        NetConfig {
            websocket: true,
            ..NetConfig::local()
        },
    )
    .await;
    let (mut sb, b) = start(12, NetConfig::local()).await;

    let ws = listen_addr(&a, "/ws").await;
    assert!(ws.to_string().starts_with("/ip4/127.0.0.1/tcp/"));
    assert_eq!(b.dial(ws).await.unwrap(), a.local_peer_id());
    assert!(b.connected_peers().await.unwrap().contains(&a.local_peer_id()));

    sb.stop().await;
    sa.stop().await;
}

#[tokio::test]
async fn test_dial_over_webrtc_direct() {
    let webrtc_only = || NetConfig {
        tcp: false,
        webrtc: true,
        ..NetConfig::local()
    };
    let (mut sa, a) = start(13, webrtc_only()).await;
    let (mut sb, b) = start(14, webrtc_only()).await;

    let addr = listen_addr(&a, "/webrtc-direct").await;
    assert!(addr.to_string().contains("/certhash/"));
    assert_eq!(b.dial(addr).await.unwrap(), a.local_peer_id());

    sb.stop().await;
    sa.stop().await;
}

/// B holds a reservation on relay R. A has no address for B at all and still
/// reaches it through `<R>/p2p-circuit`.
#[tokio::test]
async fn test_peer_reachable_only_through_relay() {
    let (mut sr, r) = start(
        15,
        NetConfig {
            relay_server: true,
            ..NetConfig::local()
        },
    )
    .await;
    let relay_addr = listen_addr(&r, "/tcp/").await;

    let (mut sb, b) = start(16, NetConfig::local()).await;
    b.dial(relay_addr.clone()).await.unwrap();
    listen_addr(&b, "/p2p-circuit").await;

    let (mut sa, a) = start(17, NetConfig::local()).await;
    a.dial(relay_addr).await.unwrap();
    wait_for_relay(&a, r.local_peer_id()).await;

    let mut events = a.events().unwrap();
    a.dial_peer(b.local_peer_id(), vec![]).await.unwrap();

    let relayed = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(NetworkEvent::PeerConnected { peer, address, .. })
                    if peer == b.local_peer_id() =>
                {
                    return address;
                }
                Ok(_) => {}
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("connection to B");
    assert!(relayed.to_string().contains("/p2p-circuit"), "got {relayed}");

    sa.stop().await;
    sb.stop().await;
    sr.stop().await;
}
