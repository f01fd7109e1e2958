//! Helpers shared by the multi-peer integration tests.
#![allow(dead_code)]

use std::time::Duration;

use meshbench::config::PeerConfig;
use meshbench::proto::{BandwidthSpec, PeerAddress};
use meshbench::Peer;
use tokio::task::JoinHandle;

/// Loopback config with timeouts short enough for tests.
pub fn test_config() -> PeerConfig {
    let mut config = PeerConfig::loopback();
    config.timeouts.connect_ms = 2_000;
    config.timeouts.rpc_sec = 10;
    config.timeouts.handshake_sec = 10;
    config.timeouts.transfer_sec = 10;
    config.timeouts.bw_request_sec = 30;
    config.timeouts.saturation_idle_ms = 500;
    config.timeouts.stop_sec = 10;
    config.saturation.probe_min_duration_ms = 100;
    config.saturation.max_message_size = 1024 * 1024;
    config
}

/// A peer with every protocol installed, not yet dispatching.
pub async fn new_peer() -> Peer {
    meshbench::bind_peer(test_config()).await.expect("bind peer")
}

/// Run `peer`'s mainloop in a task; the task hands the peer back when the
/// loop ends.
pub fn run(mut peer: Peer, idle: Duration) -> (PeerAddress, JoinHandle<Peer>) {
    let address = peer.address().clone();
    let handle = tokio::spawn(async move {
        peer.mainloop(idle).await.expect("mainloop");
        peer
    });
    (address, handle)
}

/// Start a dispatching peer.
pub async fn spawn_peer(idle: Duration) -> (PeerAddress, JoinHandle<Peer>) {
    run(new_peer().await, idle)
}

/// Small experiment that never re-asks.
pub fn small_spec() -> BandwidthSpec {
    BandwidthSpec {
        buffer_size: 0,
        message_size: 64 * 1024,
        message_count: 4,
        min_duration_ms: 0,
    }
}

/// An address nothing listens on.
pub async fn dead_address() -> PeerAddress {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.into()
}
