//! meshbench -- peer-to-peer bandwidth measurement and link saturation.
//!
//! A controller gathers peers into a group, has pairs of them measure the
//! bandwidth between themselves, and can order one peer to flood the path to
//! another while other paths are measured. Control traffic runs over framed
//! control sockets; experiment payload runs over dedicated raw channels.

pub mod bandwidth;
pub mod config;
pub mod error;
pub mod group;
pub mod orchestrate;
pub mod peer;
pub mod proto;
pub mod saturate;
pub mod transport;

use std::time::Duration;

pub use error::{Error, ErrorKind, RemoteFault, Result};
pub use peer::Peer;
pub use proto::{BandwidthResult, BandwidthSpec, PeerAddress, SaturationReport};

/// Install the group, bandwidth and saturation protocols on `peer`.
pub fn init_all(peer: &mut Peer) -> Result<()> {
    group::init(peer)?;
    saturate::init(peer)?;
    Ok(())
}

/// Bind a peer with every protocol installed.
pub async fn bind_peer(config: config::PeerConfig) -> Result<Peer> {
    let mut peer = Peer::bind(config).await?;
    init_all(&mut peer)?;
    Ok(peer)
}

/// Dispatch until killed, or until `idle` passes with nothing to do.
pub async fn serve(peer: &mut Peer, idle: Option<Duration>) -> Result<()> {
    match idle {
        Some(timeout) => peer.mainloop(timeout).await,
        None => {
            while !peer.is_done() {
                peer.mainloop(Duration::from_secs(3600)).await?;
            }
            Ok(())
        }
    }
}
