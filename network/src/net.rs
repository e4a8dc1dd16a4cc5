//! The seam between the connection layer and the protocol services.
//!
//! Discovery, block sync, keepalive and the router talk to the network only
//! through [`Network`], so tests can swap the real server for a recorder.

use meridian_messages::Message;
use meridian_protocol::PeerInfo;
use meridian_types::PeerId;
use tokio::time::Instant;

use crate::NetworkError;

/// Events delivered to the message router, in arrival order per peer.
#[derive(Debug)]
pub enum Inbound {
    Message {
        from: PeerId,
        msg: Message,
        /// Frame size in bytes.
        size: usize,
    },
    PeerConnected(PeerInfo),
    PeerDisconnected(PeerInfo),
}

pub trait Network: Send + Sync {
    fn local_id(&self) -> PeerId;

    fn local_height(&self) -> u64;

    /// Height announced in handshakes and pings.
    fn set_local_height(&self, height: u64);

    fn peer_info(&self, id: &PeerId) -> Option<PeerInfo>;

    fn peer_height(&self, id: &PeerId) -> Option<u64>;

    fn set_peer_height(&self, id: &PeerId, height: u64);

    /// When we last heard from the peer.
    fn last_contact(&self, id: &PeerId) -> Option<Instant>;

    /// Queue `msg` for the peer without waiting.
    fn send_to(&self, id: &PeerId, msg: Message) -> Result<(), NetworkError>;

    fn connected_peers(&self) -> Vec<PeerInfo>;

    fn is_connected(&self, id: &PeerId) -> bool;

    fn outbound_count(&self) -> usize;

    /// Dial `addr` in the background.
    fn connect(&self, addr: String);

    fn disconnect(&self, id: &PeerId);
}
