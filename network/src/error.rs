use std::net::IpAddr;

use meridian_types::PeerId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("the remote addr: {0} not in reserved list")]
    NotReserved(String),

    #[error("peer {0} already in connection records")]
    AlreadyConnected(String),

    #[error("connecting with self address {0}")]
    SelfAddress(String),

    #[error("bound {direction} connections reach max limit")]
    BoundFull { direction: &'static str },

    #[error("connections({count}) with ip({ip}) has reach max limit({max}), conn closed")]
    PerIpLimit { count: usize, ip: IpAddr, max: usize },

    #[error("node exist in connecting list: {0}")]
    AlreadyConnecting(String),

    #[error("the node handshake with itself")]
    HandshakeSelf,

    #[error("same peer id from different addr: {old}, {new} close latest one")]
    DuplicatePeerId { old: IpAddr, new: IpAddr },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("dial {0} timed out")]
    DialTimeout(String),

    #[error("peer {0} not found")]
    PeerNotFound(PeerId),

    #[error("send queue to peer {0} is full")]
    SendQueueFull(PeerId),

    #[error("channel closed")]
    ChannelClosed,

    #[error("protocol error: {0}")]
    Protocol(#[from] meridian_protocol::ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
