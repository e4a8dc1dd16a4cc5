//! Network message types for meridian node-to-node communication.
//!
//! Every frame on the wire carries exactly one [`Message`]. The enum is
//! closed: adding a message kind means adding a variant here and a match
//! arm in the router.

use std::fmt;
use std::net::IpAddr;

use meridian_types::{
    Block, BlockAux, BlockHash, Header, PeerId, PeerIdAddressPair, PublicKey, Transaction, TxHash,
};
use serde::{Deserialize, Serialize};

/// Index into [`VersionPayload::cap`] flagging an http info endpoint.
pub const HTTP_INFO_FLAG: usize = 0;

/// Top-level P2P wire message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    // Handshake
    Version(VersionPayload),
    VerAck,
    UpdatePeerKeyId(PeerKeyPayload),

    // Discovery
    AddrReq,
    Addr(Vec<PeerAddr>),
    FindNodeReq(FindNodeReq),
    FindNodeResp(FindNodeResp),

    // Sync
    HeadersReq(HeadersReq),
    Headers(Vec<Header>),
    Block(BlockMessage),
    Inv(Inventory),
    GetData(DataReq),
    NotFound(DataReq),

    // Liveness
    Ping { height: u64 },
    Pong { height: u64 },

    // Relay
    Tx(Transaction),
    Consensus(ConsensusPayload),

    Disconnect,
}

/// Command tag of a [`Message`], used in logs and metrics labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Version,
    VerAck,
    UpdatePeerKeyId,
    AddrReq,
    Addr,
    FindNodeReq,
    FindNodeResp,
    HeadersReq,
    Headers,
    Block,
    Inv,
    GetData,
    NotFound,
    Ping,
    Pong,
    Tx,
    Consensus,
    Disconnect,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Version => "version",
            Self::VerAck => "verack",
            Self::UpdatePeerKeyId => "updatekadkey",
            Self::AddrReq => "getaddr",
            Self::Addr => "addr",
            Self::FindNodeReq => "findnode",
            Self::FindNodeResp => "findnoderesp",
            Self::HeadersReq => "getheaders",
            Self::Headers => "headers",
            Self::Block => "block",
            Self::Inv => "inv",
            Self::GetData => "getdata",
            Self::NotFound => "notfound",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Tx => "tx",
            Self::Consensus => "consensus",
            Self::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Version(_) => MessageType::Version,
            Message::VerAck => MessageType::VerAck,
            Message::UpdatePeerKeyId(_) => MessageType::UpdatePeerKeyId,
            Message::AddrReq => MessageType::AddrReq,
            Message::Addr(_) => MessageType::Addr,
            Message::FindNodeReq(_) => MessageType::FindNodeReq,
            Message::FindNodeResp(_) => MessageType::FindNodeResp,
            Message::HeadersReq(_) => MessageType::HeadersReq,
            Message::Headers(_) => MessageType::Headers,
            Message::Block(_) => MessageType::Block,
            Message::Inv(_) => MessageType::Inv,
            Message::GetData(_) => MessageType::GetData,
            Message::NotFound(_) => MessageType::NotFound,
            Message::Ping { .. } => MessageType::Ping,
            Message::Pong { .. } => MessageType::Pong,
            Message::Tx(_) => MessageType::Tx,
            Message::Consensus(_) => MessageType::Consensus,
            Message::Disconnect => MessageType::Disconnect,
        }
    }
}

/// Capabilities and chain position announced at the start of a handshake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPayload {
    pub version: u32,
    pub services: u64,
    /// Unix time in milliseconds.
    pub timestamp: u64,
    pub sync_port: u16,
    pub http_info_port: u16,
    pub cap: [u8; 32],
    /// Numeric form of the sender's peer id. Legacy peers are addressed by
    /// a pseudo id built from this value.
    pub nonce: u64,
    pub start_height: u64,
    pub relay: bool,
    pub is_consensus: bool,
    pub soft_version: String,
}

/// Identity key exchanged by peers that support the DHT.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerKeyPayload {
    pub public_key: PublicKey,
}

/// A dialable peer advertised in an `Addr` response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    pub ip: IpAddr,
    pub port: u16,
    pub id: PeerId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNodeReq {
    pub target_id: PeerId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNodeResp {
    pub target_id: PeerId,
    /// The responder is the target itself.
    pub success: bool,
    pub address: String,
    pub closer_peers: Vec<PeerIdAddressPair>,
}

/// Header range request.
///
/// With a zero `hash_start` the responder returns headers after `hash_end`
/// up to its own tip. With a non-zero `hash_start` it walks back from there.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadersReq {
    pub len: u8,
    pub hash_start: BlockHash,
    pub hash_end: BlockHash,
}

impl HeadersReq {
    /// Request the headers that follow `current`.
    pub fn new(current: BlockHash) -> Self {
        Self {
            len: 1,
            hash_start: BlockHash::ZERO,
            hash_end: current,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMessage {
    pub block: Block,
    pub aux: BlockAux,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Inventory {
    Block(Vec<BlockHash>),
    Tx(Vec<TxHash>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataReq {
    Block(BlockHash),
    Tx(TxHash),
}

/// Opaque consensus traffic relayed on behalf of the consensus engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusPayload {
    pub height: u32,
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_req_points_after_current() {
        let cur = BlockHash::new([3; 32]);
        let req = HeadersReq::new(cur);
        assert!(req.hash_start.is_zero());
        assert_eq!(req.hash_end, cur);
    }

    #[test]
    fn message_type_tags() {
        assert_eq!(Message::VerAck.message_type().as_str(), "verack");
        assert_eq!(Message::Ping { height: 3 }.message_type(), MessageType::Ping);
        assert_eq!(
            Message::GetData(DataReq::Tx(TxHash::ZERO)).message_type().to_string(),
            "getdata"
        );
    }

    #[test]
    fn addr_survives_bincode() {
        let msg = Message::Addr(vec![PeerAddr {
            ip: "10.0.0.1".parse().unwrap(),
            port: 20338,
            id: PeerId::Pseudo(9),
        }]);
        let bytes = bincode::serialize(&msg).unwrap();
        let back: Message = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, msg);
    }
}
