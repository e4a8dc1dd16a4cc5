//! Node handshake protocol.
//!
//! Client side:
//!
//! 1. send Version, read Version
//! 2. when both sides support the DHT, send UpdatePeerKeyId and read the
//!    remote's UpdatePeerKeyId
//! 3. send VerAck, read VerAck
//!
//! The server mirrors every step. Peers that skip step 2 are addressed by a
//! pseudo id built from their Version nonce.

use std::net::SocketAddr;
use std::time::Duration;

use meridian_crypto::PeerKeyId;
use meridian_messages::{Message, MessageType, PeerKeyPayload, VersionPayload, HTTP_INFO_FLAG};
use meridian_types::{PeerId, Timestamp};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::{read_message, write_message};
use crate::peer_info::PeerInfo;
use crate::version::use_dht;
use crate::ProtocolError;

/// Upper bound on the whole exchange; slower peers are treated as hostile.
pub const HANDSHAKE_DURATION: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct HandshakeOptions {
    pub magic: u32,
    pub timeout: Duration,
    /// Identity difficulty demanded of the remote's key.
    pub difficulty: u32,
}

impl HandshakeOptions {
    pub fn new(magic: u32, difficulty: u32) -> Self {
        Self {
            magic,
            timeout: HANDSHAKE_DURATION,
            difficulty,
        }
    }
}

/// Run the dialing side of the handshake.
pub async fn handshake_client<S>(
    stream: &mut S,
    local: &PeerInfo,
    key: &PeerKeyId,
    remote_addr: SocketAddr,
    opts: &HandshakeOptions,
) -> Result<PeerInfo, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(opts.timeout, client_steps(stream, local, key, remote_addr, opts))
        .await
        .map_err(|_| ProtocolError::HandshakeTimeout)?
}

/// Run the accepting side of the handshake.
pub async fn handshake_server<S>(
    stream: &mut S,
    local: &PeerInfo,
    key: &PeerKeyId,
    remote_addr: SocketAddr,
    opts: &HandshakeOptions,
) -> Result<PeerInfo, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(opts.timeout, server_steps(stream, local, key, remote_addr, opts))
        .await
        .map_err(|_| ProtocolError::HandshakeTimeout)?
}

async fn client_steps<S>(
    stream: &mut S,
    local: &PeerInfo,
    key: &PeerKeyId,
    remote_addr: SocketAddr,
    opts: &HandshakeOptions,
) -> Result<PeerInfo, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(stream, opts.magic, &Message::Version(new_version(local))).await?;

    let version = match read_message(stream, opts.magic).await?.0 {
        Message::Version(v) => v,
        other => return Err(unexpected(MessageType::Version, &other)),
    };

    let mut id = PeerId::pseudo(version.nonce);
    if use_dht(&version.soft_version, &local.soft_version) {
        write_message(stream, opts.magic, &key_message(key)).await?;
        id = read_peer_key(stream, opts).await?;
    }

    write_message(stream, opts.magic, &Message::VerAck).await?;
    match read_message(stream, opts.magic).await?.0 {
        Message::VerAck => {}
        other => return Err(unexpected(MessageType::VerAck, &other)),
    }

    tracing::debug!(peer = %id, addr = %remote_addr, "outbound handshake complete");
    Ok(peer_info_from(version, id, remote_addr))
}

async fn server_steps<S>(
    stream: &mut S,
    local: &PeerInfo,
    key: &PeerKeyId,
    remote_addr: SocketAddr,
    opts: &HandshakeOptions,
) -> Result<PeerInfo, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = match read_message(stream, opts.magic).await?.0 {
        Message::Version(v) => v,
        other => return Err(unexpected(MessageType::Version, &other)),
    };

    write_message(stream, opts.magic, &Message::Version(new_version(local))).await?;

    let mut id = PeerId::pseudo(version.nonce);
    if use_dht(&version.soft_version, &local.soft_version) {
        id = read_peer_key(stream, opts).await?;
        write_message(stream, opts.magic, &key_message(key)).await?;
    }

    match read_message(stream, opts.magic).await?.0 {
        Message::VerAck => {}
        other => return Err(unexpected(MessageType::VerAck, &other)),
    }
    write_message(stream, opts.magic, &Message::VerAck).await?;

    tracing::debug!(peer = %id, addr = %remote_addr, "inbound handshake complete");
    Ok(peer_info_from(version, id, remote_addr))
}

async fn read_peer_key<S>(stream: &mut S, opts: &HandshakeOptions) -> Result<PeerId, ProtocolError>
where
    S: AsyncRead + Unpin,
{
    match read_message(stream, opts.magic).await?.0 {
        Message::UpdatePeerKeyId(payload) => {
            let remote = PeerKeyId::from_public_key(payload.public_key, opts.difficulty)?;
            Ok(remote.id)
        }
        other => Err(unexpected(MessageType::UpdatePeerKeyId, &other)),
    }
}

fn key_message(key: &PeerKeyId) -> Message {
    Message::UpdatePeerKeyId(PeerKeyPayload {
        public_key: key.public_key,
    })
}

fn unexpected(expected: MessageType, got: &Message) -> ProtocolError {
    ProtocolError::UnexpectedMessage {
        expected,
        got: got.message_type(),
    }
}

/// Build the Version payload describing the local node.
pub fn new_version(local: &PeerInfo) -> VersionPayload {
    let mut cap = [0u8; 32];
    if local.http_info_port > 0 {
        cap[HTTP_INFO_FLAG] = 0x01;
    }
    VersionPayload {
        version: local.version,
        services: local.services,
        timestamp: Timestamp::now().as_millis(),
        sync_port: local.port,
        http_info_port: local.http_info_port,
        cap,
        nonce: local.id.to_u64(),
        start_height: local.height,
        relay: local.relay,
        is_consensus: false,
        soft_version: local.soft_version.clone(),
    }
}

fn peer_info_from(version: VersionPayload, id: PeerId, addr: SocketAddr) -> PeerInfo {
    PeerInfo {
        id,
        version: version.version,
        services: version.services,
        relay: version.relay,
        http_info_port: version.http_info_port,
        port: version.sync_port,
        height: version.start_height,
        soft_version: version.soft_version,
        addr,
    }
}
