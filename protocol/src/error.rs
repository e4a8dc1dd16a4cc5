use meridian_messages::MessageType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unmatched magic number {got:#010x}, expected {expected:#010x}")]
    BadMagic { expected: u32, got: u32 },

    #[error("message checksum error")]
    ChecksumMismatch,

    #[error("handshake failed, expect {expected} message, got {got}")]
    UnexpectedMessage {
        expected: MessageType,
        got: MessageType,
    },

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("invalid kad public key: {0}")]
    InvalidPeerKey(#[from] meridian_crypto::CryptoError),

    #[error("connection closed by remote")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
