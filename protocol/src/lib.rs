//! Wire protocol: message framing, encoding/decoding, handshake, versioning.

pub mod codec;
pub mod error;
pub mod handshake;
pub mod peer_info;
pub mod version;

pub use codec::{read_message, write_message, MAX_MSG_LEN};
pub use error::ProtocolError;
pub use handshake::{handshake_client, handshake_server, HandshakeOptions, HANDSHAKE_DURATION};
pub use peer_info::PeerInfo;
pub use version::{supports_dht, use_dht, MIN_VERSION_FOR_DHT, PROTOCOL_VERSION, SOFT_VERSION};
