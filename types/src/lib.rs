//! Fundamental types for the meridian p2p layer.
//!
//! This crate defines the types shared across every other crate in the
//! workspace: peer identifiers and XOR distance, hashes, block and header
//! shapes exchanged during sync, keys, network ids and timestamps.

pub mod block;
pub mod hash;
pub mod keys;
pub mod network;
pub mod peer_id;
pub mod time;

pub use block::{Block, BlockAux, Header, Transaction};
pub use hash::{BlockHash, MerkleRoot, TxHash};
pub use keys::{KeyPair, PrivateKey, PublicKey};
pub use network::NetworkId;
pub use peer_id::{common_prefix_len, PeerId, PeerIdAddressPair, PEER_ID_LEN};
pub use time::Timestamp;
