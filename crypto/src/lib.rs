//! Cryptographic primitives for the meridian p2p layer.
//!
//! - **Blake2b** for block and transaction hashing, and Blake2b-160 for peer ids
//! - **double SHA-256** for frame checksums and the identity proof-of-work
//! - **Ed25519** keys behind every canonical peer identity

pub mod error;
pub mod hash;
pub mod keys;
pub mod peer_key;

pub use error::CryptoError;
pub use hash::{blake2b_160, blake2b_256, blake2b_256_multi, checksum, double_sha256};
pub use keys::{generate_keypair, keypair_from_seed, public_from_private};
pub use peer_key::{PeerKeyId, DEFAULT_DIFFICULTY};
