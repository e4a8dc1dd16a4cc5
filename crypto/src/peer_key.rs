//! Peer identity keys.
//!
//! A canonical [`PeerId`] is the Blake2b-160 of an Ed25519 public key. To make
//! minting identities expensive, a key is only accepted when the double
//! SHA-256 of its bytes starts with `difficulty` zero bits.

use ed25519_dalek::VerifyingKey;
use meridian_types::{PeerId, PublicKey};
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::hash::{blake2b_160, double_sha256};
use crate::keys::generate_keypair;

/// Leading zero bits required of a production identity key.
pub const DEFAULT_DIFFICULTY: u32 = 18;

/// A public key together with the peer id derived from it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerKeyId {
    pub public_key: PublicKey,
    pub id: PeerId,
}

impl PeerKeyId {
    /// Mint a fresh identity, retrying until a key meets `difficulty`.
    pub fn generate(difficulty: u32) -> Self {
        loop {
            let kp = generate_keypair();
            if meets_difficulty(&kp.public, difficulty) {
                return Self {
                    id: peer_id_from_public_key(&kp.public),
                    public_key: kp.public,
                };
            }
        }
    }

    /// Validate an identity key received from a remote peer.
    pub fn from_public_key(public_key: PublicKey, difficulty: u32) -> Result<Self, CryptoError> {
        VerifyingKey::from_bytes(public_key.as_bytes())
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        if !meets_difficulty(&public_key, difficulty) {
            return Err(CryptoError::InsufficientDifficulty(difficulty));
        }
        Ok(Self {
            id: peer_id_from_public_key(&public_key),
            public_key,
        })
    }
}

pub fn peer_id_from_public_key(public_key: &PublicKey) -> PeerId {
    PeerId::Canonical(blake2b_160(public_key.as_bytes()))
}

pub fn meets_difficulty(public_key: &PublicKey, difficulty: u32) -> bool {
    let hash = double_sha256(public_key.as_bytes());
    let full = (difficulty / 8) as usize;
    if full > hash.len() {
        return false;
    }
    if hash[..full].iter().any(|b| *b != 0) {
        return false;
    }
    let rest = difficulty % 8;
    rest == 0 || hash[full] >> (8 - rest) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_validates() {
        let key = PeerKeyId::generate(4);
        assert!(meets_difficulty(&key.public_key, 4));
        let decoded = PeerKeyId::from_public_key(key.public_key, 4).unwrap();
        assert_eq!(decoded, key);
        assert!(!key.id.is_pseudo());
    }

    #[test]
    fn zero_difficulty_accepts_any_valid_key() {
        let kp = generate_keypair();
        assert!(PeerKeyId::from_public_key(kp.public, 0).is_ok());
    }

    #[test]
    fn rejects_key_below_difficulty() {
        // Find a key whose hash starts with a set bit; it fails difficulty 1.
        let weak = loop {
            let kp = generate_keypair();
            if double_sha256(kp.public.as_bytes())[0] & 0x80 != 0 {
                break kp.public;
            }
        };
        assert!(matches!(
            PeerKeyId::from_public_key(weak, 1),
            Err(CryptoError::InsufficientDifficulty(1))
        ));
    }

    #[test]
    fn id_is_blake2b_160_of_key() {
        let key = PeerKeyId::generate(0);
        assert_eq!(key.id, PeerId::Canonical(blake2b_160(key.public_key.as_bytes())));
    }
}
