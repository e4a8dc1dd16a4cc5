//! Ed25519 key generation.

use ed25519_dalek::SigningKey;
use meridian_types::{KeyPair, PrivateKey, PublicKey};

/// Generate a new Ed25519 key pair from the thread-local CSPRNG.
pub fn generate_keypair() -> KeyPair {
    let seed: [u8; 32] = rand::random();
    keypair_from_seed(&seed)
}

/// Derive the public key from a private key.
pub fn public_from_private(private: &PrivateKey) -> PublicKey {
    let signing_key = SigningKey::from_bytes(&private.0);
    PublicKey(signing_key.verifying_key().to_bytes())
}

/// Derive a key pair from a 32-byte seed (deterministic).
pub fn keypair_from_seed(seed: &[u8; 32]) -> KeyPair {
    let signing_key = SigningKey::from_bytes(seed);
    KeyPair {
        public: PublicKey(signing_key.verifying_key().to_bytes()),
        private: PrivateKey(signing_key.to_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_produces_distinct_keys() {
        let a = generate_keypair();
        let b = generate_keypair();
        assert_ne!(a.public, b.public);
    }

    #[test]
    fn public_from_private_is_deterministic() {
        let kp = generate_keypair();
        assert_eq!(kp.public, public_from_private(&kp.private));
    }

    #[test]
    fn keypair_from_seed_deterministic() {
        let kp1 = keypair_from_seed(&[42u8; 32]);
        let kp2 = keypair_from_seed(&[42u8; 32]);
        assert_eq!(kp1.public, kp2.public);
        assert_ne!(kp1.public, keypair_from_seed(&[43u8; 32]).public);
    }
}
