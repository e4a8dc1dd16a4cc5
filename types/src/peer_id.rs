//! Peer identifiers and the XOR metric used by the routing table.
//!
//! A peer is identified either by a canonical id derived from its public key
//! or, for peers running software that predates identity negotiation, by a
//! pseudo id synthesized from the nonce in their Version message. Both live
//! in the same 160-bit key space for distance computations but never compare
//! equal to each other.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hash::hex;

/// Width of a peer id in bytes.
pub const PEER_ID_LEN: usize = 20;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PeerId {
    /// Derived from a validated public key.
    Canonical([u8; PEER_ID_LEN]),
    /// Synthesized from a legacy peer's Version nonce.
    Pseudo(u64),
}

impl PeerId {
    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        PeerId::Canonical(bytes)
    }

    pub fn pseudo(nonce: u64) -> Self {
        PeerId::Pseudo(nonce)
    }

    pub fn is_pseudo(&self) -> bool {
        matches!(self, PeerId::Pseudo(_))
    }

    /// Position of this id in the 160-bit routing key space.
    pub fn kad_bytes(&self) -> [u8; PEER_ID_LEN] {
        match self {
            PeerId::Canonical(bytes) => *bytes,
            PeerId::Pseudo(nonce) => {
                let mut bytes = [0u8; PEER_ID_LEN];
                bytes[..8].copy_from_slice(&nonce.to_le_bytes());
                bytes
            }
        }
    }

    /// Numeric form carried as the Version nonce.
    ///
    /// Pseudo ids return their nonce. Canonical ids return the big-endian
    /// 160-bit value reduced modulo `u64::MAX`.
    pub fn to_u64(&self) -> u64 {
        match self {
            PeerId::Pseudo(nonce) => *nonce,
            PeerId::Canonical(bytes) => {
                // value = hi * 2^128 + mid * 2^64 + lo, and 2^64 = 1 (mod 2^64 - 1)
                let modulus = u64::MAX as u128;
                let hi = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u128;
                let mut mid = [0u8; 8];
                mid.copy_from_slice(&bytes[4..12]);
                let mut lo = [0u8; 8];
                lo.copy_from_slice(&bytes[12..20]);
                let sum = hi + u64::from_be_bytes(mid) as u128 + u64::from_be_bytes(lo) as u128;
                (sum % modulus) as u64
            }
        }
    }

    pub fn distance(&self, other: &PeerId) -> [u8; PEER_ID_LEN] {
        let a = self.kad_bytes();
        let b = other.kad_bytes();
        let mut out = [0u8; PEER_ID_LEN];
        for i in 0..PEER_ID_LEN {
            out[i] = a[i] ^ b[i];
        }
        out
    }

    /// True if `a` is strictly closer to `self` than `b` is.
    pub fn closer(&self, a: &PeerId, b: &PeerId) -> bool {
        self.distance(a) < self.distance(b)
    }

    /// A random canonical id sharing exactly `cpl` leading bits with `self`.
    pub fn gen_rand_peer_id(&self, cpl: usize) -> PeerId {
        let cpl = cpl.min(PEER_ID_LEN * 8 - 1);
        let own = self.kad_bytes();
        let mut out: [u8; PEER_ID_LEN] = rand::random();

        let full = cpl / 8;
        let left = cpl % 8;
        out[..full].copy_from_slice(&own[..full]);

        let keep = if left == 0 { 0u8 } else { 0xffu8 << (8 - left) };
        out[full] = (out[full] & !keep) | (own[full] & keep);

        let flip = 1u8 << (7 - left);
        out[full] = (out[full] & !flip) | (!own[full] & flip);
        PeerId::Canonical(out)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerId::Canonical(bytes) => f.write_str(&hex::encode(bytes)),
            PeerId::Pseudo(nonce) => write!(f, "~{:016x}", nonce),
        }
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

/// Number of leading zero bits in the XOR distance of two ids.
pub fn common_prefix_len(a: &PeerId, b: &PeerId) -> usize {
    let dist = a.distance(b);
    for (i, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return i * 8 + byte.leading_zeros() as usize;
        }
    }
    PEER_ID_LEN * 8
}

/// A routing-table entry handed out in discovery responses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdAddressPair {
    pub id: PeerId,
    pub address: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudo_and_canonical_never_equal() {
        let mut bytes = [0u8; PEER_ID_LEN];
        bytes[..8].copy_from_slice(&42u64.to_le_bytes());
        let canonical = PeerId::Canonical(bytes);
        let pseudo = PeerId::Pseudo(42);
        assert_ne!(canonical, pseudo);
        assert_eq!(canonical.kad_bytes(), pseudo.kad_bytes());
        assert_eq!(common_prefix_len(&canonical, &pseudo), 160);
    }

    #[test]
    fn to_u64_reduces_modulo_max() {
        assert_eq!(PeerId::Pseudo(7).to_u64(), 7);

        let mut bytes = [0u8; PEER_ID_LEN];
        bytes[19] = 5;
        assert_eq!(PeerId::Canonical(bytes).to_u64(), 5);

        // 2^64 mod (2^64 - 1) == 1
        let mut bytes = [0u8; PEER_ID_LEN];
        bytes[11] = 1;
        assert_eq!(PeerId::Canonical(bytes).to_u64(), 1);

        let mut bytes = [0u8; PEER_ID_LEN];
        bytes[12..].copy_from_slice(&u64::MAX.to_be_bytes());
        assert_eq!(PeerId::Canonical(bytes).to_u64(), 0);
    }

    #[test]
    fn cpl_counts_leading_bits() {
        let a = PeerId::Canonical([0u8; PEER_ID_LEN]);
        let mut b = [0u8; PEER_ID_LEN];
        b[1] = 0b0010_0000;
        assert_eq!(common_prefix_len(&a, &PeerId::Canonical(b)), 10);
        assert_eq!(common_prefix_len(&a, &a), 160);
    }

    #[test]
    fn gen_rand_peer_id_hits_requested_cpl() {
        let local = PeerId::Canonical([0xa5; PEER_ID_LEN]);
        for cpl in [0, 1, 7, 8, 9, 15, 63, 159] {
            let id = local.gen_rand_peer_id(cpl);
            assert_eq!(common_prefix_len(&local, &id), cpl);
        }
        let clamped = local.gen_rand_peer_id(500);
        assert_eq!(common_prefix_len(&local, &clamped), 159);
    }

    #[test]
    fn closer_compares_xor_distance() {
        let origin = PeerId::Canonical([0u8; PEER_ID_LEN]);
        let mut near = [0u8; PEER_ID_LEN];
        near[19] = 1;
        let mut far = [0u8; PEER_ID_LEN];
        far[0] = 1;
        assert!(origin.closer(&PeerId::Canonical(near), &PeerId::Canonical(far)));
        assert!(!origin.closer(&PeerId::Canonical(far), &PeerId::Canonical(near)));
    }

    #[test]
    fn display_forms() {
        assert_eq!(PeerId::Pseudo(255).to_string(), "~00000000000000ff");
        assert_eq!(PeerId::Canonical([0x11; PEER_ID_LEN]).to_string().len(), 40);
    }
}
