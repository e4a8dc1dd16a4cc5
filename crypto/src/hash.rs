//! Blake2b and SHA-256 helpers.

use blake2::digest::consts::{U20, U32};
use blake2::{Blake2b, Digest};
use sha2::Sha256;

type Blake2b256 = Blake2b<U32>;
type Blake2b160 = Blake2b<U20>;

/// Compute a 256-bit Blake2b hash of arbitrary data.
pub fn blake2b_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash multiple byte slices in sequence (avoids concatenation allocation).
pub fn blake2b_256_multi(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// 160-bit Blake2b, the width of a canonical peer id.
pub fn blake2b_160(data: &[u8]) -> [u8; 20] {
    let mut hasher = Blake2b160::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Frame checksum: the first four bytes of the double SHA-256 of the body.
pub fn checksum(data: &[u8]) -> [u8; 4] {
    let digest = double_sha256(data);
    [digest[0], digest[1], digest[2], digest[3]]
}
