//! 32-byte hash newtypes for blocks, transactions and merkle roots.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! hash_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            pub const ZERO: Self = Self([0u8; 32]);

            pub fn new(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; 32]
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}\u{2026})", stringify!($name), hex::encode(&self.0[..4]))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(&self.0))
            }
        }
    };
}

hash_newtype!(
    /// Hash of a block header; identifies a block on the chain.
    BlockHash
);

hash_newtype!(
    /// Hash of a transaction.
    TxHash
);

hash_newtype!(
    /// Merkle root over a block's transactions or the post-block state.
    /// [`MerkleRoot::ZERO`] marks a block without transactions.
    MerkleRoot
);

// Inline hex encoding to avoid adding the `hex` crate as a dependency of types.
pub(crate) mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}
