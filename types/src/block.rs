//! Block, header and transaction shapes exchanged during sync.
//!
//! The ledger owns validation and storage; the network layer only needs to
//! move these values around, hash them and recognise empty blocks.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};

use crate::hash::{BlockHash, MerkleRoot, TxHash};

type Blake2b256 = Blake2b<U32>;

/// A block header.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u32,
    pub prev_block_hash: BlockHash,
    /// Merkle root of the block's transactions; zero when there are none.
    pub transactions_root: MerkleRoot,
    pub block_root: MerkleRoot,
    pub timestamp: u32,
    pub height: u32,
    pub consensus_data: u64,
    /// Opaque consensus payload (bookkeeper set, signatures).
    pub consensus_payload: Vec<u8>,
}

impl Header {
    /// Blake2b-256 over every header field in declaration order.
    pub fn hash(&self) -> BlockHash {
        let mut hasher = Blake2b256::new();
        hasher.update(self.version.to_le_bytes());
        hasher.update(self.prev_block_hash.as_bytes());
        hasher.update(self.transactions_root.as_bytes());
        hasher.update(self.block_root.as_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.height.to_le_bytes());
        hasher.update(self.consensus_data.to_le_bytes());
        hasher.update((self.consensus_payload.len() as u64).to_le_bytes());
        hasher.update(&self.consensus_payload);
        BlockHash::new(hasher.finalize().into())
    }

    /// Whether the header commits to no transactions.
    pub fn is_empty(&self) -> bool {
        self.transactions_root.is_zero()
    }
}

/// An opaque transaction. The network layer only hashes and relays it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub nonce: u64,
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn hash(&self) -> TxHash {
        let mut hasher = Blake2b256::new();
        hasher.update(self.nonce.to_le_bytes());
        hasher.update(&self.payload);
        TxHash::new(hasher.finalize().into())
    }
}

/// A full block: header plus transactions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }

    /// A body-less block synthesized from an empty header.
    pub fn from_empty_header(header: Header) -> Self {
        Self {
            header,
            transactions: Vec::new(),
        }
    }
}

/// Auxiliary data that travels with a block and is committed alongside it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAux {
    /// Cross-chain message produced at the previous height, if any.
    pub cross_chain_msg: Option<Vec<u8>>,
    /// State merkle root after applying the block.
    pub merkle_root: MerkleRoot,
}
