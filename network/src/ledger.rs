//! Contracts the network core consumes from its collaborators.
//!
//! The chain store and the consumers of transactions and consensus
//! payloads live outside this crate; the sync manager and the router reach
//! them only through these traits.

use meridian_messages::ConsensusPayload;
use meridian_types::{Block, BlockAux, BlockHash, Header, PeerId, Transaction, TxHash};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("header at height {got} does not extend the chain (expected {expected})")]
    HeaderOutOfOrder { expected: u32, got: u32 },

    #[error("header at height {0} does not link to its parent")]
    BrokenLink(u32),

    #[error("block at height {got} does not extend the chain (expected {expected})")]
    BlockOutOfOrder { expected: u32, got: u32 },

    #[error("no header known for block at height {0}")]
    UnknownHeader(u32),

    #[error("block {0} does not match the header chain")]
    HeaderMismatch(BlockHash),

    #[error("ledger rejected data: {0}")]
    Rejected(String),
}

/// The chain store. Heights are `u32`, matching the header field.
pub trait Ledger: Send + Sync {
    fn current_header_height(&self) -> u32;

    fn current_header_hash(&self) -> BlockHash;

    fn current_block_height(&self) -> u32;

    fn current_block_hash(&self) -> BlockHash;

    /// Hash of the header at `height`, if the header chain reaches it.
    fn block_hash(&self, height: u32) -> Option<BlockHash>;

    fn header_by_hash(&self, hash: &BlockHash) -> Option<Header>;

    fn header_by_height(&self, height: u32) -> Option<Header>;

    /// Append headers that extend the current header chain, in order.
    fn add_headers(&self, headers: &[Header]) -> Result<(), LedgerError>;

    /// Commit the block at `current_block_height() + 1`.
    fn add_block(&self, block: Block, aux: BlockAux) -> Result<(), LedgerError>;

    fn block_by_hash(&self, hash: &BlockHash) -> Option<(Block, BlockAux)>;

    fn transaction(&self, hash: &TxHash) -> Option<Transaction>;

    fn contains_block(&self, hash: &BlockHash) -> bool;
}

/// Receives the payloads the router does not consume itself.
pub trait PayloadSink: Send + Sync {
    fn on_transaction(&self, _from: PeerId, _tx: Transaction) {}

    fn on_consensus(&self, _from: PeerId, _payload: ConsensusPayload) {}
}

/// A sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardPayloads;

impl PayloadSink for DiscardPayloads {}
