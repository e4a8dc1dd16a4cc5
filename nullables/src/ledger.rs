//! Nullable ledger: an in-memory chain that records every commit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use meridian_network::{Ledger, LedgerError};
use meridian_types::{
    Block, BlockAux, BlockHash, Header, MerkleRoot, Transaction, TxHash,
};
use parking_lot::{Mutex, RwLock};

/// Build a chain of `len` blocks on top of [`genesis`].
///
/// `with_txs(height)` decides whether the block at `height` carries a
/// transaction; blocks without one have a zero transactions root.
pub fn build_chain(len: u32, with_txs: impl Fn(u32) -> bool) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(len as usize);
    let mut prev = genesis().hash();
    for height in 1..=len {
        let transactions = if with_txs(height) {
            vec![Transaction {
                nonce: u64::from(height),
                payload: height.to_le_bytes().to_vec(),
            }]
        } else {
            Vec::new()
        };
        let transactions_root = match transactions.first() {
            Some(tx) => MerkleRoot::new(*tx.hash().as_bytes()),
            None => MerkleRoot::ZERO,
        };
        let header = Header {
            version: 0,
            prev_block_hash: prev,
            transactions_root,
            block_root: MerkleRoot::ZERO,
            timestamp: 1_600_000_000 + height,
            height,
            consensus_data: u64::from(height),
            consensus_payload: Vec::new(),
        };
        prev = header.hash();
        blocks.push(Block {
            header,
            transactions,
        });
    }
    blocks
}

/// The block at height zero shared by every nullable chain.
pub fn genesis() -> Block {
    Block::from_empty_header(Header::default())
}

struct Chain {
    headers: Vec<(Header, BlockHash)>,
    by_hash: HashMap<BlockHash, u32>,
    blocks: HashMap<u32, (Block, BlockAux)>,
    block_height: u32,
    txs: HashMap<TxHash, Transaction>,
}

impl Chain {
    fn push_header(&mut self, header: Header) -> Result<(), LedgerError> {
        let expected = self.headers.len() as u32;
        if header.height != expected {
            return Err(LedgerError::HeaderOutOfOrder {
                expected,
                got: header.height,
            });
        }
        let tip = self.headers.last().map(|(_, h)| *h).unwrap_or_default();
        if header.prev_block_hash != tip {
            return Err(LedgerError::BrokenLink(header.height));
        }
        let hash = header.hash();
        self.by_hash.insert(hash, header.height);
        self.headers.push((header, hash));
        Ok(())
    }
}

/// In-memory [`Ledger`] for tests.
pub struct NullLedger {
    chain: RwLock<Chain>,
    commits: Mutex<Vec<u32>>,
    fail_blocks: AtomicU32,
}

impl NullLedger {
    /// A ledger holding only the genesis block.
    pub fn new() -> Self {
        let genesis = genesis();
        let hash = genesis.hash();
        let chain = Chain {
            headers: vec![(genesis.header.clone(), hash)],
            by_hash: HashMap::from([(hash, 0)]),
            blocks: HashMap::from([(0, (genesis, BlockAux::default()))]),
            block_height: 0,
            txs: HashMap::new(),
        };
        Self {
            chain: RwLock::new(chain),
            commits: Mutex::new(Vec::new()),
            fail_blocks: AtomicU32::new(0),
        }
    }

    /// A ledger that already committed `blocks`.
    pub fn with_blocks(blocks: &[Block]) -> Self {
        let ledger = Self::new();
        for block in blocks {
            if let Err(e) = ledger.add_block(block.clone(), BlockAux::default()) {
                panic!("seeding nullable ledger: {e}");
            }
        }
        ledger.commits.lock().clear();
        ledger
    }

    /// A ledger that knows the headers of `blocks` but none of their bodies.
    pub fn with_headers(blocks: &[Block]) -> Self {
        let ledger = Self::new();
        let headers: Vec<Header> = blocks.iter().map(|b| b.header.clone()).collect();
        if let Err(e) = ledger.add_headers(&headers) {
            panic!("seeding nullable ledger: {e}");
        }
        ledger
    }

    /// Heights passed to successful `add_block` calls, in call order.
    pub fn commits(&self) -> Vec<u32> {
        self.commits.lock().clone()
    }

    /// Make the next `n` `add_block` calls fail.
    pub fn fail_next_blocks(&self, n: u32) {
        self.fail_blocks.store(n, Ordering::SeqCst);
    }
}

impl Default for NullLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger for NullLedger {
    fn current_header_height(&self) -> u32 {
        self.chain.read().headers.len() as u32 - 1
    }

    fn current_header_hash(&self) -> BlockHash {
        let chain = self.chain.read();
        chain.headers.last().map(|(_, h)| *h).unwrap_or_default()
    }

    fn current_block_height(&self) -> u32 {
        self.chain.read().block_height
    }

    fn current_block_hash(&self) -> BlockHash {
        let chain = self.chain.read();
        chain.headers[chain.block_height as usize].1
    }

    fn block_hash(&self, height: u32) -> Option<BlockHash> {
        self.chain.read().headers.get(height as usize).map(|(_, h)| *h)
    }

    fn header_by_hash(&self, hash: &BlockHash) -> Option<Header> {
        let chain = self.chain.read();
        let height = *chain.by_hash.get(hash)?;
        Some(chain.headers[height as usize].0.clone())
    }

    fn header_by_height(&self, height: u32) -> Option<Header> {
        self.chain
            .read()
            .headers
            .get(height as usize)
            .map(|(h, _)| h.clone())
    }

    fn add_headers(&self, headers: &[Header]) -> Result<(), LedgerError> {
        let mut chain = self.chain.write();
        for header in headers {
            chain.push_header(header.clone())?;
        }
        Ok(())
    }

    fn add_block(&self, block: Block, aux: BlockAux) -> Result<(), LedgerError> {
        let height = block.height();
        let pending_failures = self.fail_blocks.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.fail_blocks.store(pending_failures - 1, Ordering::SeqCst);
            return Err(LedgerError::Rejected(format!("block {height} refused")));
        }

        let mut chain = self.chain.write();
        let expected = chain.block_height + 1;
        if height != expected {
            return Err(LedgerError::BlockOutOfOrder {
                expected,
                got: height,
            });
        }
        let hash = block.hash();
        match chain.headers.get(height as usize) {
            Some((_, known)) if *known != hash => return Err(LedgerError::HeaderMismatch(hash)),
            Some(_) => {}
            None => chain.push_header(block.header.clone())?,
        }
        for tx in &block.transactions {
            chain.txs.insert(tx.hash(), tx.clone());
        }
        chain.blocks.insert(height, (block, aux));
        chain.block_height = height;
        drop(chain);
        self.commits.lock().push(height);
        Ok(())
    }

    fn block_by_hash(&self, hash: &BlockHash) -> Option<(Block, BlockAux)> {
        let chain = self.chain.read();
        let height = chain.by_hash.get(hash)?;
        chain.blocks.get(height).cloned()
    }

    fn transaction(&self, hash: &TxHash) -> Option<Transaction> {
        self.chain.read().txs.get(hash).cloned()
    }

    fn contains_block(&self, hash: &BlockHash) -> bool {
        let chain = self.chain.read();
        chain
            .by_hash
            .get(hash)
            .is_some_and(|h| chain.blocks.contains_key(h))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_links_to_genesis() {
        let blocks = build_chain(3, |_| true);
        assert_eq!(blocks[0].header.prev_block_hash, genesis().hash());
        assert_eq!(blocks[2].header.prev_block_hash, blocks[1].hash());
    }

    #[test]
    fn headers_then_blocks() {
        let blocks = build_chain(4, |h| h % 2 == 0);
        let ledger = NullLedger::with_headers(&blocks);
        assert_eq!(ledger.current_header_height(), 4);
        assert_eq!(ledger.current_block_height(), 0);
        assert_eq!(ledger.block_hash(3), Some(blocks[2].hash()));

        ledger.add_block(blocks[0].clone(), BlockAux::default()).unwrap();
        assert_eq!(
            ledger.add_block(blocks[2].clone(), BlockAux::default()),
            Err(LedgerError::BlockOutOfOrder { expected: 2, got: 3 })
        );
        assert_eq!(ledger.commits(), vec![1]);
        assert!(ledger.contains_block(&blocks[0].hash()));
        assert!(!ledger.contains_block(&blocks[1].hash()));
    }

    #[test]
    fn rejects_unlinked_headers() {
        let blocks = build_chain(2, |_| false);
        let ledger = NullLedger::new();
        assert_eq!(
            ledger.add_headers(&[blocks[1].header.clone()]),
            Err(LedgerError::HeaderOutOfOrder { expected: 1, got: 2 })
        );
    }

    #[test]
    fn injected_failures_are_consumed() {
        let blocks = build_chain(1, |_| true);
        let ledger = NullLedger::new();
        ledger.fail_next_blocks(1);
        assert!(ledger.add_block(blocks[0].clone(), BlockAux::default()).is_err());
        assert!(ledger.add_block(blocks[0].clone(), BlockAux::default()).is_ok());
        assert!(ledger.transaction(&blocks[0].transactions[0].hash()).is_some());
    }
}
