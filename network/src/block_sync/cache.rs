use std::collections::HashMap;

use meridian_types::{Block, BlockAux, PeerId};

/// A received block waiting for its turn to be committed.
#[derive(Clone, Debug)]
pub struct CachedBlock {
    pub from: PeerId,
    pub block: Block,
    pub aux: BlockAux,
}

/// Received blocks keyed by height.
///
/// Bodies synthesized from empty headers are tracked separately: they cost
/// nothing to fetch, so they do not count against the cache capacity.
#[derive(Debug, Default)]
pub struct BlockCache {
    blocks: HashMap<u32, CachedBlock>,
    empty: usize,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, replacing whatever was cached at the same height.
    pub fn add(&mut self, from: PeerId, block: Block, aux: BlockAux) {
        let height = block.height();
        self.remove(height);
        if block.header.is_empty() {
            self.empty += 1;
        }
        self.blocks.insert(height, CachedBlock { from, block, aux });
    }

    pub fn contains(&self, height: u32) -> bool {
        self.blocks.contains_key(&height)
    }

    pub fn remove(&mut self, height: u32) -> Option<CachedBlock> {
        let entry = self.blocks.remove(&height)?;
        if entry.block.header.is_empty() {
            self.empty -= 1;
        }
        Some(entry)
    }

    /// Drop everything at or below `height`.
    pub fn clear_up_to(&mut self, height: u32) {
        let stale: Vec<u32> = self.blocks.keys().copied().filter(|h| *h <= height).collect();
        for h in stale {
            self.remove(h);
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn non_empty_count(&self) -> usize {
        self.blocks.len() - self.empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_types::{Header, MerkleRoot, Transaction};

    fn block(height: u32, with_txs: bool) -> Block {
        let header = Header {
            height,
            transactions_root: if with_txs {
                MerkleRoot::new([1; 32])
            } else {
                MerkleRoot::ZERO
            },
            ..Header::default()
        };
        let transactions = if with_txs {
            vec![Transaction {
                nonce: u64::from(height),
                payload: vec![],
            }]
        } else {
            vec![]
        };
        Block {
            header,
            transactions,
        }
    }

    #[test]
    fn empty_blocks_do_not_count() {
        let mut cache = BlockCache::new();
        let from = PeerId::pseudo(1);
        cache.add(from, block(3, true), BlockAux::default());
        cache.add(from, block(4, false), BlockAux::default());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.non_empty_count(), 1);

        // replacing an empty body with a full one keeps the count right
        cache.add(from, block(4, true), BlockAux::default());
        assert_eq!(cache.non_empty_count(), 2);
    }

    #[test]
    fn clear_up_to_is_inclusive() {
        let mut cache = BlockCache::new();
        let from = PeerId::pseudo(1);
        for h in 1..=5 {
            cache.add(from, block(h, h % 2 == 0), BlockAux::default());
        }
        cache.clear_up_to(3);
        assert!(!cache.contains(3));
        assert!(cache.contains(4));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.non_empty_count(), 1);
        assert!(cache.remove(5).is_some());
        assert_eq!(cache.non_empty_count(), 1);
    }
}
