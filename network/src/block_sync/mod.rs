//! Header and block synchronization.
//!
//! Headers are fetched one batch at a time from the best-weighted peer.
//! Blocks for known headers are fetched in parallel, cached by height and
//! committed strictly in height order. Every request is a flight with its
//! own timeout; a timed-out flight moves to another peer.

mod cache;
mod flight;
mod manager;
mod weight;

use std::time::Duration;

pub use cache::{BlockCache, CachedBlock};
pub use flight::SyncFlightInfo;
pub use manager::BlockSyncMgr;
pub use weight::{NodeWeight, INITIAL_SPEED, RECORD_WINDOW};

/// Tunables for [`BlockSyncMgr`].
#[derive(Clone, Debug, PartialEq)]
pub struct SyncConfig {
    /// Stop fetching headers once they lead committed blocks by this much.
    pub max_header_forward: u32,
    pub max_flight_headers: usize,
    pub max_flight_blocks: usize,
    /// Non-empty blocks held while waiting for their turn.
    pub block_cache_size: usize,
    pub header_timeout: Duration,
    pub block_timeout: Duration,
    /// Parallel requests issued for each of the next few heights.
    pub next_block_times: usize,
    /// How many heights past the committed tip get parallel requests.
    pub next_blocks_height: u32,
    /// Bad responses tolerated before a peer leaves the sync pool.
    pub max_error_resp: u32,
    /// Lagging peers are pinged only while we are this close to the best height.
    pub max_height_offset: u64,
    pub tick: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_header_forward: 5000,
            max_flight_headers: 1,
            max_flight_blocks: 50,
            block_cache_size: 500,
            header_timeout: Duration::from_secs(2),
            block_timeout: Duration::from_secs(2),
            next_block_times: 3,
            next_blocks_height: 2,
            max_error_resp: 5,
            max_height_offset: 5,
            tick: Duration::from_secs(1),
        }
    }
}
