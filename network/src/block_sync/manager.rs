use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use meridian_messages::{DataReq, HeadersReq, Message};
use meridian_types::{Block, BlockAux, BlockHash, Header, PeerId};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{BlockCache, NodeWeight, SyncConfig, SyncFlightInfo};
use crate::ledger::Ledger;
use crate::net::Network;

#[derive(Default)]
struct Flights {
    headers: HashMap<u32, SyncFlightInfo>,
    blocks: HashMap<BlockHash, Vec<SyncFlightInfo>>,
}

impl Flights {
    fn block_count(&self) -> usize {
        self.blocks.values().map(Vec::len).sum()
    }
}

/// Held while one pass of a sync step runs; a second caller skips the pass.
struct Pass<'a>(&'a AtomicBool);

impl<'a> Pass<'a> {
    fn try_enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Pass(flag))
    }
}

impl Drop for Pass<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct BlockSyncMgr {
    config: SyncConfig,
    net: Arc<dyn Network>,
    ledger: Arc<dyn Ledger>,
    flights: Mutex<Flights>,
    cache: Mutex<BlockCache>,
    weights: Mutex<HashMap<PeerId, NodeWeight>>,
    header_pass: AtomicBool,
    block_pass: AtomicBool,
    save_pass: AtomicBool,
    wake: Notify,
}

impl BlockSyncMgr {
    pub fn new(net: Arc<dyn Network>, ledger: Arc<dyn Ledger>, config: SyncConfig) -> Self {
        Self {
            config,
            net,
            ledger,
            flights: Mutex::new(Flights::default()),
            cache: Mutex::new(BlockCache::new()),
            weights: Mutex::new(HashMap::new()),
            header_pass: AtomicBool::new(false),
            block_pass: AtomicBool::new(false),
            save_pass: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run the sync loop until cancelled.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            me.sync();
            let period = me.config.tick;
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        me.check_timeout();
                        me.sync();
                        me.save_block();
                    }
                    _ = me.wake.notified() => me.sync(),
                }
            }
            tracing::debug!("block sync stopped");
        })
    }

    pub fn on_add_node(&self, id: PeerId) {
        tracing::debug!(peer = %id, "sync source added");
        self.weights.lock().insert(id, NodeWeight::new(id, Instant::now()));
        self.wake.notify_one();
    }

    pub fn on_del_node(&self, id: &PeerId) {
        self.del_node(id);
    }

    fn del_node(&self, id: &PeerId) {
        let remaining = {
            let mut weights = self.weights.lock();
            weights.remove(id);
            weights.len()
        };
        tracing::info!(peer = %id, "sync source removed");
        if remaining == 0 {
            tracing::warn!("no sync sources");
        }
    }

    pub fn sync(&self) {
        self.sync_header();
        self.sync_block();
    }

    pub fn sync_header(&self) {
        let Some(_pass) = Pass::try_enter(&self.header_pass) else {
            return;
        };
        if self.flights.lock().headers.len() >= self.config.max_flight_headers {
            return;
        }
        let cur_block = self.ledger.current_block_height();
        let cur_header = self.ledger.current_header_height();
        if cur_header.saturating_sub(cur_block) >= self.config.max_header_forward {
            return;
        }
        let next = cur_header + 1;
        let Some(peer) = self.next_node(next, &[]) else {
            return;
        };
        self.flights
            .lock()
            .headers
            .insert(next, SyncFlightInfo::new(next, peer, Instant::now()));
        let hash = self.ledger.current_header_hash();
        tracing::info!(height = next, peer = %peer, "requesting headers");
        self.send_request(peer, Message::HeadersReq(HeadersReq::new(hash)));
    }

    pub fn sync_block(&self) {
        let Some(_pass) = Pass::try_enter(&self.block_pass) else {
            return;
        };
        let avail = self
            .config
            .max_flight_blocks
            .saturating_sub(self.flight_block_count());
        if avail == 0 {
            return;
        }
        let cur_block = self.ledger.current_block_height();
        let cur_header = self.ledger.current_header_height();
        let cache_room = self
            .config
            .block_cache_size
            .saturating_sub(self.cache.lock().non_empty_count());
        let count = (cur_header.saturating_sub(cur_block) as usize)
            .min(avail)
            .min(cache_room);

        let mut scheduled = 0;
        let mut height = cur_block;
        while scheduled < count {
            height += 1;
            let Some(hash) = self.ledger.block_hash(height) else {
                return;
            };
            let near = height <= cur_block.saturating_add(self.config.next_blocks_height);
            let mut serving = self.serving_peers(&hash);
            if !serving.is_empty() && !near {
                continue;
            }
            if self.cache.lock().contains(height) {
                continue;
            }
            let wanted = if near { self.config.next_block_times } else { 1 };
            while serving.len() < wanted {
                let Some(peer) = self.next_node(height, &serving) else {
                    if serving.is_empty() {
                        return;
                    }
                    break;
                };
                serving.push(peer);
                self.flights
                    .lock()
                    .blocks
                    .entry(hash)
                    .or_default()
                    .push(SyncFlightInfo::new(height, peer, Instant::now()));
                if !self.send_request(peer, Message::GetData(DataReq::Block(hash))) {
                    return;
                }
            }
            scheduled += 1;
        }
    }

    /// Reassign every flight that outlived its timeout.
    pub fn check_timeout(&self) {
        let now = Instant::now();
        let cur_header = self.ledger.current_header_height();
        let cur_block = self.ledger.current_block_height();
        let header_hash = self.ledger.current_header_hash();
        let ranked = self.ranked_peers();

        let mut charged = Vec::new();
        let mut sends = Vec::new();
        {
            let mut flights = self.flights.lock();

            let mut stale_headers = Vec::new();
            for (height, flight) in flights.headers.iter_mut() {
                if now.saturating_duration_since(flight.start()) < self.config.header_timeout {
                    continue;
                }
                charged.push(flight.peer());
                if *height <= cur_header {
                    stale_headers.push(*height);
                    continue;
                }
                flight.reset_start(now);
                flight.mark_failed();
                tracing::trace!(
                    height,
                    peer = %flight.peer(),
                    times = flight.total_failed(),
                    "header request timed out"
                );
                if let Some(next) = flight.next_peer(&ranked) {
                    flight.set_peer(next);
                    sends.push((next, Message::HeadersReq(HeadersReq::new(header_hash))));
                }
            }
            for height in stale_headers {
                flights.headers.remove(&height);
            }

            let mut stale_blocks = Vec::new();
            for (hash, list) in flights.blocks.iter_mut() {
                for i in 0..list.len() {
                    if now.saturating_duration_since(list[i].start()) < self.config.block_timeout {
                        continue;
                    }
                    // Never hand a flight to a peer already serving this hash.
                    let busy: Vec<PeerId> = list
                        .iter()
                        .enumerate()
                        .filter(|(j, _)| *j != i)
                        .map(|(_, f)| f.peer())
                        .collect();
                    let candidates: Vec<(PeerId, u64)> = ranked
                        .iter()
                        .filter(|(id, _)| !busy.contains(id))
                        .copied()
                        .collect();
                    let flight = &mut list[i];
                    charged.push(flight.peer());
                    if flight.height <= cur_block {
                        stale_blocks.push(*hash);
                        continue;
                    }
                    flight.reset_start(now);
                    flight.mark_failed();
                    tracing::trace!(
                        height = flight.height,
                        peer = %flight.peer(),
                        times = flight.total_failed(),
                        "block request timed out"
                    );
                    if let Some(next) = flight.next_peer(&candidates) {
                        flight.set_peer(next);
                        sends.push((next, Message::GetData(DataReq::Block(*hash))));
                    }
                }
            }
            for hash in stale_blocks {
                flights.blocks.remove(&hash);
            }
        }

        {
            let mut weights = self.weights.lock();
            for peer in charged {
                if let Some(w) = weights.get_mut(&peer) {
                    w.add_timeout();
                }
            }
        }
        for (peer, msg) in sends {
            self.send_request(peer, msg);
        }
    }

    pub fn on_header_receive(&self, from: PeerId, mut headers: Vec<Header>) {
        let (Some(first), Some(last)) = (headers.first(), headers.last()) else {
            return;
        };
        let height = first.height;
        tracing::info!(from = height, to = last.height, peer = %from, "headers received");

        if height <= self.ledger.current_header_height() {
            return;
        }
        if !self.flights.lock().headers.contains_key(&height) {
            return;
        }
        let added = self.ledger.add_headers(&headers);
        self.flights.lock().headers.remove(&height);
        if let Err(e) = added {
            tracing::warn!(peer = %from, error = %e, "rejected headers");
            self.penalize(&from);
            return;
        }

        headers.sort_by_key(|h| h.height);
        let cur_header = self.ledger.current_header_height();
        let cur_block = self.ledger.current_block_height();
        for header in headers {
            let Some(prev) = header
                .height
                .checked_sub(1)
                .and_then(|h| self.ledger.header_by_height(h))
            else {
                continue;
            };
            if !(header.is_empty() && prev.is_empty()) {
                continue;
            }
            // no transactions to fetch, build the body from the header
            let h = header.height;
            self.flights.lock().blocks.remove(&header.hash());
            if h > cur_header + 1 {
                break;
            }
            if h <= cur_block {
                continue;
            }
            tracing::trace!(height = h, "caching empty block");
            self.cache
                .lock()
                .add(from, Block::from_empty_header(header), BlockAux::default());
        }
        self.save_block();
        self.sync_header();
    }

    /// `size` is the frame size the block arrived in, used for the speed
    /// estimate.
    pub fn on_block_receive(&self, from: PeerId, size: usize, block: Block, aux: BlockAux) {
        let height = block.height();
        let hash = block.hash();
        let now = Instant::now();

        // the first response settles every redundant request for this hash
        let settled = self.flights.lock().blocks.remove(&hash);
        if let Some(flight) = settled.iter().flatten().find(|f| f.peer() == from) {
            let millis = now.saturating_duration_since(flight.start()).as_millis().max(1) as f32;
            let speed = size as f32 / millis * 1000.0 / 1024.0;
            if let Some(w) = self.weights.lock().get_mut(&from) {
                w.append_speed(speed);
            }
        }

        let cur_header = self.ledger.current_header_height();
        if height > cur_header.saturating_add(1) {
            return;
        }
        if height <= self.ledger.current_block_height() {
            return;
        }
        if self.ledger.block_hash(height).is_some_and(|h| h != hash) {
            tracing::debug!(height, peer = %from, "block does not match header chain");
            return;
        }
        {
            let mut cache = self.cache.lock();
            if cache.contains(height) {
                tracing::trace!(height, peer = %from, "duplicate block dropped");
                return;
            }
            cache.add(from, block, aux);
        }
        self.save_block();
        self.sync_block();
    }

    /// Commit cached blocks while the next height is available.
    pub fn save_block(&self) {
        let Some(_pass) = Pass::try_enter(&self.save_pass) else {
            return;
        };
        let cur_block = self.ledger.current_block_height();
        self.cache.lock().clear_up_to(cur_block);
        let mut next = cur_block + 1;
        loop {
            let Some(entry) = self.cache.lock().remove(next) else {
                return;
            };
            let hash = entry.block.hash();
            if let Err(e) = self.ledger.add_block(entry.block, entry.aux) {
                tracing::warn!(height = next, peer = %entry.from, error = %e, "block commit failed");
                self.penalize(&entry.from);
                let Some(peer) = self.next_node(next, &[]) else {
                    return;
                };
                self.flights
                    .lock()
                    .blocks
                    .entry(hash)
                    .or_default()
                    .push(SyncFlightInfo::new(next, peer, Instant::now()));
                self.send_request(peer, Message::GetData(DataReq::Block(hash)));
                return;
            }
            tracing::debug!(height = next, "block committed");
            self.net.set_local_height(u64::from(next));
            self.ping_outsync_nodes(next);
            next += 1;
        }
    }

    pub fn flight_header_count(&self) -> usize {
        self.flights.lock().headers.len()
    }

    pub fn flight_block_count(&self) -> usize {
        self.flights.lock().block_count()
    }

    /// Peers currently asked for the block `hash`.
    pub fn serving_peers(&self, hash: &BlockHash) -> Vec<PeerId> {
        self.flights
            .lock()
            .blocks
            .get(hash)
            .map(|list| list.iter().map(|f| f.peer()).collect())
            .unwrap_or_default()
    }

    /// Peer serving the header flight at `height`.
    pub fn header_flight_peer(&self, height: u32) -> Option<PeerId> {
        self.flights.lock().headers.get(&height).map(|f| f.peer())
    }

    pub fn cached_block_count(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn node_count(&self) -> usize {
        self.weights.lock().len()
    }

    pub fn node_weight(&self, id: &PeerId) -> Option<NodeWeight> {
        self.weights.lock().get(id).cloned()
    }

    /// Connected sync sources with their advertised heights, best first.
    fn ranked_peers(&self) -> Vec<(PeerId, u64)> {
        let now = Instant::now();
        let mut weights: Vec<NodeWeight> = self.weights.lock().values().cloned().collect();
        weights.sort_by(|a, b| a.rank(b, now));
        weights
            .into_iter()
            .filter_map(|w| self.net.peer_height(&w.id()).map(|h| (w.id(), h)))
            .collect()
    }

    fn next_node(&self, height: u32, exclude: &[PeerId]) -> Option<PeerId> {
        self.ranked_peers()
            .into_iter()
            .find(|(id, h)| *h >= u64::from(height) && !exclude.contains(id))
            .map(|(id, _)| id)
    }

    fn send_request(&self, peer: PeerId, msg: Message) -> bool {
        match self.net.send_to(&peer, msg) {
            Ok(()) => {
                if let Some(w) = self.weights.lock().get_mut(&peer) {
                    w.append_req_time(Instant::now());
                }
                true
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "sync request not sent");
                false
            }
        }
    }

    fn penalize(&self, peer: &PeerId) {
        let evict = match self.weights.lock().get_mut(peer) {
            Some(w) => {
                w.add_error_resp();
                w.error_resp_cnt() >= self.config.max_error_resp
            }
            None => false,
        };
        if evict {
            self.del_node(peer);
        }
    }

    /// Nudge peers that fell behind us, but only while we are near the top.
    fn ping_outsync_nodes(&self, height: u32) {
        let ids: Vec<PeerId> = self.weights.lock().keys().copied().collect();
        let height = u64::from(height);
        let mut max_height = height;
        let mut lagging = Vec::new();
        for id in ids {
            let Some(peer_height) = self.net.peer_height(&id) else {
                continue;
            };
            max_height = max_height.max(peer_height);
            if peer_height < height {
                lagging.push(id);
            }
        }
        if height > max_height.saturating_sub(self.config.max_height_offset) {
            for id in lagging {
                if let Err(e) = self.net.send_to(&id, Message::Ping { height }) {
                    tracing::debug!(peer = %id, error = %e, "catch-up ping failed");
                }
            }
        }
    }
}
