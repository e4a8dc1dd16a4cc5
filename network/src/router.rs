//! Dispatches inbound events to the services that own them.

use std::sync::Arc;

use meridian_messages::{BlockMessage, DataReq, HeadersReq, Inventory, Message};
use meridian_types::{BlockHash, Header, PeerId, TxHash};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::block_sync::BlockSyncMgr;
use crate::cache::{RecentSet, ResponseCache, MAX_RESP_CACHE_SIZE, MAX_TX_CACHE_SIZE};
use crate::discovery::Discovery;
use crate::ledger::{Ledger, PayloadSink};
use crate::net::{Inbound, Network};
use crate::reconnect::ReconnectService;

/// Most headers returned for one `HeadersReq`.
pub const MAX_BLK_HDR_CNT: u32 = 500;

pub struct MessageRouter {
    net: Arc<dyn Network>,
    ledger: Arc<dyn Ledger>,
    sync: Arc<BlockSyncMgr>,
    discovery: Arc<Discovery>,
    reconnect: Arc<ReconnectService>,
    payloads: Arc<dyn PayloadSink>,
    tx_seen: Mutex<RecentSet<TxHash>>,
    responses: Mutex<ResponseCache<BlockHash, BlockMessage>>,
    last_inv: Mutex<Option<BlockHash>>,
}

impl MessageRouter {
    pub fn new(
        net: Arc<dyn Network>,
        ledger: Arc<dyn Ledger>,
        sync: Arc<BlockSyncMgr>,
        discovery: Arc<Discovery>,
        reconnect: Arc<ReconnectService>,
        payloads: Arc<dyn PayloadSink>,
    ) -> Self {
        Self {
            net,
            ledger,
            sync,
            discovery,
            reconnect,
            payloads,
            tx_seen: Mutex::new(RecentSet::new(MAX_TX_CACHE_SIZE)),
            responses: Mutex::new(ResponseCache::new(MAX_RESP_CACHE_SIZE)),
            last_inv: Mutex::new(None),
        }
    }

    /// Drain `inbound` until it closes or `cancel` fires.
    pub fn start(
        self: &Arc<Self>,
        mut inbound: mpsc::Receiver<Inbound>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = inbound.recv() => match event {
                        Some(event) => me.handle(event),
                        None => break,
                    },
                }
            }
            tracing::debug!("router stopped");
        })
    }

    pub fn handle(&self, event: Inbound) {
        match event {
            Inbound::Message { from, msg, size } => self.handle_message(from, msg, size),
            Inbound::PeerConnected(info) => {
                tracing::info!(peer = %info.id, addr = %info.addr, height = info.height, "peer connected");
                self.sync.on_add_node(info.id);
                self.discovery.on_add_peer(&info);
                self.reconnect.on_add_peer(&info);
            }
            Inbound::PeerDisconnected(info) => {
                tracing::info!(peer = %info.id, addr = %info.addr, "peer disconnected");
                self.sync.on_del_node(&info.id);
                self.discovery.on_del_peer(&info);
                self.reconnect.on_del_peer(&info);
            }
        }
    }

    fn handle_message(&self, from: PeerId, msg: Message, size: usize) {
        let kind = msg.message_type();
        tracing::trace!(peer = %from, kind = %kind, size, "message received");
        match msg {
            Message::AddrReq => self.discovery.handle_addr_req(from),
            Message::Addr(addrs) => self.discovery.handle_addr(addrs),
            Message::FindNodeReq(req) => self.discovery.handle_find_node_req(from, req),
            Message::FindNodeResp(resp) => self.discovery.handle_find_node_resp(resp),
            Message::HeadersReq(req) => self.on_headers_req(from, req),
            Message::Headers(headers) => self.sync.on_header_receive(from, headers),
            Message::Block(BlockMessage { block, aux }) => {
                self.sync.on_block_receive(from, size, block, aux)
            }
            Message::GetData(req) => self.on_data_req(from, req),
            Message::Inv(inv) => self.on_inv(from, inv),
            Message::Ping { height } => {
                self.net.set_peer_height(&from, height);
                let local = u64::from(self.ledger.current_block_height());
                self.net.set_local_height(local);
                self.reply(from, Message::Pong { height: local });
            }
            Message::Pong { height } => self.net.set_peer_height(&from, height),
            Message::Tx(tx) => {
                let hash = tx.hash();
                if self.tx_seen.lock().insert(hash) {
                    self.payloads.on_transaction(from, tx);
                } else {
                    tracing::trace!(peer = %from, tx = %hash, "duplicate transaction");
                }
            }
            Message::Consensus(payload) => self.payloads.on_consensus(from, payload),
            Message::Disconnect => {
                tracing::debug!(peer = %from, "peer asked to disconnect");
                self.net.disconnect(&from);
                self.discovery.dht().remove(&from);
            }
            Message::NotFound(req) => tracing::debug!(peer = %from, request = ?req, "not found"),
            Message::Version(_) | Message::VerAck => {
                tracing::info!(peer = %from, kind = %kind, "handshake message after handshake");
            }
            Message::UpdatePeerKeyId(_) => {
                tracing::warn!(peer = %from, "unexpected identity update");
            }
        }
    }

    fn on_headers_req(&self, from: PeerId, req: HeadersReq) {
        match self.headers_from_hash(&req.hash_start, &req.hash_end) {
            Some(headers) => self.reply(from, Message::Headers(headers)),
            None => tracing::warn!(
                peer = %from,
                start = %req.hash_start,
                stop = %req.hash_end,
                "cannot serve headers"
            ),
        }
    }

    /// Headers after `stop` (or before `start` when it is set), at most
    /// [`MAX_BLK_HDR_CNT`].
    pub fn headers_from_hash(&self, start: &BlockHash, stop: &BlockHash) -> Option<Vec<Header>> {
        let cur = self.ledger.current_header_height();
        let height_of = |hash: &BlockHash| self.ledger.header_by_hash(hash).map(|h| h.height);

        let (stop_height, count) = if start.is_zero() {
            if stop.is_zero() {
                (0, cur.min(MAX_BLK_HDR_CNT))
            } else {
                let stop_height = height_of(stop)?;
                (stop_height, cur.saturating_sub(stop_height).min(MAX_BLK_HDR_CNT))
            }
        } else {
            let start_height = height_of(start)?;
            if stop.is_zero() {
                (0, start_height.min(MAX_BLK_HDR_CNT))
            } else {
                let stop_height = height_of(stop)?;
                if start_height < stop_height {
                    return None;
                }
                let count = start_height - stop_height;
                if count >= MAX_BLK_HDR_CNT {
                    (start_height - MAX_BLK_HDR_CNT, MAX_BLK_HDR_CNT)
                } else {
                    (stop_height, count)
                }
            }
        };

        (1..=count)
            .map(|i| {
                let hash = self.ledger.block_hash(stop_height + i)?;
                self.ledger.header_by_hash(&hash)
            })
            .collect()
    }

    fn on_data_req(&self, from: PeerId, req: DataReq) {
        match req {
            DataReq::Block(hash) => {
                let cached = self.responses.lock().get(&hash);
                let msg = match cached {
                    Some(msg) => msg,
                    None => match self.ledger.block_by_hash(&hash) {
                        Some((block, aux)) => {
                            let msg = BlockMessage { block, aux };
                            self.responses.lock().put(hash, msg.clone());
                            msg
                        }
                        None => {
                            tracing::debug!(peer = %from, block = %hash, "block not found");
                            self.reply(from, Message::NotFound(req));
                            return;
                        }
                    },
                };
                self.reply(from, Message::Block(msg));
            }
            DataReq::Tx(hash) => match self.ledger.transaction(&hash) {
                Some(tx) => self.reply(from, Message::Tx(tx)),
                None => {
                    tracing::debug!(peer = %from, tx = %hash, "transaction not found");
                    self.reply(from, Message::NotFound(req));
                }
            },
        }
    }

    fn on_inv(&self, from: PeerId, inv: Inventory) {
        match inv {
            Inventory::Block(hashes) => {
                for hash in hashes {
                    if self.ledger.contains_block(&hash) {
                        continue;
                    }
                    {
                        let mut last = self.last_inv.lock();
                        if *last == Some(hash) {
                            continue;
                        }
                        *last = Some(hash);
                    }
                    tracing::info!(peer = %from, block = %hash, "requesting announced block");
                    self.reply(from, Message::GetData(DataReq::Block(hash)));
                }
            }
            Inventory::Tx(hashes) => {
                let Some(hash) = hashes.first().copied() else {
                    tracing::debug!(peer = %from, "empty inventory");
                    return;
                };
                if self.ledger.transaction(&hash).is_none() {
                    self.reply(from, Message::GetData(DataReq::Tx(hash)));
                }
            }
        }
    }

    fn reply(&self, to: PeerId, msg: Message) {
        if let Err(e) = self.net.send_to(&to, msg) {
            tracing::warn!(peer = %to, error = %e, "reply not sent");
        }
    }
}
