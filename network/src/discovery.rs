//! Kademlia-style peer discovery.
//!
//! Two loops keep the routing table populated: one asks the peers closest
//! to our own id for peers closer still, the other looks up a random id in
//! every bucket. Pseudo-id peers do not speak the DHT protocol and are asked
//! for their address list instead.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use meridian_messages::{FindNodeReq, FindNodeResp, Message, PeerAddr};
use meridian_protocol::PeerInfo;
use meridian_types::{PeerId, PeerIdAddressPair};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::connect_controller::{parse_ip, AddressFilter, MatchNone};
use crate::dht::{Dht, ALPHA};
use crate::net::Network;

/// Upper bound on addresses returned for one `AddrReq`.
pub const MAX_ADDR_NODE_CNT: usize = 64;

pub struct Discovery {
    dht: Arc<Dht>,
    net: Arc<dyn Network>,
    mask_set: HashSet<IpAddr>,
    mask_filter: Arc<dyn AddressFilter>,
}

impl Discovery {
    pub fn new(dht: Arc<Dht>, net: Arc<dyn Network>) -> Self {
        Self {
            dht,
            net,
            mask_set: HashSet::new(),
            mask_filter: Arc::new(MatchNone),
        }
    }

    /// Hide these peers from everybody who is not masked too.
    pub fn with_mask(mut self, mask_peers: &[String], mask_filter: Arc<dyn AddressFilter>) -> Self {
        self.mask_set = mask_peers
            .iter()
            .filter_map(|p| match parse_ip(p) {
                Some(ip) => Some(ip),
                None => {
                    tracing::warn!(entry = %p, "ignoring unparsable mask peer");
                    None
                }
            })
            .collect();
        self.mask_filter = mask_filter;
        self
    }

    pub fn dht(&self) -> &Arc<Dht> {
        &self.dht
    }

    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let period = self.dht.refresh_interval();
        let find_self = {
            let me = Arc::clone(self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut tick = interval_at(Instant::now() + period, period);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => me.find_self(),
                    }
                }
            })
        };
        let refresh = {
            let me = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = interval_at(Instant::now() + period, period);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => me.refresh_cpl(),
                    }
                }
            })
        };
        vec![find_self, refresh]
    }

    /// Ask the peers closest to us for peers closer still.
    pub fn find_self(&self) {
        let local = self.net.local_id();
        tracing::debug!("looking up own id");
        self.query_closer(local);
    }

    /// Look up one random id per bucket.
    pub fn refresh_cpl(&self) {
        for cpl in 0..self.dht.bucket_count() {
            let target = self.dht.gen_rand_kad_id(cpl);
            tracing::debug!(cpl, "refreshing bucket");
            self.query_closer(target);
        }
    }

    fn query_closer(&self, target: PeerId) {
        for pair in self.dht.better_peers(&target, ALPHA) {
            let msg = if pair.id.is_pseudo() {
                Message::AddrReq
            } else {
                Message::FindNodeReq(FindNodeReq { target_id: target })
            };
            if let Err(e) = self.net.send_to(&pair.id, msg) {
                tracing::debug!(peer = %pair.id, error = %e, "discovery query not sent");
            }
        }
    }

    pub fn on_add_peer(&self, info: &PeerInfo) {
        if let Err(e) = self.dht.update(info.id, info.remote_listen_address()) {
            tracing::debug!(peer = %info.id, error = %e, "peer not added to routing table");
        }
    }

    pub fn on_del_peer(&self, info: &PeerInfo) {
        self.dht.remove(&info.id);
    }

    pub fn handle_find_node_req(&self, from: PeerId, req: FindNodeReq) {
        let local = self.net.local_id();
        let resp = if req.target_id == local {
            // the requester is already connected to us, no address needed
            FindNodeResp {
                target_id: req.target_id,
                success: true,
                address: String::new(),
                closer_peers: Vec::new(),
            }
        } else {
            let mut closer = self.dht.better_peers(&req.target_id, ALPHA);
            if !self.sees_masked(&from) {
                closer.retain(|pair| !self.is_masked_pair(pair));
            }
            tracing::debug!(peer = %from, found = closer.len(), "answering find node");
            FindNodeResp {
                target_id: req.target_id,
                success: false,
                address: String::new(),
                closer_peers: closer,
            }
        };
        if let Err(e) = self.net.send_to(&from, Message::FindNodeResp(resp)) {
            tracing::warn!(peer = %from, error = %e, "find node response not sent");
        }
    }

    pub fn handle_find_node_resp(&self, resp: FindNodeResp) {
        if resp.success {
            tracing::debug!(target = %resp.target_id, "find node succeeded");
            return;
        }
        let local = self.net.local_id();
        for pair in resp.closer_peers {
            if pair.id == local || self.net.is_connected(&pair.id) {
                continue;
            }
            tracing::debug!(peer = %pair.id, addr = %pair.address, "dialing closer peer");
            self.net.connect(pair.address);
        }
    }

    pub fn handle_addr_req(&self, from: PeerId) {
        let mut addrs = self.neighbor_addresses();
        if !self.sees_masked(&from) {
            addrs.retain(|a| !self.is_masked(a.ip, &SocketAddr::new(a.ip, a.port).to_string()));
        }
        if let Err(e) = self.net.send_to(&from, Message::Addr(addrs)) {
            tracing::warn!(peer = %from, error = %e, "address list not sent");
        }
    }

    pub fn handle_addr(&self, addrs: Vec<PeerAddr>) {
        let local = self.net.local_id();
        for addr in addrs {
            if addr.port == 0 || addr.id == local || self.dht.contains(&addr.id) {
                continue;
            }
            let address = SocketAddr::new(addr.ip, addr.port).to_string();
            tracing::debug!(addr = %address, "dialing advertised address");
            self.net.connect(address);
        }
    }

    fn neighbor_addresses(&self) -> Vec<PeerAddr> {
        self.dht
            .list_peers()
            .into_iter()
            .filter_map(|pair| {
                let sock: SocketAddr = pair.address.parse().ok()?;
                Some(PeerAddr {
                    ip: sock.ip(),
                    port: sock.port(),
                    id: pair.id,
                })
            })
            .take(MAX_ADDR_NODE_CNT)
            .collect()
    }

    /// Masked requesters are shown everything.
    fn sees_masked(&self, requester: &PeerId) -> bool {
        match self.net.peer_info(requester) {
            Some(info) => self.is_masked(info.addr.ip(), &info.remote_listen_address()),
            None => false,
        }
    }

    fn is_masked_pair(&self, pair: &PeerIdAddressPair) -> bool {
        match parse_ip(&pair.address) {
            Some(ip) => self.is_masked(ip, &pair.address),
            // unparsable addresses are never handed out
            None => true,
        }
    }

    fn is_masked(&self, ip: IpAddr, address: &str) -> bool {
        self.mask_set.contains(&ip) || self.mask_filter.contains(address)
    }
}
