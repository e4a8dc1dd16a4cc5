//! Nullable network: records messages instead of sending them.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use meridian_messages::Message;
use meridian_network::{Network, NetworkError};
use meridian_protocol::{PeerInfo, PROTOCOL_VERSION, SOFT_VERSION};
use meridian_types::PeerId;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Default sync port of peers created by [`peer_info`].
pub const NULL_PEER_PORT: u16 = 20338;

/// A `PeerInfo` for `id` at `ip`, connected from an ephemeral port.
pub fn peer_info(id: PeerId, ip: IpAddr, height: u64) -> PeerInfo {
    PeerInfo {
        id,
        version: PROTOCOL_VERSION,
        services: 1,
        relay: true,
        http_info_port: 0,
        port: NULL_PEER_PORT,
        height,
        soft_version: SOFT_VERSION.to_string(),
        addr: SocketAddr::new(ip, 40_000),
    }
}

struct NullPeer {
    info: PeerInfo,
    last_contact: Instant,
}

/// A [`Network`] whose peers are whatever the test adds.
pub struct NullNetwork {
    local: PeerId,
    local_height: AtomicU64,
    peers: Mutex<HashMap<PeerId, NullPeer>>,
    sent: Mutex<Vec<(PeerId, Message)>>,
    dialed: Mutex<Vec<String>>,
    disconnected: Mutex<Vec<PeerId>>,
    unreachable: Mutex<HashSet<PeerId>>,
    outbound: AtomicUsize,
    next_ip: AtomicU64,
}

impl NullNetwork {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            local_height: AtomicU64::new(0),
            peers: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            dialed: Mutex::new(Vec::new()),
            disconnected: Mutex::new(Vec::new()),
            unreachable: Mutex::new(HashSet::new()),
            outbound: AtomicUsize::new(0),
            next_ip: AtomicU64::new(1),
        }
    }

    /// Connect a peer at the next free `10.0.x.y` address.
    pub fn add_peer(&self, id: PeerId, height: u64) -> PeerInfo {
        let n = self.next_ip.fetch_add(1, Ordering::SeqCst);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, (n >> 8) as u8, n as u8));
        let info = peer_info(id, ip, height);
        self.add_peer_info(info.clone());
        info
    }

    pub fn add_peer_info(&self, info: PeerInfo) {
        self.peers.lock().insert(
            info.id,
            NullPeer {
                info,
                last_contact: Instant::now(),
            },
        );
    }

    pub fn remove_peer(&self, id: &PeerId) {
        self.peers.lock().remove(id);
    }

    pub fn set_last_contact(&self, id: &PeerId, at: Instant) {
        if let Some(peer) = self.peers.lock().get_mut(id) {
            peer.last_contact = at;
        }
    }

    /// Make sends to `id` fail with a full queue.
    pub fn set_unreachable(&self, id: PeerId) {
        self.unreachable.lock().insert(id);
    }

    pub fn set_outbound_count(&self, n: usize) {
        self.outbound.store(n, Ordering::SeqCst);
    }

    /// Every message sent so far, in order.
    pub fn sent(&self) -> Vec<(PeerId, Message)> {
        self.sent.lock().clone()
    }

    /// Drain the sent log.
    pub fn take_sent(&self) -> Vec<(PeerId, Message)> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent_to(&self, id: &PeerId) -> Vec<Message> {
        self.sent
            .lock()
            .iter()
            .filter(|(to, _)| to == id)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().clone()
    }

    pub fn disconnected(&self) -> Vec<PeerId> {
        self.disconnected.lock().clone()
    }
}

impl Network for NullNetwork {
    fn local_id(&self) -> PeerId {
        self.local
    }

    fn local_height(&self) -> u64 {
        self.local_height.load(Ordering::SeqCst)
    }

    fn set_local_height(&self, height: u64) {
        self.local_height.store(height, Ordering::SeqCst);
    }

    fn peer_info(&self, id: &PeerId) -> Option<PeerInfo> {
        self.peers.lock().get(id).map(|p| p.info.clone())
    }

    fn peer_height(&self, id: &PeerId) -> Option<u64> {
        self.peers.lock().get(id).map(|p| p.info.height)
    }

    fn set_peer_height(&self, id: &PeerId, height: u64) {
        if let Some(peer) = self.peers.lock().get_mut(id) {
            peer.info.height = height;
        }
    }

    fn last_contact(&self, id: &PeerId) -> Option<Instant> {
        self.peers.lock().get(id).map(|p| p.last_contact)
    }

    fn send_to(&self, id: &PeerId, msg: Message) -> Result<(), NetworkError> {
        if !self.peers.lock().contains_key(id) {
            return Err(NetworkError::PeerNotFound(*id));
        }
        if self.unreachable.lock().contains(id) {
            return Err(NetworkError::SendQueueFull(*id));
        }
        self.sent.lock().push((*id, msg));
        Ok(())
    }

    fn connected_peers(&self) -> Vec<PeerInfo> {
        self.peers.lock().values().map(|p| p.info.clone()).collect()
    }

    fn is_connected(&self, id: &PeerId) -> bool {
        self.peers.lock().contains_key(id)
    }

    fn outbound_count(&self) -> usize {
        self.outbound.load(Ordering::SeqCst)
    }

    fn connect(&self, addr: String) {
        self.dialed.lock().push(addr);
    }

    fn disconnect(&self, id: &PeerId) {
        self.peers.lock().remove(id);
        self.disconnected.lock().push(*id);
    }
}
