//! Connection admission.
//!
//! Every inbound and outbound connection passes through the controller: a
//! pre-check before the handshake (reserved list, duplicates, self address,
//! bound limits, per-IP inbound cap), the handshake itself, and a post-check
//! after it (self handshake, same id from a different IP). Admitted
//! connections are wrapped in a [`Conn`] whose close removes them from the
//! bookkeeping exactly once.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use meridian_crypto::PeerKeyId;
use meridian_protocol::{handshake_client, handshake_server, HandshakeOptions, PeerInfo};
use meridian_types::PeerId;
use parking_lot::{Mutex, RwLock};

use crate::transport::{AsyncStream, Dialer, RawConnection, TcpDialer};
use crate::NetworkError;

pub const DEFAULT_MAX_CONN_IN_BOUND: usize = 1024;
pub const DEFAULT_MAX_CONN_OUT_BOUND: usize = 1024;
pub const DEFAULT_MAX_CONN_IN_BOUND_PER_IP: usize = 16;

/// Predicate over `ip:port` address strings.
pub trait AddressFilter: Send + Sync {
    fn contains(&self, addr: &str) -> bool;
}

/// Matches every address.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl AddressFilter for AllowAll {
    fn contains(&self, _addr: &str) -> bool {
        true
    }
}

/// Matches no address.
#[derive(Clone, Copy, Debug, Default)]
pub struct MatchNone;

impl AddressFilter for MatchNone {
    fn contains(&self, _addr: &str) -> bool {
        false
    }
}

/// Reserved-peer list of IPs and domain names.
///
/// An empty list allows everything. Otherwise an address matches when its
/// IP equals a listed IP or one that a listed domain resolved to when the
/// filter was built.
#[derive(Clone, Debug, Default)]
pub struct StaticReserveFilter {
    pub reserved_peers: Vec<String>,
    ips: HashSet<IpAddr>,
}

impl StaticReserveFilter {
    pub fn new(reserved_peers: Vec<String>) -> Self {
        let mut ips = HashSet::new();
        for entry in &reserved_peers {
            if let Ok(ip) = entry.parse::<IpAddr>() {
                ips.insert(ip);
                continue;
            }
            match (entry.as_str(), 0).to_socket_addrs() {
                Ok(resolved) => ips.extend(resolved.map(|a| a.ip())),
                Err(e) => tracing::warn!(domain = %entry, error = %e, "cannot resolve reserved peer"),
            }
        }
        Self { reserved_peers, ips }
    }
}

impl AddressFilter for StaticReserveFilter {
    fn contains(&self, addr: &str) -> bool {
        if self.reserved_peers.is_empty() {
            return true;
        }
        match parse_ip(addr) {
            Some(ip) => self.ips.contains(&ip),
            None => false,
        }
    }
}

/// Extract the IP of an `ip:port` string.
pub fn parse_ip(addr: &str) -> Option<IpAddr> {
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        return Some(sock.ip());
    }
    addr.parse::<IpAddr>().ok()
}

#[derive(Clone)]
pub struct ConnCtrlOption {
    pub max_conn_out_bound: usize,
    pub max_conn_in_bound: usize,
    pub max_conn_in_bound_per_ip: usize,
    pub reserved_peers: Arc<dyn AddressFilter>,
    pub dialer: Arc<dyn Dialer>,
}

impl ConnCtrlOption {
    pub fn new() -> Self {
        Self {
            max_conn_out_bound: DEFAULT_MAX_CONN_OUT_BOUND,
            max_conn_in_bound: DEFAULT_MAX_CONN_IN_BOUND,
            max_conn_in_bound_per_ip: DEFAULT_MAX_CONN_IN_BOUND_PER_IP,
            reserved_peers: Arc::new(AllowAll),
            dialer: Arc::new(TcpDialer::default()),
        }
    }

    pub fn max_out_bound(mut self, n: usize) -> Self {
        self.max_conn_out_bound = n;
        self
    }

    pub fn max_in_bound(mut self, n: usize) -> Self {
        self.max_conn_in_bound = n;
        self
    }

    pub fn max_in_bound_per_ip(mut self, n: usize) -> Self {
        self.max_conn_in_bound_per_ip = n;
        self
    }

    pub fn reserved_only(mut self, peers: Vec<String>) -> Self {
        self.reserved_peers = Arc::new(StaticReserveFilter::new(peers));
        self
    }

    pub fn with_reserved_filter(mut self, filter: Arc<dyn AddressFilter>) -> Self {
        self.reserved_peers = filter;
        self
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }
}

impl Default for ConnCtrlOption {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnCtrlOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnCtrlOption")
            .field("max_conn_out_bound", &self.max_conn_out_bound)
            .field("max_conn_in_bound", &self.max_conn_in_bound)
            .field("max_conn_in_bound_per_ip", &self.max_conn_in_bound_per_ip)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

struct ConnectedPeer {
    connect_id: u64,
    addr: String,
}

#[derive(Default)]
struct ControllerState {
    inbound: HashSet<String>,
    outbound: HashSet<String>,
    inbound_listen: HashSet<String>,
    connecting: HashSet<String>,
    peers: HashMap<PeerId, ConnectedPeer>,
    own_listen_addr: String,
}

impl ControllerState {
    fn bound(&self, direction: Direction) -> &HashSet<String> {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    fn bound_mut(&mut self, direction: Direction) -> &mut HashSet<String> {
        match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        }
    }
}

pub struct ConnectController {
    option: ConnCtrlOption,
    key: PeerKeyId,
    local_info: RwLock<PeerInfo>,
    handshake: HandshakeOptions,
    state: Mutex<ControllerState>,
    next_connect_id: AtomicU64,
}

impl ConnectController {
    pub fn new(
        local_info: PeerInfo,
        key: PeerKeyId,
        handshake: HandshakeOptions,
        option: ConnCtrlOption,
    ) -> Arc<Self> {
        Arc::new(Self {
            option,
            key,
            local_info: RwLock::new(local_info),
            handshake,
            state: Mutex::new(ControllerState::default()),
            next_connect_id: AtomicU64::new(0),
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.key.id
    }

    pub fn local_info(&self) -> PeerInfo {
        self.local_info.read().clone()
    }

    /// Height announced in future handshakes.
    pub fn set_local_height(&self, height: u64) {
        self.local_info.write().height = height;
    }

    pub fn own_address(&self) -> String {
        self.state.lock().own_listen_addr.clone()
    }

    pub fn set_own_address(&self, addr: String) {
        self.state.lock().own_listen_addr = addr;
    }

    pub fn inbound_count(&self) -> usize {
        self.state.lock().inbound.len()
    }

    pub fn outbound_count(&self) -> usize {
        self.state.lock().outbound.len()
    }

    pub fn is_connected(&self, id: &PeerId) -> bool {
        self.state.lock().peers.contains_key(id)
    }

    /// Admit an inbound connection.
    pub async fn accept_connect(
        self: &Arc<Self>,
        raw: RawConnection,
    ) -> Result<(PeerInfo, Conn), NetworkError> {
        let RawConnection {
            mut stream,
            remote_addr,
        } = raw;
        let addr = remote_addr.to_string();
        self.before_handshake_check(&addr, Direction::Inbound)?;

        let local = self.local_info();
        let info =
            handshake_server(&mut stream, &local, &self.key, remote_addr, &self.handshake).await?;

        self.after_handshake_check(&info, &addr)?;
        let conn = self.save_peer(stream, &info, addr, Direction::Inbound)?;
        tracing::info!(peer = %info.id, addr = %remote_addr, "inbound peer connected");
        Ok((info, conn))
    }

    /// Dial and admit an outbound connection.
    pub async fn connect(self: &Arc<Self>, addr: &str) -> Result<(PeerInfo, Conn), NetworkError> {
        self.before_handshake_check(addr, Direction::Outbound)?;
        let _connecting = ConnectingGuard::claim(self, addr)?;

        let RawConnection {
            mut stream,
            remote_addr,
        } = self.option.dialer.dial(addr).await?;

        let local = self.local_info();
        let info =
            handshake_client(&mut stream, &local, &self.key, remote_addr, &self.handshake).await?;

        let remote = remote_addr.to_string();
        self.after_handshake_check(&info, &remote)?;
        let conn = self.save_peer(stream, &info, remote, Direction::Outbound)?;
        tracing::info!(peer = %info.id, addr = %remote_addr, "outbound peer connected");
        Ok((info, conn))
    }

    fn before_handshake_check(&self, addr: &str, direction: Direction) -> Result<(), NetworkError> {
        if !self.option.reserved_peers.contains(addr) {
            return Err(NetworkError::NotReserved(addr.to_string()));
        }
        let state = self.state.lock();
        self.check_slot(&state, addr, direction)
    }

    /// Whether `addr` may take a `direction` slot given the current state.
    ///
    /// Runs before the handshake and again when the peer is saved, so
    /// handshakes that overlap cannot push past the limits together.
    fn check_slot(
        &self,
        state: &ControllerState,
        addr: &str,
        direction: Direction,
    ) -> Result<(), NetworkError> {
        if state.inbound.contains(addr)
            || state.outbound.contains(addr)
            || state.inbound_listen.contains(addr)
        {
            return Err(NetworkError::AlreadyConnected(addr.to_string()));
        }
        if state.own_listen_addr == addr {
            return Err(NetworkError::SelfAddress(addr.to_string()));
        }

        let max = match direction {
            Direction::Inbound => self.option.max_conn_in_bound,
            Direction::Outbound => self.option.max_conn_out_bound,
        };
        if state.bound(direction).len() >= max {
            return Err(NetworkError::BoundFull {
                direction: direction.as_str(),
            });
        }

        if direction == Direction::Inbound {
            let ip = parse_ip(addr).ok_or_else(|| NetworkError::InvalidAddress(addr.to_string()))?;
            let count = state
                .inbound
                .iter()
                .filter(|a| parse_ip(a) == Some(ip))
                .count();
            if count >= self.option.max_conn_in_bound_per_ip {
                return Err(NetworkError::PerIpLimit {
                    count,
                    ip,
                    max: self.option.max_conn_in_bound_per_ip,
                });
            }
        }
        Ok(())
    }

    fn after_handshake_check(&self, remote: &PeerInfo, addr: &str) -> Result<(), NetworkError> {
        let ip = parse_ip(addr).ok_or_else(|| NetworkError::InvalidAddress(addr.to_string()))?;
        if remote.id.to_u64() == self.key.id.to_u64() {
            let own = SocketAddr::new(ip, remote.port).to_string();
            tracing::info!(addr = %own, "detected own listen address");
            self.set_own_address(own);
            return Err(NetworkError::HandshakeSelf);
        }
        Ok(())
    }

    /// Same id from another IP is refused; from the same IP the newer
    /// connection replaces the old one.
    fn check_peer_id(
        state: &ControllerState,
        remote: &PeerInfo,
        addr: &str,
    ) -> Result<(), NetworkError> {
        let ip = parse_ip(addr).ok_or_else(|| NetworkError::InvalidAddress(addr.to_string()))?;
        if let Some(old) = state.peers.get(&remote.id) {
            let old_ip = parse_ip(&old.addr)
                .ok_or_else(|| NetworkError::InvalidAddress(old.addr.clone()))?;
            if old_ip != ip {
                let err = NetworkError::DuplicatePeerId { old: old_ip, new: ip };
                tracing::warn!(peer = %remote.id, error = %err, "rejecting connection");
                return Err(err);
            }
        }
        Ok(())
    }

    fn save_peer(
        self: &Arc<Self>,
        stream: Box<dyn AsyncStream>,
        info: &PeerInfo,
        addr: String,
        direction: Direction,
    ) -> Result<Conn, NetworkError> {
        let listen_addr = info.remote_listen_address();
        let connect_id = {
            let mut state = self.state.lock();
            self.check_slot(&state, &addr, direction)?;
            Self::check_peer_id(&state, info, &addr)?;
            let connect_id = self.next_connect_id.fetch_add(1, Ordering::SeqCst) + 1;
            state.bound_mut(direction).insert(addr.clone());
            if direction == Direction::Inbound {
                state.inbound_listen.insert(listen_addr.clone());
            }
            state.peers.insert(
                info.id,
                ConnectedPeer {
                    connect_id,
                    addr: addr.clone(),
                },
            );
            connect_id
        };

        Ok(Conn {
            stream,
            guard: Arc::new(ConnGuard {
                connect_id,
                peer_id: info.id,
                addr,
                listen_addr,
                direction,
                controller: Arc::clone(self),
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn remove_peer(&self, guard: &ConnGuard) {
        let mut state = self.state.lock();
        state.bound_mut(guard.direction).remove(&guard.addr);
        if guard.direction == Direction::Inbound {
            state.inbound_listen.remove(&guard.listen_addr);
        }

        match state.peers.get(&guard.peer_id) {
            None => {
                tracing::error!(peer = %guard.peer_id, "connection not in controller");
                debug_assert!(false, "connection {} not in controller", guard.peer_id);
            }
            Some(p) if p.connect_id == guard.connect_id => {
                state.peers.remove(&guard.peer_id);
            }
            // Replaced by a newer connection to the same peer.
            Some(_) => {}
        }
    }
}

/// Holds an address in the connecting set until dropped.
struct ConnectingGuard<'a> {
    controller: &'a ConnectController,
    addr: String,
}

impl<'a> ConnectingGuard<'a> {
    fn claim(controller: &'a ConnectController, addr: &str) -> Result<Self, NetworkError> {
        let mut state = controller.state.lock();
        if !state.connecting.insert(addr.to_string()) {
            return Err(NetworkError::AlreadyConnecting(addr.to_string()));
        }
        Ok(Self {
            controller,
            addr: addr.to_string(),
        })
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.controller.state.lock().connecting.remove(&self.addr);
    }
}

/// Bookkeeping handle of an admitted connection.
pub struct ConnGuard {
    connect_id: u64,
    peer_id: PeerId,
    addr: String,
    listen_addr: String,
    direction: Direction,
    controller: Arc<ConnectController>,
    closed: AtomicBool,
}

impl ConnGuard {
    pub fn connect_id(&self) -> u64 {
        self.connect_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remove the connection from the controller. Later calls do nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.controller.remove_peer(self);
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.close();
    }
}

/// An admitted connection: the handshaken stream plus its close guard.
pub struct Conn {
    stream: Box<dyn AsyncStream>,
    guard: Arc<ConnGuard>,
}

impl Conn {
    pub fn connect_id(&self) -> u64 {
        self.guard.connect_id
    }

    pub fn guard(&self) -> &Arc<ConnGuard> {
        &self.guard
    }

    pub fn close(&self) {
        self.guard.close();
    }

    pub fn into_parts(self) -> (Box<dyn AsyncStream>, Arc<ConnGuard>) {
        (self.stream, self.guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_filter_matches_exact_ip() {
        let filter = StaticReserveFilter::new(vec!["192.168.1.111".into()]);
        assert!(!filter.contains("192.168.1.1:1234"));
        assert!(!filter.contains("192.168.1.11:1234"));
        assert!(filter.contains("192.168.1.111:1234"));
    }

    #[test]
    fn empty_reserve_list_allows_all() {
        let filter = StaticReserveFilter::new(Vec::new());
        assert!(filter.contains("10.1.1.1:20338"));
    }

    #[test]
    fn reserve_filter_resolves_localhost() {
        let filter = StaticReserveFilter::new(vec!["localhost".into()]);
        assert!(filter.contains("127.0.0.1:20338") || filter.contains("[::1]:20338"));
    }

    #[test]
    fn option_builder_overrides_defaults() {
        let opt = ConnCtrlOption::new().max_in_bound(2).max_in_bound_per_ip(1);
        assert_eq!(opt.max_conn_in_bound, 2);
        assert_eq!(opt.max_conn_in_bound_per_ip, 1);
        assert_eq!(opt.max_conn_out_bound, DEFAULT_MAX_CONN_OUT_BOUND);
    }
}
