//! Owns every live session and implements [`Network`] for the services.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use meridian_messages::Message;
use meridian_protocol::PeerInfo;
use meridian_types::PeerId;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::connect_controller::{Conn, ConnectController};
use crate::net::{Inbound, Network};
use crate::peer::{Peer, DEFAULT_SEND_QUEUE};
use crate::transport::Listener;
use crate::NetworkError;

/// Capacity of the queue feeding the message router.
pub const DEFAULT_ROUTER_QUEUE: usize = 4096;

#[derive(Clone, Debug)]
pub struct NetServerOptions {
    pub magic: u32,
    pub send_queue: usize,
    pub router_queue: usize,
}

impl NetServerOptions {
    pub fn new(magic: u32) -> Self {
        Self {
            magic,
            send_queue: DEFAULT_SEND_QUEUE,
            router_queue: DEFAULT_ROUTER_QUEUE,
        }
    }
}

/// Connection counters read by the metrics exporter.
#[derive(Debug, Default)]
pub struct NetStats {
    pub rejected_connections: AtomicU64,
    pub handshake_failures: AtomicU64,
}

pub struct NetServer {
    me: Weak<NetServer>,
    controller: Arc<ConnectController>,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    router_tx: mpsc::Sender<Inbound>,
    options: NetServerOptions,
    cancel: CancellationToken,
    stats: NetStats,
}

impl NetServer {
    pub fn new(
        controller: Arc<ConnectController>,
        options: NetServerOptions,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Inbound>) {
        let (router_tx, router_rx) = mpsc::channel(options.router_queue);
        let server = Arc::new_cyclic(|me| NetServer {
            me: me.clone(),
            controller,
            peers: RwLock::new(HashMap::new()),
            router_tx,
            options,
            cancel,
            stats: NetStats::default(),
        });
        (server, router_rx)
    }

    pub fn controller(&self) -> &Arc<ConnectController> {
        &self.controller
    }

    pub fn stats(&self) -> &NetStats {
        &self.stats
    }

    pub fn inbound_count(&self) -> usize {
        self.controller.inbound_count()
    }

    pub fn peer(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.read().get(id).cloned()
    }

    /// Accept connections until the server is cancelled.
    pub fn start_listener(&self, listener: Arc<dyn Listener>) -> JoinHandle<()> {
        let me = self.me.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let raw = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = listener.accept() => res,
                };
                let Some(server) = me.upgrade() else { break };
                match raw {
                    Ok(raw) => {
                        tokio::spawn(async move {
                            let remote = raw.remote_addr;
                            match server.controller.accept_connect(raw).await {
                                Ok((info, conn)) => server.register(info, conn).await,
                                Err(e) => server.record_failure(&remote.to_string(), &e),
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
            tracing::debug!("listener stopped");
        })
    }

    /// Dial, handshake and register a peer.
    pub async fn connect_addr(&self, addr: &str) -> Result<PeerInfo, NetworkError> {
        match self.controller.connect(addr).await {
            Ok((info, conn)) => {
                self.register(info.clone(), conn).await;
                Ok(info)
            }
            Err(e) => {
                self.record_failure(addr, &e);
                Err(e)
            }
        }
    }

    fn record_failure(&self, addr: &str, err: &NetworkError) {
        match err {
            NetworkError::Protocol(_) => {
                self.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
            }
        }
        tracing::debug!(addr = %addr, error = %err, "connection not admitted");
    }

    async fn register(&self, info: PeerInfo, conn: Conn) {
        let id = info.id;
        let (peer, session) = Peer::new(conn, info.clone(), self.options.send_queue);

        let old = self.peers.write().insert(id, Arc::clone(&peer));
        if let Some(old) = old {
            tracing::info!(peer = %id, "replacing existing session");
            old.close();
        }

        if self.router_tx.send(Inbound::PeerConnected(info)).await.is_err() {
            peer.close();
        }

        let handle = session.spawn(self.options.magic, self.router_tx.clone());
        let me = self.me.clone();
        tokio::spawn(async move {
            let _ = handle.await;
            if let Some(server) = me.upgrade() {
                server.on_session_closed(peer).await;
            }
        });
    }

    async fn on_session_closed(&self, peer: Arc<Peer>) {
        let id = peer.id();
        let removed = {
            let mut peers = self.peers.write();
            match peers.get(&id) {
                Some(current) if Arc::ptr_eq(current, &peer) => peers.remove(&id),
                _ => None,
            }
        };
        if removed.is_some() {
            let _ = self
                .router_tx
                .send(Inbound::PeerDisconnected(peer.info()))
                .await;
        }
    }

    /// Close every session.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let peers: Vec<_> = self.peers.read().values().cloned().collect();
        for peer in peers {
            peer.close();
        }
    }
}

impl Network for NetServer {
    fn local_id(&self) -> PeerId {
        self.controller.local_id()
    }

    fn local_height(&self) -> u64 {
        self.controller.local_info().height
    }

    fn set_local_height(&self, height: u64) {
        self.controller.set_local_height(height);
    }

    fn peer_info(&self, id: &PeerId) -> Option<PeerInfo> {
        self.peer(id).map(|p| p.info())
    }

    fn peer_height(&self, id: &PeerId) -> Option<u64> {
        self.peer(id).map(|p| p.height())
    }

    fn set_peer_height(&self, id: &PeerId, height: u64) {
        if let Some(peer) = self.peer(id) {
            peer.set_height(height);
        }
    }

    fn last_contact(&self, id: &PeerId) -> Option<Instant> {
        self.peer(id).map(|p| p.last_contact())
    }

    fn send_to(&self, id: &PeerId, msg: Message) -> Result<(), NetworkError> {
        let peer = self.peer(id).ok_or(NetworkError::PeerNotFound(*id))?;
        peer.send(msg)
    }

    fn connected_peers(&self) -> Vec<PeerInfo> {
        self.peers.read().values().map(|p| p.info()).collect()
    }

    fn is_connected(&self, id: &PeerId) -> bool {
        self.peers.read().contains_key(id)
    }

    fn outbound_count(&self) -> usize {
        self.controller.outbound_count()
    }

    fn connect(&self, addr: String) {
        let Some(server) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = server.connect_addr(&addr).await {
                tracing::debug!(addr = %addr, error = %e, "dial failed");
            }
        });
    }

    fn disconnect(&self, id: &PeerId) {
        if let Some(peer) = self.peer(id) {
            peer.close();
        }
    }
}
