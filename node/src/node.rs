//! The meridian P2P node: wires the network services together and owns
//! their background tasks.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use meridian_crypto::PeerKeyId;
use meridian_network::dht::BUCKET_SIZE;
use meridian_network::{
    BlockSyncMgr, ConnCtrlOption, ConnectController, Dht, Dialer, Discovery, Inbound, Keepalive,
    Ledger, Listener, MatchNone, MessageRouter, NetServer, NetServerOptions, Network,
    PayloadSink, ReconnectService,
};
use meridian_protocol::{HandshakeOptions, PeerInfo, PROTOCOL_VERSION};
use meridian_types::PeerId;

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::metrics::P2pMetrics;
use crate::shutdown::ShutdownController;

/// Timeout for waiting on background tasks during shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
/// How often the metrics gauges are refreshed.
const METRICS_INTERVAL: Duration = Duration::from_secs(5);
/// Services bit advertised in the handshake.
const SERVICE_NODE: u64 = 1;

pub struct P2pNode {
    config: NodeConfig,
    ledger: Arc<dyn Ledger>,
    server: Arc<NetServer>,
    sync: Arc<BlockSyncMgr>,
    discovery: Arc<Discovery>,
    keepalive: Arc<Keepalive>,
    reconnect: Arc<ReconnectService>,
    router: Arc<MessageRouter>,
    metrics: Arc<P2pMetrics>,
    shutdown: ShutdownController,
    inbound: Mutex<Option<mpsc::Receiver<Inbound>>>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl P2pNode {
    pub fn new(
        config: NodeConfig,
        key: PeerKeyId,
        ledger: Arc<dyn Ledger>,
        payloads: Arc<dyn PayloadSink>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self, NodeError> {
        let conn = &config.connection;
        let local = PeerInfo {
            id: key.id,
            version: PROTOCOL_VERSION,
            services: SERVICE_NODE,
            relay: true,
            http_info_port: config.http_info_port,
            port: config.listen_port,
            height: u64::from(ledger.current_block_height()),
            soft_version: config.soft_version.clone(),
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.listen_port),
        };

        let mut handshake = HandshakeOptions::new(config.network.magic(), config.identity_difficulty);
        handshake.timeout = conn.handshake_timeout();

        let mut option = ConnCtrlOption::new()
            .max_in_bound(conn.max_in_bound)
            .max_out_bound(conn.max_out_bound)
            .max_in_bound_per_ip(conn.max_in_bound_per_ip)
            .with_dialer(dialer);
        if conn.reserved_only {
            option = option.reserved_only(conn.reserved_peers.clone());
        }

        let shutdown = ShutdownController::new();
        let controller = ConnectController::new(local, key, handshake, option);
        let (server, inbound) = NetServer::new(
            controller,
            NetServerOptions::new(config.network.magic()),
            shutdown.token(),
        );
        let net = Arc::clone(&server) as Arc<dyn Network>;

        let dht = Arc::new(Dht::with_options(
            server.local_id(),
            BUCKET_SIZE,
            config.discovery.refresh_interval(),
        ));
        let discovery = Arc::new(
            Discovery::new(dht, Arc::clone(&net))
                .with_mask(&config.discovery.mask_peers, Arc::new(MatchNone)),
        );
        let sync = Arc::new(BlockSyncMgr::new(
            Arc::clone(&net),
            Arc::clone(&ledger),
            config.sync.to_sync_config(),
        ));
        let keepalive = Arc::new(Keepalive::with_intervals(
            Arc::clone(&net),
            Arc::clone(&ledger),
            conn.heartbeat_interval(),
            conn.keepalive_timeout(),
        ));
        let reconnect = Arc::new(
            ReconnectService::new(Arc::clone(&net), config.seeds.clone())
                .with_min_outbound(conn.min_outbound)
                .with_interval(conn.reconnect_interval()),
        );
        let router = Arc::new(MessageRouter::new(
            net,
            Arc::clone(&ledger),
            Arc::clone(&sync),
            Arc::clone(&discovery),
            Arc::clone(&reconnect),
            payloads,
        ));

        Ok(Self {
            config,
            ledger,
            server,
            sync,
            discovery,
            keepalive,
            reconnect,
            router,
            metrics: Arc::new(P2pMetrics::new()?),
            shutdown,
            inbound: Mutex::new(Some(inbound)),
            task_handles: Mutex::new(Vec::new()),
        })
    }

    /// Accept on `listener` and start every background service.
    pub fn start(&self, listener: Arc<dyn Listener>) -> Result<(), NodeError> {
        let inbound = self.inbound.lock().take().ok_or(NodeError::AlreadyStarted)?;
        let cancel = self.shutdown.token();

        tracing::info!(
            id = %self.id(),
            network = ?self.config.network,
            port = self.config.listen_port,
            height = self.ledger.current_block_height(),
            "meridian node starting"
        );

        let mut handles = vec![
            self.server.start_listener(listener),
            self.router.start(inbound, cancel.clone()),
            self.sync.start(cancel.clone()),
            self.keepalive.start(cancel.clone()),
            self.reconnect.start(cancel.clone()),
        ];
        handles.extend(self.discovery.start(cancel.clone()));
        if self.config.enable_metrics {
            handles.push(self.spawn_metrics_loop());
        }
        self.task_handles.lock().extend(handles);
        Ok(())
    }

    fn spawn_metrics_loop(&self) -> JoinHandle<()> {
        let metrics = Arc::clone(&self.metrics);
        let server = Arc::clone(&self.server);
        let sync = Arc::clone(&self.sync);
        let ledger = Arc::clone(&self.ledger);
        let cancel = self.shutdown.token();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(METRICS_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => metrics.sample(&server, &sync, ledger.as_ref()),
                }
            }
            tracing::debug!("metrics loop stopped");
        })
    }

    /// Cancel every service, close all sessions and wait for the tasks.
    pub async fn stop(&self) {
        tracing::info!("meridian node stopping");
        self.shutdown.shutdown();
        self.server.shutdown();

        let handles: Vec<_> = self.task_handles.lock().drain(..).collect();
        let wait_all = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "background task ended abnormally");
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, wait_all).await.is_err() {
            tracing::warn!(timeout = ?SHUTDOWN_TIMEOUT, "some tasks are still running");
        }

        self.metrics
            .sample(&self.server, &self.sync, self.ledger.as_ref());
        tracing::info!("meridian node stopped");
    }

    /// Resolves once [`stop`](Self::stop) has been requested or a signal arrived.
    pub async fn wait_for_signal(&self) {
        self.shutdown.wait_for_signal().await;
    }

    pub fn id(&self) -> PeerId {
        self.server.local_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn server(&self) -> &Arc<NetServer> {
        &self.server
    }

    pub fn sync(&self) -> &Arc<BlockSyncMgr> {
        &self.sync
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }

    pub fn metrics(&self) -> &Arc<P2pMetrics> {
        &self.metrics
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutting_down()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_network::DiscardPayloads;
    use meridian_nullables::{build_chain, MemoryNetwork, NullLedger};

    fn node(mem: &Arc<MemoryNetwork>, ledger: NullLedger) -> P2pNode {
        let config = NodeConfig {
            identity_difficulty: 1,
            ..NodeConfig::default()
        };
        P2pNode::new(
            config,
            PeerKeyId::generate(1),
            Arc::new(ledger),
            Arc::new(DiscardPayloads),
            Arc::new(mem.dialer(IpAddr::from([10, 0, 0, 1]))),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn local_info_reflects_config_and_ledger() {
        let mem = MemoryNetwork::new();
        let node = node(&mem, NullLedger::with_blocks(&build_chain(3, |_| false)));
        let info = node.server().controller().local_info();
        assert_eq!(info.height, 3);
        assert_eq!(info.port, 20538);
        assert_eq!(info.soft_version, meridian_protocol::SOFT_VERSION);
        assert_eq!(node.id(), info.id);
    }

    #[tokio::test]
    async fn second_start_is_refused() {
        let mem = MemoryNetwork::new();
        let node = node(&mem, NullLedger::new());
        let addr = SocketAddr::new(IpAddr::from([10, 0, 0, 1]), 20538);
        node.start(Arc::new(mem.listen(addr))).unwrap();
        let other = SocketAddr::new(IpAddr::from([10, 0, 0, 1]), 20539);
        let again = node.start(Arc::new(mem.listen(other)));
        assert!(matches!(again, Err(NodeError::AlreadyStarted)));

        node.stop().await;
        assert!(node.is_shutting_down());
    }
}
