//! Two nodes talking over the in-memory transport.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use meridian_crypto::PeerKeyId;
use meridian_network::{DiscardPayloads, Ledger, Network};
use meridian_node::{NodeConfig, P2pNode};
use meridian_nullables::{build_chain, MemoryNetwork, NullLedger};

const PORT: u16 = 20538;

fn start_node(mem: &Arc<MemoryNetwork>, ip: [u8; 4], ledger: NullLedger) -> P2pNode {
    let mut config = NodeConfig {
        identity_difficulty: 1,
        enable_metrics: true,
        ..NodeConfig::default()
    };
    config.connection.reconnect_interval_secs = 3600;
    let ip = IpAddr::from(ip);
    let node = P2pNode::new(
        config,
        PeerKeyId::generate(1),
        Arc::new(ledger),
        Arc::new(DiscardPayloads),
        Arc::new(mem.dialer(ip)),
    )
    .unwrap();
    node.start(Arc::new(mem.listen(SocketAddr::new(ip, PORT))))
        .unwrap();
    node
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn new_node_catches_up_with_its_peer() {
    let mem = MemoryNetwork::new();
    let a = start_node(
        &mem,
        [10, 0, 0, 1],
        NullLedger::with_blocks(&build_chain(6, |h| h % 2 == 0)),
    );
    let b = start_node(&mem, [10, 0, 0, 2], NullLedger::new());

    let info = b
        .server()
        .connect_addr("10.0.0.1:20538")
        .await
        .unwrap();
    assert_eq!(info.id, a.id());
    assert_eq!(info.height, 6);

    wait_until("block sync", || b.ledger().current_block_height() == 6).await;
    assert_eq!(
        b.ledger().current_block_hash(),
        a.ledger().current_block_hash()
    );
    wait_until("sync flights to drain", || {
        b.sync().flight_block_count() == 0 && b.sync().flight_header_count() == 0
    })
    .await;

    b.stop().await;
    a.stop().await;
    assert_eq!(b.metrics().block_height.get(), 6);
}

#[tokio::test]
async fn stopping_a_node_disconnects_its_peers() {
    let mem = MemoryNetwork::new();
    let a = start_node(&mem, [10, 0, 0, 1], NullLedger::new());
    let b = start_node(&mem, [10, 0, 0, 2], NullLedger::new());

    b.server()
        .connect_addr("10.0.0.1:20538")
        .await
        .unwrap();
    wait_until("inbound session", || a.server().is_connected(&b.id())).await;

    b.stop().await;
    wait_until("peer to go away", || a.server().connected_peers().is_empty()).await;
    assert_eq!(a.server().inbound_count(), 0);
    a.stop().await;
}
