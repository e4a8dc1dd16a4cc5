use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use meridian_crypto::PeerKeyId;
use meridian_messages::Message;
use meridian_network::{
    ConnCtrlOption, ConnectController, Inbound, NetServer, NetServerOptions, Network,
};
use meridian_nullables::MemoryNetwork;
use meridian_protocol::{HandshakeOptions, PeerInfo, PROTOCOL_VERSION, SOFT_VERSION};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MAGIC: u32 = 0x0000_0de7;
const PORT: u16 = 20338;

fn server(mem: &Arc<MemoryNetwork>, ip: [u8; 4], height: u64) -> (Arc<NetServer>, mpsc::Receiver<Inbound>) {
    let key = PeerKeyId::generate(1);
    let ip = IpAddr::from(ip);
    let info = PeerInfo {
        id: key.id,
        version: PROTOCOL_VERSION,
        services: 1,
        relay: true,
        http_info_port: 0,
        port: PORT,
        height,
        soft_version: SOFT_VERSION.to_string(),
        addr: SocketAddr::new(ip, PORT),
    };
    let controller = ConnectController::new(
        info,
        key,
        HandshakeOptions::new(MAGIC, 1),
        ConnCtrlOption::new().with_dialer(Arc::new(mem.dialer(ip))),
    );
    let (server, rx) = NetServer::new(controller, NetServerOptions::new(MAGIC), CancellationToken::new());
    server.start_listener(Arc::new(mem.listen(SocketAddr::new(ip, PORT))));
    (server, rx)
}

async fn next(rx: &mut mpsc::Receiver<Inbound>) -> Inbound {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("router event")
        .expect("router queue open")
}

#[tokio::test]
async fn sessions_carry_messages_both_ways() {
    let mem = MemoryNetwork::new();
    let (a, mut a_rx) = server(&mem, [10, 0, 0, 1], 3);
    let (b, mut b_rx) = server(&mem, [10, 0, 0, 2], 8);

    let info = b.connect_addr("10.0.0.1:20338").await.unwrap();
    assert_eq!(info.id, a.local_id());
    assert_eq!(info.height, 3);

    match next(&mut b_rx).await {
        Inbound::PeerConnected(p) => assert_eq!(p.id, a.local_id()),
        other => panic!("unexpected event: {other:?}"),
    }
    match next(&mut a_rx).await {
        Inbound::PeerConnected(p) => {
            assert_eq!(p.id, b.local_id());
            assert_eq!(p.height, 8);
            assert_eq!(p.remote_listen_address(), "10.0.0.2:20338");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(a.inbound_count(), 1);
    assert_eq!(b.outbound_count(), 1);

    b.send_to(&a.local_id(), Message::Ping { height: 8 }).unwrap();
    match next(&mut a_rx).await {
        Inbound::Message { from, msg, size } => {
            assert_eq!(from, b.local_id());
            assert_eq!(msg, Message::Ping { height: 8 });
            assert!(size > 0);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    a.send_to(&b.local_id(), Message::Pong { height: 3 }).unwrap();
    assert!(matches!(
        next(&mut b_rx).await,
        Inbound::Message { msg: Message::Pong { height: 3 }, .. }
    ));
    assert!(a.last_contact(&b.local_id()).is_some());
}

#[tokio::test]
async fn disconnect_is_seen_by_both_sides() {
    let mem = MemoryNetwork::new();
    let (a, mut a_rx) = server(&mem, [10, 0, 0, 1], 0);
    let (b, mut b_rx) = server(&mem, [10, 0, 0, 2], 0);

    b.connect_addr("10.0.0.1:20338").await.unwrap();
    assert!(matches!(next(&mut a_rx).await, Inbound::PeerConnected(_)));
    assert!(matches!(next(&mut b_rx).await, Inbound::PeerConnected(_)));

    b.disconnect(&a.local_id());
    match next(&mut b_rx).await {
        Inbound::PeerDisconnected(p) => assert_eq!(p.id, a.local_id()),
        other => panic!("unexpected event: {other:?}"),
    }
    match next(&mut a_rx).await {
        Inbound::PeerDisconnected(p) => assert_eq!(p.id, b.local_id()),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(!a.is_connected(&b.local_id()));
    assert_eq!(a.inbound_count(), 0);
    assert_eq!(b.outbound_count(), 0);
    assert!(b.send_to(&a.local_id(), Message::Disconnect).is_err());
}

#[tokio::test]
async fn failed_dials_are_counted() {
    let mem = MemoryNetwork::new();
    let (b, _b_rx) = server(&mem, [10, 0, 0, 2], 0);

    assert!(b.connect_addr("10.0.0.99:20338").await.is_err());
    assert_eq!(b.stats().rejected_connections.load(Ordering::Relaxed), 1);
    assert!(b.connected_peers().is_empty());
}

#[tokio::test]
async fn local_height_is_announced_in_later_handshakes() {
    let mem = MemoryNetwork::new();
    let (a, _a_rx) = server(&mem, [10, 0, 0, 1], 0);
    let (b, _b_rx) = server(&mem, [10, 0, 0, 2], 0);

    a.set_local_height(42);
    assert_eq!(a.local_height(), 42);
    let info = b.connect_addr("10.0.0.1:20338").await.unwrap();
    assert_eq!(info.height, 42);
}
