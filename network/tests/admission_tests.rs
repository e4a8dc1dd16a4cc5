//! Connection admission over the in-memory transport.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use meridian_crypto::PeerKeyId;
use meridian_network::{Conn, ConnCtrlOption, ConnectController, Listener, NetworkError};
use meridian_nullables::{MemoryListener, MemoryNetwork};
use meridian_protocol::{HandshakeOptions, PeerInfo, PROTOCOL_VERSION, SOFT_VERSION};
use tokio::task::JoinHandle;

const MAGIC: u32 = 0x0000_0de7;
const DIFFICULTY: u32 = 1;
const PORT: u16 = 20338;

type Admitted = Result<(PeerInfo, Conn), NetworkError>;

fn controller(net: &Arc<MemoryNetwork>, ip: [u8; 4], option: ConnCtrlOption) -> Arc<ConnectController> {
    let key = PeerKeyId::generate(DIFFICULTY);
    let ip = IpAddr::from(ip);
    let info = PeerInfo {
        id: key.id,
        version: PROTOCOL_VERSION,
        services: 1,
        relay: true,
        http_info_port: 0,
        port: PORT,
        height: 0,
        soft_version: SOFT_VERSION.to_string(),
        addr: SocketAddr::new(ip, PORT),
    };
    ConnectController::new(
        info,
        key,
        HandshakeOptions::new(MAGIC, DIFFICULTY),
        option.with_dialer(Arc::new(net.dialer(ip))),
    )
}

fn listen(net: &Arc<MemoryNetwork>, ip: [u8; 4]) -> (MemoryListener, String) {
    let addr = SocketAddr::new(IpAddr::from(ip), PORT);
    (net.listen(addr), addr.to_string())
}

/// Accept `n` connections one after another and return every outcome.
fn serve(ctrl: Arc<ConnectController>, listener: MemoryListener, n: usize) -> JoinHandle<Vec<Admitted>> {
    tokio::spawn(async move {
        let mut results = Vec::with_capacity(n);
        for _ in 0..n {
            let raw = match listener.accept().await {
                Ok(raw) => raw,
                Err(e) => {
                    results.push(Err(e));
                    continue;
                }
            };
            results.push(ctrl.accept_connect(raw).await);
        }
        results
    })
}

#[tokio::test]
async fn inbound_limit_rejects_third_peer() {
    let net = MemoryNetwork::new();
    let server = controller(&net, [10, 0, 0, 100], ConnCtrlOption::new().max_in_bound(2));
    let (listener, addr) = listen(&net, [10, 0, 0, 100]);
    let accepted = serve(Arc::clone(&server), listener, 3);

    let a = controller(&net, [10, 0, 0, 1], ConnCtrlOption::new());
    let b = controller(&net, [10, 0, 0, 2], ConnCtrlOption::new());
    let c = controller(&net, [10, 0, 0, 3], ConnCtrlOption::new());

    let conn_a = a.connect(&addr).await;
    assert!(conn_a.is_ok());
    let conn_b = b.connect(&addr).await;
    assert!(conn_b.is_ok());
    assert!(c.connect(&addr).await.is_err());

    let results = accepted.await.unwrap();
    assert!(results[0].is_ok());
    assert!(results[1].is_ok());
    match &results[2] {
        Err(e @ NetworkError::BoundFull { .. }) => {
            assert!(e.to_string().contains("reach max limit"));
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("third inbound peer admitted"),
    }
    assert_eq!(server.inbound_count(), 2);
    assert_eq!(a.outbound_count(), 1);
    assert_eq!(c.outbound_count(), 0);
}

/// Accept `n` connections and admit each one on its own task.
fn serve_concurrently(
    ctrl: Arc<ConnectController>,
    listener: MemoryListener,
    n: usize,
) -> JoinHandle<Vec<Admitted>> {
    tokio::spawn(async move {
        let mut tasks = Vec::with_capacity(n);
        for _ in 0..n {
            let raw = match listener.accept().await {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let ctrl = Arc::clone(&ctrl);
            tasks.push(tokio::spawn(async move { ctrl.accept_connect(raw).await }));
        }
        let mut results = Vec::with_capacity(n);
        for task in tasks {
            results.push(task.await.unwrap());
        }
        results
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_handshakes_respect_inbound_limit() {
    let net = MemoryNetwork::new();
    let server = controller(&net, [10, 0, 0, 100], ConnCtrlOption::new().max_in_bound(2));
    let (listener, addr) = listen(&net, [10, 0, 0, 100]);
    let accepted = serve_concurrently(Arc::clone(&server), listener, 3);

    let a = controller(&net, [10, 0, 0, 1], ConnCtrlOption::new());
    let b = controller(&net, [10, 0, 0, 2], ConnCtrlOption::new());
    let c = controller(&net, [10, 0, 0, 3], ConnCtrlOption::new());
    let (_ra, _rb, _rc) = tokio::join!(a.connect(&addr), b.connect(&addr), c.connect(&addr));

    let results = accepted.await.unwrap();
    let admitted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(admitted, 2);
    assert_eq!(server.inbound_count(), 2);
    for result in &results {
        if let Err(e) = result {
            assert!(matches!(e, NetworkError::BoundFull { .. }), "unexpected error: {e}");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_handshakes_respect_per_ip_limit() {
    let net = MemoryNetwork::new();
    let server = controller(&net, [10, 0, 0, 100], ConnCtrlOption::new().max_in_bound_per_ip(1));
    let (listener, addr) = listen(&net, [10, 0, 0, 100]);
    let accepted = serve_concurrently(Arc::clone(&server), listener, 3);

    let nodes: Vec<_> = (0..3)
        .map(|_| controller(&net, [10, 0, 0, 7], ConnCtrlOption::new()))
        .collect();
    let _ = tokio::join!(
        nodes[0].connect(&addr),
        nodes[1].connect(&addr),
        nodes[2].connect(&addr)
    );

    let results = accepted.await.unwrap();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(server.inbound_count(), 1);
}

#[tokio::test]
async fn per_ip_limit_counts_inbound_from_same_address() {
    let net = MemoryNetwork::new();
    let server = controller(&net, [10, 0, 0, 100], ConnCtrlOption::new().max_in_bound_per_ip(1));
    let (listener, addr) = listen(&net, [10, 0, 0, 100]);
    let accepted = serve(Arc::clone(&server), listener, 2);

    // two distinct nodes behind one address
    let first = controller(&net, [10, 0, 0, 7], ConnCtrlOption::new());
    let second = controller(&net, [10, 0, 0, 7], ConnCtrlOption::new());

    let _kept = first.connect(&addr).await;
    assert!(second.connect(&addr).await.is_err());

    let results = accepted.await.unwrap();
    assert!(results[0].is_ok());
    assert!(matches!(
        results[1],
        Err(NetworkError::PerIpLimit { count: 1, max: 1, .. })
    ));
    assert_eq!(server.inbound_count(), 1);
}

#[tokio::test]
async fn second_dial_to_connected_address_is_refused() {
    let net = MemoryNetwork::new();
    let server = controller(&net, [10, 0, 0, 100], ConnCtrlOption::new());
    let (listener, addr) = listen(&net, [10, 0, 0, 100]);
    let accepted = serve(Arc::clone(&server), listener, 1);

    let client = controller(&net, [10, 0, 0, 1], ConnCtrlOption::new());
    let first = client.connect(&addr).await;
    assert!(first.is_ok());
    assert!(matches!(
        client.connect(&addr).await,
        Err(NetworkError::AlreadyConnected(a)) if a == addr
    ));
    assert_eq!(client.outbound_count(), 1);
    let _held = accepted.await.unwrap();
}

#[tokio::test]
async fn dialing_own_listener_records_own_address() {
    let net = MemoryNetwork::new();
    let node = controller(&net, [10, 0, 0, 9], ConnCtrlOption::new());
    let (listener, addr) = listen(&net, [10, 0, 0, 9]);
    let accepted = serve(Arc::clone(&node), listener, 1);

    match node.connect(&addr).await {
        Err(NetworkError::HandshakeSelf) => {}
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("connected to itself"),
    }
    let results = accepted.await.unwrap();
    assert!(matches!(results[0], Err(NetworkError::HandshakeSelf)));

    assert_eq!(node.own_address(), addr);
    assert_eq!(node.outbound_count(), 0);
    assert_eq!(node.inbound_count(), 0);
    assert!(matches!(
        node.connect(&addr).await,
        Err(NetworkError::SelfAddress(_))
    ));
}

#[tokio::test]
async fn closing_twice_releases_slot_once() {
    let net = MemoryNetwork::new();
    let server = controller(&net, [10, 0, 0, 100], ConnCtrlOption::new());
    let (listener, addr) = listen(&net, [10, 0, 0, 100]);
    let accepted = serve(Arc::clone(&server), listener, 2);

    let a = controller(&net, [10, 0, 0, 1], ConnCtrlOption::new());
    let b = controller(&net, [10, 0, 0, 2], ConnCtrlOption::new());
    let _conn_a = a.connect(&addr).await;
    let _conn_b = b.connect(&addr).await;

    let mut results = accepted.await.unwrap();
    assert_eq!(server.inbound_count(), 2);

    let Some(Ok((info, conn))) = results.pop() else {
        panic!("second peer not admitted");
    };
    conn.close();
    conn.close();
    assert_eq!(server.inbound_count(), 1);
    assert!(!server.is_connected(&info.id));

    drop(conn);
    assert_eq!(server.inbound_count(), 1);
}

#[tokio::test]
async fn closed_connection_frees_the_address() {
    let net = MemoryNetwork::new();
    let server = controller(&net, [10, 0, 0, 100], ConnCtrlOption::new());
    let (listener, addr) = listen(&net, [10, 0, 0, 100]);
    let accepted = serve(Arc::clone(&server), listener, 2);

    let client = controller(&net, [10, 0, 0, 1], ConnCtrlOption::new());
    let Ok((_, conn)) = client.connect(&addr).await else {
        panic!("first dial failed");
    };
    conn.close();
    assert_eq!(client.outbound_count(), 0);

    let again = client.connect(&addr).await;
    assert!(again.is_ok());
    assert_eq!(client.outbound_count(), 1);
    let _held = accepted.await.unwrap();
}
