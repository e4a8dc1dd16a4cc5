//! Peer-to-peer networking for meridian nodes.
//!
//! The crate is layered leaves first: the Kademlia routing table
//! ([`kbucket`], [`dht`]), pluggable transports, the admission controller
//! that gates every connection and runs the handshake, live sessions owned
//! by the [`NetServer`], and the protocol services on top of it (discovery,
//! block sync, keepalive, reconnect) tied together by the [`MessageRouter`].

pub mod block_sync;
pub mod cache;
pub mod connect_controller;
pub mod dht;
pub mod discovery;
pub mod error;
pub mod kbucket;
pub mod keepalive;
pub mod ledger;
pub mod net;
pub mod net_server;
pub mod peer;
pub mod reconnect;
pub mod router;
pub mod transport;

pub use block_sync::{BlockSyncMgr, SyncConfig};
pub use connect_controller::{
    AddressFilter, AllowAll, Conn, ConnCtrlOption, ConnectController, Direction, MatchNone,
    StaticReserveFilter,
};
pub use dht::Dht;
pub use discovery::Discovery;
pub use error::NetworkError;
pub use keepalive::Keepalive;
pub use ledger::{DiscardPayloads, Ledger, LedgerError, PayloadSink};
pub use net::{Inbound, Network};
pub use net_server::{NetServer, NetServerOptions, NetStats};
pub use peer::Peer;
pub use reconnect::ReconnectService;
pub use router::MessageRouter;
pub use transport::{Dialer, Listener, RawConnection, TcpDialer, TcpTransportListener};
