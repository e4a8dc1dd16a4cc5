use std::net::SocketAddr;

use meridian_types::PeerId;

/// What a node knows about a peer once the handshake completes.
///
/// The local node describes itself with the same struct; its `addr` is the
/// listen address and its `height` the current block height.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub version: u32,
    pub services: u64,
    pub relay: bool,
    pub http_info_port: u16,
    /// Port the peer accepts sync connections on.
    pub port: u16,
    pub height: u64,
    pub soft_version: String,
    /// Socket address of the live connection.
    pub addr: SocketAddr,
}

impl PeerInfo {
    /// The address other nodes should dial to reach this peer: the
    /// connection's IP with the advertised sync port.
    pub fn remote_listen_address(&self) -> String {
        SocketAddr::new(self.addr.ip(), self.port).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_address_swaps_in_sync_port() {
        let info = PeerInfo {
            id: PeerId::Pseudo(1),
            version: 1,
            services: 0,
            relay: true,
            http_info_port: 0,
            port: 20338,
            height: 0,
            soft_version: String::new(),
            addr: "192.168.1.4:51234".parse().unwrap(),
        };
        assert_eq!(info.remote_listen_address(), "192.168.1.4:20338");
    }
}
