//! In-process transport: listeners and dialers connected by
//! `tokio::io::duplex` pipes instead of sockets.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use meridian_network::{Dialer, Listener, NetworkError, RawConnection};
use parking_lot::Mutex;
use tokio::sync::mpsc;

const PIPE_CAPACITY: usize = 256 * 1024;

/// Registry of in-process listeners keyed by their socket address.
#[derive(Default)]
pub struct MemoryNetwork {
    listeners: Mutex<HashMap<SocketAddr, mpsc::Sender<RawConnection>>>,
    next_port: AtomicU16,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: Mutex::new(HashMap::new()),
            next_port: AtomicU16::new(50_000),
        })
    }

    pub fn listen(self: &Arc<Self>, addr: SocketAddr) -> MemoryListener {
        let (tx, rx) = mpsc::channel(64);
        self.listeners.lock().insert(addr, tx);
        MemoryListener {
            addr,
            incoming: tokio::sync::Mutex::new(rx),
        }
    }

    /// A dialer whose connections appear to come from `ip`.
    pub fn dialer(self: &Arc<Self>, ip: IpAddr) -> MemoryDialer {
        MemoryDialer {
            network: Arc::clone(self),
            ip,
        }
    }

    fn ephemeral_port(&self) -> u16 {
        self.next_port.fetch_add(1, Ordering::SeqCst)
    }
}

pub struct MemoryDialer {
    network: Arc<MemoryNetwork>,
    ip: IpAddr,
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, addr: &str) -> Result<RawConnection, NetworkError> {
        let target: SocketAddr = addr
            .parse()
            .map_err(|_| NetworkError::InvalidAddress(addr.to_string()))?;
        let listener = self.network.listeners.lock().get(&target).cloned();
        let Some(listener) = listener else {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
        };

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let from = SocketAddr::new(self.ip, self.network.ephemeral_port());
        listener
            .send(RawConnection {
                stream: Box::new(far),
                remote_addr: from,
            })
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        Ok(RawConnection {
            stream: Box::new(near),
            remote_addr: target,
        })
    }
}

pub struct MemoryListener {
    addr: SocketAddr,
    incoming: tokio::sync::Mutex<mpsc::Receiver<RawConnection>>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> Result<RawConnection, NetworkError> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(NetworkError::ChannelClosed)
    }

    fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.addr)
    }
}
