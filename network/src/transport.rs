//! Stream transports behind the connection controller.
//!
//! Production nodes use TCP. Tests plug in an in-process transport through
//! the same [`Dialer`] and [`Listener`] traits.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::NetworkError;

/// Dial timeout for outbound TCP connections.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(6);

/// A bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A freshly established stream that has not been handshaken yet.
pub struct RawConnection {
    pub stream: Box<dyn AsyncStream>,
    pub remote_addr: SocketAddr,
}

impl std::fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConnection")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> Result<RawConnection, NetworkError>;
}

#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> Result<RawConnection, NetworkError>;

    fn local_addr(&self) -> Result<SocketAddr, NetworkError>;
}

#[derive(Clone, Debug)]
pub struct TcpDialer {
    timeout: Duration,
}

impl TcpDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(DIAL_TIMEOUT)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> Result<RawConnection, NetworkError> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::DialTimeout(addr.to_string()))??;
        stream.set_nodelay(true)?;
        let remote_addr = stream.peer_addr()?;
        Ok(RawConnection {
            stream: Box::new(stream),
            remote_addr,
        })
    }
}

pub struct TcpTransportListener {
    inner: TcpListener,
}

impl TcpTransportListener {
    pub async fn bind(addr: &str) -> Result<Self, NetworkError> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl Listener for TcpTransportListener {
    async fn accept(&self) -> Result<RawConnection, NetworkError> {
        let (stream, remote_addr) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        Ok(RawConnection {
            stream: Box::new(stream),
            remote_addr,
        })
    }

    fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.inner.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_dial_and_accept() {
        let listener = TcpTransportListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialer = TcpDialer::default();
        let addr_str = addr.to_string();
        let (dialed, accepted) = tokio::join!(dialer.dial(&addr_str), listener.accept());
        let dialed = dialed.unwrap();
        let accepted = accepted.unwrap();
        assert_eq!(dialed.remote_addr, addr);
        assert_eq!(accepted.remote_addr.ip(), addr.ip());
    }
}
