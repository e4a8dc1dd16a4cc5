//! A live session with one handshaken peer.
//!
//! Each session runs a reader task that decodes frames into the router
//! queue and a writer task that drains a bounded outbound queue. Either task
//! ending cancels the other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use meridian_messages::Message;
use meridian_protocol::codec::{read_message, write_message};
use meridian_protocol::PeerInfo;
use meridian_types::PeerId;
use parking_lot::Mutex;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::connect_controller::{Conn, ConnGuard};
use crate::net::Inbound;
use crate::transport::AsyncStream;
use crate::NetworkError;

/// Outbound messages buffered per peer before `send` reports a full queue.
pub const DEFAULT_SEND_QUEUE: usize = 1024;

pub struct Peer {
    info: PeerInfo,
    height: AtomicU64,
    last_contact: Mutex<Instant>,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
    guard: Arc<ConnGuard>,
}

impl Peer {
    /// Wrap an admitted connection. No I/O happens until
    /// [`Session::spawn`] is called, so the caller can register the peer
    /// before any of its messages reach the router.
    pub fn new(conn: Conn, info: PeerInfo, queue_size: usize) -> (Arc<Peer>, Session) {
        let (stream, guard) = conn.into_parts();
        let (tx, rx) = mpsc::channel(queue_size);
        let peer = Arc::new(Peer {
            height: AtomicU64::new(info.height),
            info,
            last_contact: Mutex::new(Instant::now()),
            outbound: tx,
            cancel: CancellationToken::new(),
            guard,
        });
        let session = Session {
            peer: Arc::clone(&peer),
            stream,
            outbound: rx,
        };
        (peer, session)
    }

    pub fn id(&self) -> PeerId {
        self.info.id
    }

    pub fn info(&self) -> PeerInfo {
        let mut info = self.info.clone();
        info.height = self.height();
        info
    }

    pub fn connect_id(&self) -> u64 {
        self.guard.connect_id()
    }

    pub fn height(&self) -> u64 {
        self.height.load(Ordering::Relaxed)
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::Relaxed);
    }

    pub fn last_contact(&self) -> Instant {
        *self.last_contact.lock()
    }

    fn touch(&self) {
        *self.last_contact.lock() = Instant::now();
    }

    pub fn is_outbound(&self) -> bool {
        self.guard.direction() == crate::connect_controller::Direction::Outbound
    }

    pub fn send(&self, msg: Message) -> Result<(), NetworkError> {
        self.outbound.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::SendQueueFull(self.id()),
            mpsc::error::TrySendError::Closed(_) => NetworkError::ChannelClosed,
        })
    }

    /// Stop both tasks and release the connection. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
        self.guard.close();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The not-yet-running I/O half of a [`Peer`].
pub struct Session {
    peer: Arc<Peer>,
    stream: Box<dyn AsyncStream>,
    outbound: mpsc::Receiver<Message>,
}

impl Session {
    /// Spawn the reader and writer. The handle resolves once both have
    /// exited and the connection has been released.
    pub fn spawn(self, magic: u32, router: mpsc::Sender<Inbound>) -> JoinHandle<()> {
        let Session {
            peer,
            stream,
            outbound,
        } = self;
        let (reader, writer) = tokio::io::split(stream);
        let read_task = tokio::spawn(read_loop(Arc::clone(&peer), reader, magic, router));
        let write_task = tokio::spawn(write_loop(
            peer.id(),
            writer,
            outbound,
            magic,
            peer.cancel.clone(),
        ));
        tokio::spawn(async move {
            let _ = tokio::join!(read_task, write_task);
            peer.guard.close();
            tracing::debug!(peer = %peer.id(), "session closed");
        })
    }
}

async fn read_loop(
    peer: Arc<Peer>,
    mut reader: ReadHalf<Box<dyn AsyncStream>>,
    magic: u32,
    router: mpsc::Sender<Inbound>,
) {
    let id = peer.id();
    loop {
        tokio::select! {
            _ = peer.cancel.cancelled() => break,
            res = read_message(&mut reader, magic) => match res {
                Ok((msg, size)) => {
                    peer.touch();
                    if router.send(Inbound::Message { from: id, msg, size }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(peer = %id, error = %e, "read loop ended");
                    break;
                }
            },
        }
    }
    peer.cancel.cancel();
}

async fn write_loop(
    id: PeerId,
    mut writer: WriteHalf<Box<dyn AsyncStream>>,
    mut rx: mpsc::Receiver<Message>,
    magic: u32,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(msg) => {
                    if let Err(e) = write_message(&mut writer, magic, &msg).await {
                        tracing::debug!(peer = %id, error = %e, "write loop ended");
                        break;
                    }
                }
                None => break,
            },
        }
    }
    cancel.cancel();
}
