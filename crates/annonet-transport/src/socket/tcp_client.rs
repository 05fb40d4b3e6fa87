//! Outbound TCP connection to a server.
//!
//! The socket is constructed synchronously in [`TcpClient::open`] so that
//! construction failures surface to the caller; the connect itself runs in
//! a background task bounded by the configured timeout.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{read_loop, write_loop, EventSender, SocketEvent};
use crate::error::SocketError;

const IDLE: u8 = 0;
const PENDING: u8 = 1;
const OPEN: u8 = 2;

/// State of one connection attempt. Replaced on every `open`, so a stale
/// task can never flip the status of a newer connection.
struct Link {
    status: AtomicU8,
    writer: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

impl Link {
    fn new(status: u8) -> Self {
        Self {
            status: AtomicU8::new(status),
            writer: Mutex::new(None),
        }
    }

    fn set_writer(&self, writer: Option<mpsc::UnboundedSender<Bytes>>) {
        *self.writer.lock().unwrap_or_else(PoisonError::into_inner) = writer;
    }

    fn tear_down(&self) {
        self.status.store(IDLE, Ordering::Release);
        self.set_writer(None);
    }
}

pub struct TcpClient {
    remote: SocketAddr,
    connect_timeout: Duration,
    buffer_size: usize,
    link: Arc<Link>,
    task: Option<JoinHandle<()>>,
}

impl TcpClient {
    pub fn new(remote: SocketAddr, connect_timeout: Duration, buffer_size: usize) -> Self {
        Self {
            remote,
            connect_timeout,
            buffer_size,
            link: Arc::new(Link::new(IDLE)),
            task: None,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_open(&self) -> bool {
        self.link.status.load(Ordering::Acquire) == OPEN
    }

    pub fn is_pending(&self) -> bool {
        self.link.status.load(Ordering::Acquire) == PENDING
    }

    /// Start connecting. `Connected` is emitted once the handshake completes,
    /// followed by one `Data` event per read. A failed or timed-out connect
    /// is logged and leaves the client idle.
    pub fn open(&mut self, events: EventSender) -> Result<(), SocketError> {
        if self.is_pending() || self.is_open() {
            return Err(SocketError::AlreadyOpen);
        }

        let socket = if self.remote.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(SocketError::io("create tcp socket"))?;

        if let Some(stale) = self.task.take() {
            stale.abort();
        }

        let link = Arc::new(Link::new(PENDING));
        self.link = Arc::clone(&link);
        self.task = Some(tokio::spawn(run_connection(
            socket,
            self.remote,
            self.connect_timeout,
            self.buffer_size,
            link,
            events,
        )));
        Ok(())
    }

    /// Queue bytes for the server. Writes are serialised per connection.
    pub fn send(&self, data: Bytes) -> Result<(), SocketError> {
        if !self.is_open() {
            return Err(SocketError::NotConnected);
        }
        let writer = self.link.writer.lock().unwrap_or_else(PoisonError::into_inner);
        match writer.as_ref() {
            Some(tx) => tx.send(data).map_err(|_| SocketError::Closed),
            None => Err(SocketError::NotConnected),
        }
    }

    /// Tear the connection down. Safe to call in any state.
    pub fn close(&mut self) {
        self.link.tear_down();
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!(remote = %self.remote, "tcp client closed");
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_connection(
    socket: TcpSocket,
    remote: SocketAddr,
    connect_timeout: Duration,
    buffer_size: usize,
    link: Arc<Link>,
    events: EventSender,
) {
    let stream = match tokio::time::timeout(connect_timeout, socket.connect(remote)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!(%remote, error = %e, "connect failed");
            link.tear_down();
            return;
        }
        Err(_) => {
            tracing::warn!(%remote, timeout_ms = connect_timeout.as_millis() as u64, "connect timed out");
            link.tear_down();
            return;
        }
    };
    let _ = stream.set_nodelay(true);

    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    link.set_writer(Some(tx));
    link.status.store(OPEN, Ordering::Release);
    tokio::spawn(write_loop(writer, rx, remote));

    tracing::info!(%remote, "connected to server");
    if events.send(SocketEvent::Connected { remote }).is_err() {
        link.tear_down();
        return;
    }

    let end = read_loop(reader, remote, buffer_size, &events).await;
    link.tear_down();
    tracing::info!(%remote, reason = ?end, "disconnected from server");
}
