//! Socket primitives — thin async wrappers over TCP and UDP sockets.
//!
//! Every primitive reports what happens on the wire through a
//! [`SocketEvent`] channel. Receive loops re-arm after every read and end
//! quietly on EOF or error; nothing here panics or returns errors from a
//! background task.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

pub mod tcp_client;
pub mod tcp_server;
pub mod udp;

pub use tcp_client::TcpClient;
pub use tcp_server::{broadcast_except, ClientTable, TcpServer};
pub use udp::{UdpReceiver, UdpSender};

/// Something a socket observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Outbound TCP connection established.
    Connected { remote: SocketAddr },
    /// Bytes from one TCP read. Arbitrary fragment of the peer's stream.
    Data { remote: SocketAddr, data: Bytes },
    /// Server accepted a connection.
    ClientConnected { remote: SocketAddr },
    /// Server-side connection ended (EOF, error, or dropped).
    ClientDisconnected { remote: SocketAddr },
    /// One whole UDP datagram.
    Datagram { remote: SocketAddr, data: Bytes },
}

/// Where primitives deliver their events.
pub type EventSender = mpsc::UnboundedSender<SocketEvent>;

/// Default size of a single receive buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 65_536;

/// Why a TCP read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadEnd {
    Eof,
    Error,
    Unobserved,
}

/// Read until EOF or error, emitting one `Data` event per completed read.
pub(crate) async fn read_loop(
    mut reader: OwnedReadHalf,
    remote: SocketAddr,
    buffer_size: usize,
    events: &EventSender,
) -> ReadEnd {
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(%remote, "peer closed connection");
                return ReadEnd::Eof;
            }
            Ok(n) => {
                tracing::trace!(%remote, bytes = n, "tcp read");
                let data = Bytes::copy_from_slice(&buf[..n]);
                if events.send(SocketEvent::Data { remote, data }).is_err() {
                    return ReadEnd::Unobserved;
                }
            }
            Err(e) => {
                tracing::warn!(%remote, error = %e, "tcp receive failed, closing connection");
                return ReadEnd::Error;
            }
        }
    }
}

/// Drain queued sends onto the socket. Ends when the queue's sender is
/// dropped or a write fails; dropping the write half shuts the socket down.
pub(crate) async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    remote: SocketAddr,
) {
    while let Some(data) = queue.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            tracing::warn!(%remote, error = %e, "tcp send failed");
            return;
        }
    }
}
