//! UDP primitives: a fire-and-forget broadcast sender and a receiver bound
//! to all interfaces.

use std::net::{Ipv4Addr, SocketAddr};

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use super::{EventSender, SocketEvent};
use crate::error::SocketError;

/// Sends datagrams to one fixed target. Broadcast is enabled so the target
/// may be a subnet broadcast address.
pub struct UdpSender {
    target: SocketAddr,
    socket: Option<Socket>,
}

impl UdpSender {
    pub fn new(target: SocketAddr) -> Self {
        Self { target, socket: None }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    pub fn open(&mut self) -> Result<(), SocketError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(SocketError::io("create udp socket"))?;
        socket
            .set_broadcast(true)
            .map_err(SocketError::io("set SO_BROADCAST"))?;
        socket
            .set_nonblocking(true)
            .map_err(SocketError::io("set nonblocking"))?;
        self.socket = Some(socket);
        Ok(())
    }

    /// Send one datagram. A failed send closes the socket; the caller may
    /// reopen it.
    pub fn send(&mut self, data: &[u8]) -> Result<usize, SocketError> {
        let socket = self.socket.as_ref().ok_or(SocketError::NotConnected)?;
        match socket.send_to(data, &self.target.into()) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.socket = None;
                Err(SocketError::Io {
                    context: "udp send",
                    source: e,
                })
            }
        }
    }

    pub fn close(&mut self) {
        self.socket = None;
    }
}

/// Receives datagrams on `0.0.0.0:port` and emits one `Datagram` event per
/// datagram. Address reuse is enabled so several processes on one host can
/// listen for the same announcements.
pub struct UdpReceiver {
    port: u16,
    buffer_size: usize,
    shutdown: Option<broadcast::Sender<()>>,
    local_addr: Option<SocketAddr>,
}

impl UdpReceiver {
    pub fn new(port: u16, buffer_size: usize) -> Self {
        Self {
            port,
            buffer_size,
            shutdown: None,
            local_addr: None,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.shutdown.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind and start receiving. A running receiver is stopped first.
    pub fn start(&mut self, events: EventSender) -> Result<SocketAddr, SocketError> {
        self.stop();

        let socket = bind_receiver(self.port)?;
        let local_addr = socket
            .local_addr()
            .map_err(SocketError::io("read udp address"))?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(receive_loop(socket, self.buffer_size, events, shutdown_rx));

        tracing::info!(addr = %local_addr, "udp receiver listening");
        self.shutdown = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
            tracing::debug!(port = self.port, "udp receiver stopped");
        }
        self.local_addr = None;
    }
}

impl Drop for UdpReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_receiver(port: u16) -> Result<UdpSocket, SocketError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(SocketError::io("create udp socket"))?;
    socket
        .set_reuse_address(true)
        .map_err(SocketError::io("set SO_REUSEADDR"))?;
    socket
        .set_broadcast(true)
        .map_err(SocketError::io("set SO_BROADCAST"))?;
    socket
        .set_nonblocking(true)
        .map_err(SocketError::io("set nonblocking"))?;

    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket
        .bind(&bind_addr.into())
        .map_err(SocketError::io("bind udp receiver"))?;

    UdpSocket::from_std(socket.into()).map_err(SocketError::io("register udp socket"))
}

async fn receive_loop(
    socket: UdpSocket,
    buffer_size: usize,
    events: EventSender,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => return,
            result = socket.recv_from(&mut buf) => {
                let (len, remote) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "udp recv error");
                        continue;
                    }
                };
                if len == 0 {
                    continue;
                }
                let data = Bytes::copy_from_slice(&buf[..len]);
                if events.send(SocketEvent::Datagram { remote, data }).is_err() {
                    return;
                }
            }
        }
    }
}
