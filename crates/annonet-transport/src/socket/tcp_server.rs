//! TCP listener that accepts any number of clients.
//!
//! Each accepted connection gets a writer task fed by an unbounded queue and
//! a reader task that emits `Data` events. The reader owns disconnect
//! reporting: it removes the client from the table and emits
//! `ClientDisconnected` exactly once.
//!
//! The listening socket belongs to the accept task, so it is only released
//! once that task has run to completion. Rebinding the same port after
//! [`TcpServer::stop`] needs [`TcpServer::closed`] first.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};

use super::{read_loop, write_loop, EventSender, SocketEvent};
use crate::error::SocketError;

const LISTEN_BACKLOG: i32 = 100;

/// One accepted connection. Dropping the handle closes the connection.
pub struct ClientHandle {
    writer: mpsc::UnboundedSender<Bytes>,
    reader: AbortHandle,
}

impl ClientHandle {
    pub fn send(&self, data: Bytes) -> Result<(), SocketError> {
        self.writer.send(data).map_err(|_| SocketError::Closed)
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Connected clients keyed by remote endpoint.
pub type ClientTable = Arc<DashMap<SocketAddr, ClientHandle>>;

/// Send `data` to every client except `exclude`. Returns how many sends
/// were queued.
pub fn broadcast_except(clients: &ClientTable, exclude: Option<SocketAddr>, data: &Bytes) -> usize {
    let mut sent = 0;
    for entry in clients.iter() {
        if Some(*entry.key()) == exclude {
            continue;
        }
        match entry.value().send(data.clone()) {
            Ok(()) => sent += 1,
            Err(e) => tracing::debug!(client = %entry.key(), error = %e, "skipping closed client"),
        }
    }
    sent
}

pub struct TcpServer {
    port: u16,
    buffer_size: usize,
    clients: ClientTable,
    shutdown: Option<broadcast::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl TcpServer {
    pub fn new(port: u16, buffer_size: usize) -> Self {
        Self {
            port,
            buffer_size,
            clients: Arc::new(DashMap::new()),
            shutdown: None,
            accept_task: None,
            local_addr: None,
        }
    }

    /// Bind `0.0.0.0:port` and start accepting. Returns the bound address,
    /// which carries the real port when the configured port is 0.
    pub fn start(&mut self, events: EventSender) -> Result<SocketAddr, SocketError> {
        if self.is_listening() {
            return Err(SocketError::AlreadyOpen);
        }

        let listener = bind_listener(self.port)?;
        let local_addr = listener
            .local_addr()
            .map_err(SocketError::io("read listener address"))?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.clients),
            self.buffer_size,
            events,
            shutdown_rx,
        ));

        tracing::info!(addr = %local_addr, "tcp server listening");
        self.shutdown = Some(shutdown_tx);
        self.accept_task = Some(accept_task);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Stop accepting and close every client connection. Idempotent. The
    /// listening socket closes asynchronously; see [`closed`](Self::closed).
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
            tracing::info!(clients = self.clients.len(), "tcp server stopped");
        }
        self.clients.clear();
        self.local_addr = None;
    }

    /// Stop, then wait until the listening socket is closed and its port
    /// can be bound again.
    pub async fn closed(&mut self) {
        self.stop();
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::debug!(error = %e, "accept task ended abnormally");
            }
        }
    }

    pub fn is_listening(&self) -> bool {
        self.shutdown.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn clients(&self) -> ClientTable {
        Arc::clone(&self.clients)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn client_addrs(&self) -> Vec<SocketAddr> {
        self.clients.iter().map(|e| *e.key()).collect()
    }

    pub fn send_to_client(&self, client: SocketAddr, data: Bytes) -> Result<(), SocketError> {
        match self.clients.get(&client) {
            Some(handle) => handle.send(data),
            None => Err(SocketError::NotConnected),
        }
    }

    pub fn send_to_all(&self, data: Bytes) -> usize {
        broadcast_except(&self.clients, None, &data)
    }

    /// Close one client's connection. No `ClientDisconnected` is emitted
    /// for a client dropped this way.
    pub fn drop_client(&self, client: SocketAddr) -> bool {
        self.clients.remove(&client).is_some()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_listener(port: u16) -> Result<TcpListener, SocketError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(SocketError::io("create tcp listener"))?;
    socket
        .set_reuse_address(true)
        .map_err(SocketError::io("set SO_REUSEADDR"))?;
    socket
        .set_nonblocking(true)
        .map_err(SocketError::io("set nonblocking"))?;

    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket
        .bind(&bind_addr.into())
        .map_err(SocketError::io("bind tcp listener"))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(SocketError::io("listen"))?;

    TcpListener::from_std(socket.into()).map_err(SocketError::io("register tcp listener"))
}

async fn accept_loop(
    listener: TcpListener,
    clients: ClientTable,
    buffer_size: usize,
    events: EventSender,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                tracing::debug!("accept loop shutting down");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    admit_client(stream, remote, &clients, buffer_size, &events);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

fn admit_client(
    stream: TcpStream,
    remote: SocketAddr,
    clients: &ClientTable,
    buffer_size: usize,
    events: &EventSender,
) {
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(writer, rx, remote));

    // The reader waits until the client is in the table, so an immediate
    // EOF still finds an entry to remove.
    let (ready_tx, ready_rx) = oneshot::channel::<()>();
    let table = Arc::clone(clients);
    let reader_events = events.clone();
    let reader_task = tokio::spawn(async move {
        if ready_rx.await.is_err() {
            return;
        }
        read_loop(reader, remote, buffer_size, &reader_events).await;
        if table.remove(&remote).is_some() {
            tracing::info!(%remote, "client disconnected");
            let _ = reader_events.send(SocketEvent::ClientDisconnected { remote });
        }
    });

    clients.insert(
        remote,
        ClientHandle {
            writer: tx,
            reader: reader_task.abort_handle(),
        },
    );
    tracing::info!(%remote, clients = clients.len(), "client connected");
    let _ = events.send(SocketEvent::ClientConnected { remote });
    let _ = ready_tx.send(());
}
