//! Transport coordinator.
//!
//! Owns the sockets for whichever role is active (client or server), runs
//! discovery, and funnels fully reassembled envelopes into one queue. The
//! host drains that queue by calling [`Transport::pump`] on its own tick,
//! so handlers never run concurrently with each other.
//!
//! Data flow:
//!
//! ```text
//!   socket tasks ──SocketEvent──▶ ingest task ──Envelope──▶ message queue ──pump──▶ Dispatcher
//!                                     │                                         ▲
//!                                     ├──relay (server role)──▶ other clients   │
//!                                     └──Control──▶ control queue ──pump────────┘ (events)
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use annonet_core::config::AnnonetConfig;
use annonet_core::{AcceptClient, Announcement, Envelope, JsonMessage, MessageType, Reassembler};
use tokio::sync::{broadcast, mpsc};

use crate::discovery::{
    announce_loop, expiry_loop, host_name, open_announcers, resolve_targets, AnnounceParams,
    BroadcastTarget, SessionInfo, SessionRegistry,
};
use crate::dispatch::{Dispatcher, MessageHandler};
use crate::error::{SocketError, TransportError};
use crate::socket::{
    broadcast_except, ClientTable, SocketEvent, TcpClient, TcpServer, UdpReceiver,
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Uninitialized,
    /// Client role, waiting for announcements.
    Listening,
    Connecting,
    Connected,
    Serving,
}

/// Connection-level notifications, published from the pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionStatusChanged { state: TransportState },
    SessionListChanged,
    ClientConnected { client: SocketAddr, index: u32 },
    ClientDisconnected { client: SocketAddr },
}

/// Queued next to messages so the pump sees them in the host's context.
#[derive(Debug)]
enum Control {
    ConnectedToServer(SocketAddr),
    ServerLinkEnded(SocketAddr),
    ClientConnected(SocketAddr),
    ClientDisconnected(SocketAddr),
}

#[derive(Clone)]
struct Inbound {
    messages: mpsc::UnboundedSender<Envelope>,
    control: mpsc::UnboundedSender<Control>,
}

struct Queues {
    messages: mpsc::UnboundedReceiver<Envelope>,
    control: mpsc::UnboundedReceiver<Control>,
}

#[derive(Default)]
struct Roles {
    listener: Option<UdpReceiver>,
    expiry_shutdown: Option<broadcast::Sender<()>>,
    client: Option<TcpClient>,
    server: Option<TcpServer>,
    /// Stopped server whose listening socket may still be open.
    retired_server: Option<TcpServer>,
    announce_shutdown: Option<broadcast::Sender<()>>,
    server_addr: Option<SocketAddr>,
    session: Option<SessionInfo>,
}

struct Shared {
    config: AnnonetConfig,
    server_name: String,
    targets: Vec<BroadcastTarget>,
    roles: Mutex<Roles>,
    dispatcher: Dispatcher,
    sessions: SessionRegistry,
    inbound: Inbound,
    queues: tokio::sync::Mutex<Queues>,
    paused: AtomicBool,
    next_client_index: AtomicU32,
    events: broadcast::Sender<TransportEvent>,
}

/// Cheap to clone; all clones drive the same sockets and queue.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

impl Transport {
    /// Build an idle transport. Announce targets and the server name are
    /// resolved once, here.
    pub fn new(config: AnnonetConfig) -> Self {
        let server_name = if config.discovery.server_name.is_empty() {
            host_name()
        } else {
            config.discovery.server_name.clone()
        };
        let targets = resolve_targets(
            &config.discovery.announce_addresses,
            config.discovery.discovery_port,
        );
        tracing::debug!(targets = targets.len(), name = %server_name, "transport created");

        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let shared = Arc::new(Shared {
            config,
            server_name,
            targets,
            roles: Mutex::new(Roles::default()),
            dispatcher: Dispatcher::new(),
            sessions: SessionRegistry::new(),
            inbound: Inbound {
                messages: messages_tx,
                control: control_tx,
            },
            queues: tokio::sync::Mutex::new(Queues {
                messages: messages_rx,
                control: control_rx,
            }),
            paused: AtomicBool::new(false),
            next_client_index: AtomicU32::new(0),
            events,
        });

        // Weak so the handler table does not keep the transport alive.
        let weak = Arc::downgrade(&shared);
        shared
            .dispatcher
            .register(MessageType::ANNOUNCEMENT, move |envelope: Envelope| {
                let weak = weak.clone();
                async move {
                    if let Some(shared) = weak.upgrade() {
                        Transport { shared }.on_announcement(&envelope);
                    }
                    anyhow::Ok(())
                }
            });

        Self { shared }
    }

    fn roles(&self) -> MutexGuard<'_, Roles> {
        self.shared.roles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: TransportEvent) {
        // No subscribers is fine.
        let _ = self.shared.events.send(event);
    }

    fn ingest(&self, role: IngestRole, relay: Option<ClientTable>) -> mpsc::UnboundedSender<SocketEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let ingest = Ingest::new(
            role,
            self.shared.inbound.clone(),
            self.shared.config.network.max_payload_bytes,
            relay,
        );
        tokio::spawn(ingest.run(rx));
        tx
    }

    // ── Client role ──────────────────────────────────────────────────────────

    /// Listen for server announcements on the discovery port. Tears down
    /// the server role first.
    pub fn start_listening(&self) -> Result<SocketAddr, TransportError> {
        let mut roles = self.roles();
        self.stop_server_locked(&mut roles);

        let discovery = &self.shared.config.discovery;
        let mut receiver = roles.listener.take().unwrap_or_else(|| {
            UdpReceiver::new(
                discovery.discovery_port,
                self.shared.config.network.receive_buffer_bytes,
            )
        });
        let events = self.ingest(IngestRole::Listener, None);
        let addr = receiver.start(events)?;
        roles.listener = Some(receiver);

        let ttl = discovery.session_ttl().filter(|_| roles.expiry_shutdown.is_none());
        if let Some(ttl) = ttl {
            let (tx, rx) = broadcast::channel(1);
            let weak = Arc::downgrade(&self.shared);
            tokio::spawn(expiry_loop(
                self.shared.sessions.clone(),
                ttl,
                move |_| {
                    if let Some(shared) = weak.upgrade() {
                        let _ = shared.events.send(TransportEvent::SessionListChanged);
                    }
                },
                rx,
            ));
            roles.expiry_shutdown = Some(tx);
        }

        tracing::info!(%addr, announce_text = %discovery.announce_text, "searching for server");
        self.publish(TransportEvent::ConnectionStatusChanged {
            state: TransportState::Listening,
        });
        Ok(addr)
    }

    pub fn stop_listening(&self) {
        Self::stop_listening_locked(&mut self.roles());
    }

    fn stop_listening_locked(roles: &mut Roles) {
        if let Some(mut listener) = roles.listener.take() {
            listener.stop();
        }
        if let Some(tx) = roles.expiry_shutdown.take() {
            let _ = tx.send(());
        }
    }

    /// Bound discovery address while listening.
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.roles().listener.as_ref().and_then(|l| l.local_addr())
    }

    /// Start a TCP connection to a server. Returns immediately; watch
    /// [`TransportEvent::ConnectionStatusChanged`] or [`Transport::state`].
    /// Fails with `AlreadyOpen` while an earlier attempt is still pending.
    pub fn connect_to_server(&self, ip: IpAddr, port: u16) -> Result<(), TransportError> {
        let mut roles = self.roles();
        self.connect_locked(&mut roles, SocketAddr::new(ip, port))
    }

    fn connect_locked(&self, roles: &mut Roles, remote: SocketAddr) -> Result<(), TransportError> {
        if roles.client.as_ref().is_some_and(TcpClient::is_pending) {
            return Err(SocketError::AlreadyOpen.into());
        }
        if let Some(mut client) = roles.client.take() {
            client.close();
        }
        self.stop_server_locked(roles);

        let network = &self.shared.config.network;
        let mut client = TcpClient::new(remote, network.connect_timeout(), network.receive_buffer_bytes);
        let events = self.ingest(IngestRole::Client, None);
        client.open(events)?;
        roles.client = Some(client);
        tracing::info!(%remote, "connecting to server");
        Ok(())
    }

    /// Connect to a discovered session. Stops listening and any server
    /// role first.
    pub fn join_session(&self, session: &SessionInfo) -> Result<(), TransportError> {
        let Some(known) = self.shared.sessions.get(&session.ip) else {
            return Err(TransportError::UnknownSession(session.ip.clone()));
        };
        let ip: IpAddr = known
            .ip
            .parse()
            .map_err(|_| TransportError::InvalidAddress(known.ip.clone()))?;

        let mut roles = self.roles();
        self.stop_server_locked(&mut roles);
        Self::stop_listening_locked(&mut roles);
        self.connect_locked(&mut roles, SocketAddr::new(ip, known.port))?;
        tracing::info!(ip = %known.ip, name = %known.name, port = known.port, "joining session");
        roles.session = Some(known);
        Ok(())
    }

    fn on_announcement(&self, envelope: &Envelope) {
        let announcement = match Announcement::unpack(envelope) {
            Ok(a) => a,
            Err(e) => {
                tracing::debug!(sender = ?envelope.sender, error = %e, "ignoring malformed announcement");
                return;
            }
        };
        if announcement.message != self.shared.config.discovery.announce_text {
            tracing::trace!(ip = %announcement.ip, text = %announcement.message, "announce text mismatch");
            return;
        }

        let info = SessionInfo {
            ip: announcement.ip,
            name: announcement.name,
            port: announcement.port,
        };
        if !self.shared.sessions.observe(info.clone()) {
            return;
        }
        tracing::info!(ip = %info.ip, name = %info.name, port = info.port, "session discovered");
        self.publish(TransportEvent::SessionListChanged);

        if self.shared.config.discovery.auto_connect {
            if let Err(e) = self.join_session(&info) {
                tracing::warn!(ip = %info.ip, error = %e, "auto-connect failed");
            }
        }
    }

    // ── Server role ──────────────────────────────────────────────────────────

    /// Bind the TCP server and start announcing. Tears down any client role
    /// and any running server first, waiting for a previous listener to
    /// release the port. Returns the bound address; with port 0 configured,
    /// announcements carry the OS-assigned port.
    pub async fn start_server(&self) -> Result<SocketAddr, TransportError> {
        loop {
            let retired = {
                let mut roles = self.roles();
                self.stop_server_locked(&mut roles);
                Self::stop_listening_locked(&mut roles);
                if let Some(mut client) = roles.client.take() {
                    client.close();
                }
                roles.session = None;
                roles.retired_server.take()
            };
            match retired {
                Some(mut server) => server.closed().await,
                None => break,
            }
        }

        let mut roles = self.roles();
        let config = &self.shared.config;
        let mut server = TcpServer::new(config.network.port, config.network.receive_buffer_bytes);
        let events = self.ingest(IngestRole::Server, Some(server.clients()));
        let addr = server.start(events)?;

        let announcers = open_announcers(&self.shared.targets, config.discovery.discovery_port);
        if announcers.is_empty() {
            server.stop();
            roles.retired_server = Some(server);
            return Err(TransportError::NoAnnouncer);
        }

        let params = AnnounceParams {
            text: config.discovery.announce_text.clone(),
            name: self.shared.server_name.clone(),
            port: addr.port(),
        };
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(announce_loop(
            announcers,
            params,
            config.discovery.announce_delay(),
            config.discovery.announce_interval(),
            shutdown_rx,
        ));

        roles.server = Some(server);
        roles.announce_shutdown = Some(shutdown_tx);
        roles.server_addr = Some(addr);
        drop(roles);

        tracing::info!(%addr, name = %self.shared.server_name, "server started");
        self.publish(TransportEvent::ConnectionStatusChanged {
            state: TransportState::Serving,
        });
        Ok(addr)
    }

    pub fn stop_server(&self) {
        let was_serving = {
            let mut roles = self.roles();
            let serving = roles.server.is_some();
            self.stop_server_locked(&mut roles);
            serving
        };
        if was_serving {
            self.publish(TransportEvent::ConnectionStatusChanged { state: self.state() });
        }
    }

    fn stop_server_locked(&self, roles: &mut Roles) {
        if let Some(tx) = roles.announce_shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(mut server) = roles.server.take() {
            server.stop();
            roles.retired_server = Some(server);
        }
        roles.server_addr = None;
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    /// Server role: send to every client. Client role: send to the server.
    pub fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.is_server() {
            self.send_to_all(envelope).map(|_| ())
        } else {
            self.send_to_server(envelope)
        }
    }

    /// Pack and [`send`](Self::send) a typed message.
    pub fn send_message<M: JsonMessage>(&self, message: &M) -> Result<(), TransportError> {
        self.send(&message.pack()?)
    }

    pub fn send_to_server(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let roles = self.roles();
        let client = roles.client.as_ref().ok_or(TransportError::NotConnected)?;
        client.send(envelope.serialize()).map_err(|e| match e {
            SocketError::NotConnected => TransportError::NotConnected,
            other => other.into(),
        })
    }

    /// Returns how many clients the envelope was queued for.
    pub fn send_to_all(&self, envelope: &Envelope) -> Result<usize, TransportError> {
        let roles = self.roles();
        let server = roles.server.as_ref().ok_or(TransportError::NotServing)?;
        Ok(server.send_to_all(envelope.serialize()))
    }

    pub fn send_to_client(&self, client: SocketAddr, envelope: &Envelope) -> Result<(), TransportError> {
        let roles = self.roles();
        let server = roles.server.as_ref().ok_or(TransportError::NotServing)?;
        server.send_to_client(client, envelope.serialize())?;
        Ok(())
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Registering [`MessageType::ANNOUNCEMENT`] replaces built-in discovery.
    pub fn register_handler(&self, msg_type: MessageType, handler: impl MessageHandler) -> bool {
        self.shared.dispatcher.register(msg_type, handler)
    }

    pub fn unregister_handler(&self, msg_type: MessageType) -> bool {
        self.shared.dispatcher.unregister(msg_type)
    }

    /// Drain the queues once. Control notifications are always processed;
    /// messages only while not paused, in arrival order, each handler run to
    /// completion before the next. Returns the number of messages dispatched.
    ///
    /// Must not be called from inside a handler.
    pub async fn pump(&self) -> usize {
        let mut queues = self.shared.queues.lock().await;
        while let Ok(control) = queues.control.try_recv() {
            self.apply_control(control);
        }

        let mut dispatched = 0;
        while !self.is_paused() {
            let Ok(envelope) = queues.messages.try_recv() else {
                break;
            };
            tracing::debug!(msg_type = %envelope.msg_type, len = envelope.payload.len(), "dispatching");
            self.shared.dispatcher.dispatch(envelope).await;
            dispatched += 1;
        }
        dispatched
    }

    /// Call [`pump`](Self::pump) every `period` until shutdown.
    pub async fn run_pump(&self, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => return,
                _ = ticker.tick() => {
                    self.pump().await;
                }
            }
        }
    }

    fn apply_control(&self, control: Control) {
        match control {
            Control::ConnectedToServer(remote) => {
                tracing::debug!(%remote, "connection established");
                self.publish(TransportEvent::ConnectionStatusChanged { state: self.state() });
            }
            Control::ServerLinkEnded(remote) => {
                tracing::debug!(%remote, "server link ended");
                self.publish(TransportEvent::ConnectionStatusChanged { state: self.state() });
            }
            Control::ClientConnected(client) => {
                let index = self.shared.next_client_index.fetch_add(1, Ordering::Relaxed);
                match (AcceptClient { client_index: index }).pack() {
                    Ok(envelope) => {
                        if let Err(e) = self.send_to_client(client, &envelope) {
                            tracing::warn!(%client, error = %e, "failed to send client index");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to encode client index"),
                }
                self.publish(TransportEvent::ClientConnected { client, index });
            }
            Control::ClientDisconnected(client) => {
                self.publish(TransportEvent::ClientDisconnected { client });
            }
        }
    }

    /// Stop draining messages. They keep accumulating; none are dropped.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    pub fn unpause(&self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn state(&self) -> TransportState {
        let roles = self.roles();
        if roles.server.as_ref().is_some_and(TcpServer::is_listening) {
            return TransportState::Serving;
        }
        if let Some(client) = &roles.client {
            if client.is_open() {
                return TransportState::Connected;
            }
            if client.is_pending() {
                return TransportState::Connecting;
            }
        }
        if roles.listener.as_ref().is_some_and(UdpReceiver::is_listening) {
            return TransportState::Listening;
        }
        TransportState::Uninitialized
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    pub fn is_server(&self) -> bool {
        self.roles().server.is_some()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.shared.sessions.list()
    }

    pub fn current_session(&self) -> Option<SessionInfo> {
        self.roles().session.clone()
    }

    pub fn client_count(&self) -> usize {
        self.roles().server.as_ref().map_or(0, TcpServer::client_count)
    }

    pub fn server_name(&self) -> &str {
        &self.shared.server_name
    }

    /// Bound server port while serving, otherwise the configured port.
    pub fn port(&self) -> u16 {
        self.roles()
            .server_addr
            .map_or(self.shared.config.network.port, |a| a.port())
    }

    /// Local addresses announced to clients, one per announce target.
    pub fn server_ips(&self) -> Vec<String> {
        self.shared.targets.iter().map(|t| t.local.to_string()).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    /// Tear down every role. The transport can be started again afterwards.
    pub fn shutdown(&self) {
        let mut roles = self.roles();
        self.stop_server_locked(&mut roles);
        Self::stop_listening_locked(&mut roles);
        if let Some(mut client) = roles.client.take() {
            client.close();
        }
        roles.session = None;
        tracing::info!("transport shut down");
    }
}

// ── Ingest ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IngestRole {
    Listener,
    Client,
    Server,
}

/// Turns one role's socket events into queued envelopes and controls.
/// Holds no reference to the transport itself. Reassembly state is private
/// to one ingest, so a link that is being torn down never touches the state
/// of a newer link to the same peer.
struct Ingest {
    role: IngestRole,
    inbound: Inbound,
    reassembler: Reassembler,
    relay: Option<ClientTable>,
}

impl Ingest {
    fn new(role: IngestRole, inbound: Inbound, max_payload: usize, relay: Option<ClientTable>) -> Self {
        Self {
            role,
            inbound,
            reassembler: Reassembler::new(max_payload),
            relay,
        }
    }

    async fn run(self, mut events: mpsc::UnboundedReceiver<SocketEvent>) {
        let mut server_link = None;
        while let Some(event) = events.recv().await {
            match event {
                SocketEvent::Datagram { remote, data } => {
                    match Envelope::deserialize(Some(remote), &data) {
                        Ok(envelope) => self.enqueue(envelope),
                        Err(e) => tracing::debug!(%remote, error = %e, "ignoring malformed datagram"),
                    }
                }
                SocketEvent::Data { remote, data } => self.on_stream_data(remote, &data),
                SocketEvent::Connected { remote } => {
                    server_link = Some(remote);
                    let _ = self.inbound.control.send(Control::ConnectedToServer(remote));
                }
                SocketEvent::ClientConnected { remote } => {
                    self.reassembler.evict(&remote);
                    let _ = self.inbound.control.send(Control::ClientConnected(remote));
                }
                SocketEvent::ClientDisconnected { remote } => {
                    self.reassembler.evict(&remote);
                    let _ = self.inbound.control.send(Control::ClientDisconnected(remote));
                }
            }
        }

        if let (IngestRole::Client, Some(remote)) = (self.role, server_link) {
            let _ = self.inbound.control.send(Control::ServerLinkEnded(remote));
        }
        tracing::trace!(role = ?self.role, "ingest finished");
    }

    fn on_stream_data(&self, remote: SocketAddr, data: &[u8]) {
        let mut complete = Vec::new();
        if let Err(e) = self.reassembler.feed(remote, data, &mut complete) {
            tracing::warn!(%remote, error = %e, "discarding partial frame after parse failure");
        }
        for envelope in complete {
            if let Some(clients) = &self.relay {
                let relayed = broadcast_except(clients, Some(remote), &envelope.serialize());
                tracing::trace!(%remote, msg_type = %envelope.msg_type, relayed, "relayed");
            }
            self.enqueue(envelope);
        }
    }

    fn enqueue(&self, envelope: Envelope) {
        if self.inbound.messages.send(envelope).is_err() {
            tracing::debug!("message queue closed");
        }
    }
}
