//! Annonet integration test harness.
//!
//! Every test runs both roles in one process over loopback, on OS-assigned
//! ports, so no privileges or network setup are needed:
//!
//!   cargo test --test integration
//!
//! Each test owns its transports and shuts them down when done.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};

use annonet_core::config::AnnonetConfig;
use annonet_core::{Envelope, MessageType};
use annonet_transport::Transport;

mod discovery;
mod relay;
mod streaming;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Loopback-only config: OS-assigned TCP port, announcements to 127.0.0.1
/// on `discovery_port`, short announce timings.
pub fn local_config(discovery_port: u16) -> AnnonetConfig {
    let mut config = AnnonetConfig::default();
    config.network.port = 0;
    config.network.connect_timeout_secs = 5;
    config.discovery.discovery_port = discovery_port;
    config.discovery.announce_addresses = vec![Ipv4Addr::LOCALHOST];
    config.discovery.announce_delay_ms = 50;
    config.discovery.announce_interval_ms = 100;
    config.discovery.server_name = "integration".into();
    config
}

/// A server nobody discovers; used where clients connect directly.
pub fn quiet_server_config() -> AnnonetConfig {
    let mut config = local_config(9);
    config.discovery.announce_delay_ms = 60_000;
    config
}

/// Pump every transport until `done` holds or `timeout` passes.
pub async fn pump_until(
    transports: &[&Transport],
    timeout: Duration,
    mut done: impl FnMut() -> bool,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        for transport in transports {
            transport.pump().await;
        }
        if done() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Pump for a fixed time, for asserting that something does *not* happen.
pub async fn pump_for(transports: &[&Transport], duration: Duration) {
    let _ = pump_until(transports, duration, || false).await;
}

/// A TCP port that was free a moment ago.
pub fn free_tcp_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap()
}

pub type Received = Arc<Mutex<Vec<Envelope>>>;

/// Register a handler that records every envelope of `msg_type`.
pub fn record(transport: &Transport, msg_type: MessageType) -> Received {
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    transport.register_handler(msg_type, move |envelope: Envelope| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push(envelope);
            anyhow::Ok(())
        }
    });
    received
}

pub fn count(received: &Received) -> usize {
    received.lock().unwrap().len()
}

/// Start a quiet server and connect `n` clients to it directly.
pub async fn server_with_clients(n: usize) -> Result<(Transport, Vec<Transport>)> {
    let server = Transport::new(quiet_server_config());
    let addr = server.start_server().await?;

    let mut clients = Vec::with_capacity(n);
    for _ in 0..n {
        let client = Transport::new(local_config(0));
        client.connect_to_server(LOCALHOST, addr.port())?;
        clients.push(client);
    }

    let mut all: Vec<&Transport> = clients.iter().collect();
    all.push(&server);
    pump_until(&all, Duration::from_secs(10), || {
        server.client_count() == n && clients.iter().all(Transport::is_connected)
    })
    .await?;

    Ok((server, clients))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// A transport can serve, shut down, and serve again.
#[tokio::test]
async fn test_server_restarts_cleanly() {
    let server = Transport::new(quiet_server_config());
    let first = server.start_server().await.unwrap();
    assert_ne!(first.port(), 0);
    server.shutdown();
    assert!(!server.is_server());

    let second = server.start_server().await.unwrap();
    assert!(server.is_server());
    assert_ne!(second.port(), 0);
    assert_eq!(server.port(), second.port());
    server.shutdown();
}

/// On a configured port, restarting while serving, stop then start, and
/// shutdown then start all rebind the same port and keep accepting.
#[tokio::test]
async fn test_server_restarts_on_fixed_port() {
    let port = free_tcp_port();
    let mut config = quiet_server_config();
    config.network.port = port;
    let server = Transport::new(config);

    assert_eq!(server.start_server().await.unwrap().port(), port);
    assert_eq!(server.start_server().await.unwrap().port(), port);

    server.stop_server();
    assert!(!server.is_server());
    assert_eq!(server.start_server().await.unwrap().port(), port);

    server.shutdown();
    assert_eq!(server.start_server().await.unwrap().port(), port);

    let client = Transport::new(local_config(0));
    client.connect_to_server(LOCALHOST, port).unwrap();
    pump_until(&[&client, &server], Duration::from_secs(10), || {
        client.is_connected() && server.client_count() == 1
    })
    .await
    .unwrap();

    client.shutdown();
    server.shutdown();
}

/// Connecting to a port nobody listens on leaves the client disconnected.
#[tokio::test]
async fn test_connect_refused_returns_to_idle() {
    let port = free_tcp_port();

    let client = Transport::new(local_config(0));
    client.connect_to_server(LOCALHOST, port).unwrap();

    let result = pump_until(&[&client], Duration::from_secs(5), || {
        client.state() == annonet_transport::TransportState::Uninitialized
    })
    .await;
    assert!(result.is_ok(), "client should give up on a refused connect");
    assert!(!client.is_connected());
}
