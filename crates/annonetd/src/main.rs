//! annonetd — headless Annonet peer.
//!
//! `annonetd server` relays between clients and announces itself;
//! `annonetd client` (the default) waits for an announcement and joins.

use anyhow::{Context, Result};

use annonet_core::config::AnnonetConfig;
use annonet_core::{AcceptClient, Envelope, JsonMessage, MessageType};
use annonet_transport::{Transport, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Server,
    Client,
}

fn parse_role(arg: Option<String>) -> Result<Role> {
    match arg.as_deref() {
        None | Some("client") => Ok(Role::Client),
        Some("server") => Ok(Role::Server),
        Some(other) => anyhow::bail!("unknown role {other:?}, expected \"server\" or \"client\""),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let role = parse_role(std::env::args().nth(1))?;

    if let Err(e) = AnnonetConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = AnnonetConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        AnnonetConfig::default()
    });
    let pump_interval = config.dispatch.pump_interval();
    tracing::info!(?role, announce_text = %config.discovery.announce_text, "annonetd starting");

    let transport = Transport::new(config);
    register_handlers(&transport, role);

    match role {
        Role::Server => {
            let addr = transport.start_server().await.context("failed to start server")?;
            tracing::info!(
                %addr,
                name = transport.server_name(),
                ips = ?transport.server_ips(),
                "serving"
            );
        }
        Role::Client => {
            transport
                .start_listening()
                .context("failed to listen for announcements")?;
        }
    }

    // Shutdown channel
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let event_printer = {
        let mut events = transport.subscribe();
        let transport = transport.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::ConnectionStatusChanged { state }) => {
                        tracing::info!(?state, "connection status changed");
                    }
                    Ok(TransportEvent::SessionListChanged) => {
                        tracing::info!(sessions = ?transport.sessions(), "session list changed");
                    }
                    Ok(TransportEvent::ClientConnected { client, index }) => {
                        tracing::info!(%client, index, clients = transport.client_count(), "client joined");
                    }
                    Ok(TransportEvent::ClientDisconnected { client }) => {
                        tracing::info!(%client, clients = transport.client_count(), "client left");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event printer lagging");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    let pump_task = {
        let transport = transport.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { transport.run_pump(pump_interval, shutdown).await })
    };

    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = pump_task          => tracing::error!("pump task exited: {:?}", r),
        r = event_printer      => tracing::error!("event printer exited: {:?}", r),
    }

    transport.shutdown();
    Ok(())
}

/// Log every known message type. The client additionally records the
/// index the server assigned it.
fn register_handlers(transport: &Transport, role: Role) {
    for tag in MessageType::FIRST_JSON_MESSAGE_TYPE..=u8::MAX {
        let msg_type = MessageType(tag);
        if msg_type == MessageType::ANNOUNCEMENT || msg_type.name().is_none() {
            continue;
        }
        transport.register_handler(msg_type, log_message);
    }
    transport.register_handler(MessageType::WORLD_ANCHOR, log_message);

    if role == Role::Client {
        transport.register_handler(MessageType::ACCEPT_CLIENT, |envelope: Envelope| async move {
            let accept = AcceptClient::unpack(&envelope)?;
            tracing::info!(index = accept.client_index, "accepted by server");
            anyhow::Ok(())
        });
    }
}

async fn log_message(envelope: Envelope) -> Result<()> {
    tracing::info!(
        msg_type = %envelope.msg_type,
        sender = ?envelope.sender,
        len = envelope.payload.len(),
        "message received"
    );
    Ok(())
}
