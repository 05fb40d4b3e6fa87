use std::time::Duration;

use annonet_core::{AcceptClient, JsonMessage, MessageType};
use annonet_transport::{TransportEvent, TransportState};

use crate::*;

/// A listening client with matching announce text finds the server,
/// registers exactly one session, and auto-connects.
#[tokio::test]
async fn test_discovery_and_auto_connect() {
    let client = Transport::new(local_config(0));
    let accepted = record(&client, MessageType::ACCEPT_CLIENT);
    let discovery_addr = client.start_listening().unwrap();
    assert_eq!(client.state(), TransportState::Listening);

    let server = Transport::new(local_config(discovery_addr.port()));
    let mut server_events = server.subscribe();
    let server_addr = server.start_server().await.unwrap();

    pump_until(&[&client, &server], Duration::from_secs(10), || {
        client.is_connected() && count(&accepted) == 1
    })
    .await
    .unwrap();

    let sessions = client.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].ip, "127.0.0.1");
    assert_eq!(sessions[0].port, server_addr.port());
    assert_eq!(sessions[0].name, "integration");
    assert_eq!(client.current_session(), Some(sessions[0].clone()));

    // Joining stops listening; the client is now purely connected.
    assert_eq!(client.state(), TransportState::Connected);
    assert_eq!(client.discovery_addr(), None);

    let accept = AcceptClient::unpack(&accepted.lock().unwrap()[0]).unwrap();
    assert_eq!(accept.client_index, 0);
    assert_eq!(server.client_count(), 1);

    let mut saw_client = false;
    while let Ok(event) = server_events.try_recv() {
        if let TransportEvent::ClientConnected { index, .. } = event {
            assert_eq!(index, 0);
            saw_client = true;
        }
    }
    assert!(saw_client, "server should publish ClientConnected");

    client.shutdown();
    server.shutdown();
}

/// Announcements with another announce text are ignored.
#[tokio::test]
async fn test_foreign_announce_text_is_ignored() {
    let client = Transport::new(local_config(0));
    let discovery_addr = client.start_listening().unwrap();

    let mut foreign = local_config(discovery_addr.port());
    foreign.discovery.announce_text = "other-lab".into();
    let server = Transport::new(foreign);
    server.start_server().await.unwrap();

    pump_for(&[&client, &server], Duration::from_millis(500)).await;

    assert!(client.sessions().is_empty());
    assert_eq!(client.state(), TransportState::Listening);
    assert_eq!(server.client_count(), 0);

    client.shutdown();
    server.shutdown();
}

/// With auto-connect off the session is listed but not joined until the
/// host asks.
#[tokio::test]
async fn test_manual_join() {
    let mut config = local_config(0);
    config.discovery.auto_connect = false;
    let client = Transport::new(config);
    let mut events = client.subscribe();
    let discovery_addr = client.start_listening().unwrap();

    let server = Transport::new(local_config(discovery_addr.port()));
    server.start_server().await.unwrap();

    pump_until(&[&client, &server], Duration::from_secs(10), || {
        !client.sessions().is_empty()
    })
    .await
    .unwrap();
    assert_eq!(client.state(), TransportState::Listening);

    let mut saw_list_change = false;
    while let Ok(event) = events.try_recv() {
        saw_list_change |= event == TransportEvent::SessionListChanged;
    }
    assert!(saw_list_change);

    // Further announcements from the same server don't duplicate it.
    pump_for(&[&client, &server], Duration::from_millis(300)).await;
    assert_eq!(client.sessions().len(), 1);

    let session = client.sessions().remove(0);
    client.join_session(&session).unwrap();
    pump_until(&[&client, &server], Duration::from_secs(10), || {
        client.is_connected() && server.client_count() == 1
    })
    .await
    .unwrap();

    client.shutdown();
    server.shutdown();
}

/// Sessions that stop announcing are forgotten when a TTL is configured.
#[tokio::test]
async fn test_session_expires_after_server_stops() {
    let mut config = local_config(0);
    config.discovery.auto_connect = false;
    config.discovery.session_ttl_secs = 1;
    let client = Transport::new(config);
    let discovery_addr = client.start_listening().unwrap();

    let server = Transport::new(local_config(discovery_addr.port()));
    server.start_server().await.unwrap();

    pump_until(&[&client, &server], Duration::from_secs(10), || {
        client.sessions().len() == 1
    })
    .await
    .unwrap();

    server.stop_server();
    pump_until(&[&client], Duration::from_secs(10), || client.sessions().is_empty())
        .await
        .unwrap();

    client.shutdown();
}
