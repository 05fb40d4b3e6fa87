use std::time::Duration;

use annonet_core::{Envelope, MessageType};
use annonet_transport::TransportEvent;

use crate::*;

const SCRIBBLE: MessageType = MessageType(7);

/// Client A's message is dispatched once on the server and forwarded to B
/// and C, never back to A.
#[tokio::test]
async fn test_relay_excludes_origin() {
    let (server, clients) = server_with_clients(3).await.unwrap();
    let on_server = record(&server, SCRIBBLE);
    let on_clients: Vec<Received> = clients.iter().map(|c| record(c, SCRIBBLE)).collect();

    clients[0]
        .send_to_server(&Envelope::new(SCRIBBLE, &b"hi"[..]))
        .unwrap();

    let mut all: Vec<&Transport> = clients.iter().collect();
    all.push(&server);
    pump_until(&all, Duration::from_secs(10), || {
        count(&on_server) == 1 && count(&on_clients[1]) == 1 && count(&on_clients[2]) == 1
    })
    .await
    .unwrap();

    // Give a stray echo time to show up.
    pump_for(&all, Duration::from_millis(200)).await;
    assert_eq!(count(&on_server), 1);
    assert_eq!(count(&on_clients[0]), 0, "origin must not receive its own message");

    for received in &on_clients[1..] {
        let envelope = &received.lock().unwrap()[0];
        assert_eq!(envelope.msg_type, SCRIBBLE);
        assert_eq!(&envelope.payload[..], b"hi");
    }

    for client in &clients {
        client.shutdown();
    }
    server.shutdown();
}

/// Relayed traffic from several senders keeps each sender's order.
#[tokio::test]
async fn test_relay_preserves_per_sender_order() {
    let (server, clients) = server_with_clients(3).await.unwrap();
    let at_c = record(&clients[2], SCRIBBLE);

    for i in 0..50u8 {
        clients[0].send_to_server(&Envelope::new(SCRIBBLE, vec![b'a', i])).unwrap();
        clients[1].send_to_server(&Envelope::new(SCRIBBLE, vec![b'b', i])).unwrap();
    }

    let mut all: Vec<&Transport> = clients.iter().collect();
    all.push(&server);
    pump_until(&all, Duration::from_secs(10), || count(&at_c) == 100)
        .await
        .unwrap();

    let received = at_c.lock().unwrap();
    for sender in [b'a', b'b'] {
        let sequence: Vec<u8> = received
            .iter()
            .filter(|e| e.payload[0] == sender)
            .map(|e| e.payload[1])
            .collect();
        assert_eq!(sequence, (0..50).collect::<Vec<u8>>());
    }
    drop(received);

    for client in &clients {
        client.shutdown();
    }
    server.shutdown();
}

/// Server-originated sends reach every client; clients are numbered in
/// accept order and disconnects are reported.
#[tokio::test]
async fn test_server_broadcast_and_disconnect() {
    let server = Transport::new(quiet_server_config());
    let mut events = server.subscribe();
    let addr = server.start_server().await.unwrap();

    let a = Transport::new(local_config(0));
    a.connect_to_server(LOCALHOST, addr.port()).unwrap();
    pump_until(&[&a, &server], Duration::from_secs(10), || server.client_count() == 1)
        .await
        .unwrap();
    let b = Transport::new(local_config(0));
    b.connect_to_server(LOCALHOST, addr.port()).unwrap();
    pump_until(&[&a, &b, &server], Duration::from_secs(10), || {
        server.client_count() == 2 && a.is_connected() && b.is_connected()
    })
    .await
    .unwrap();

    let at_a = record(&a, MessageType::TOUCH);
    let at_b = record(&b, MessageType::TOUCH);
    assert_eq!(server.send_to_all(&Envelope::new(MessageType::TOUCH, &b"{}"[..])).unwrap(), 2);
    pump_until(&[&a, &b, &server], Duration::from_secs(10), || {
        count(&at_a) == 1 && count(&at_b) == 1
    })
    .await
    .unwrap();

    a.shutdown();
    pump_until(&[&b, &server], Duration::from_secs(10), || server.client_count() == 1)
        .await
        .unwrap();

    let mut indices = Vec::new();
    let mut disconnects = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            TransportEvent::ClientConnected { index, .. } => indices.push(index),
            TransportEvent::ClientDisconnected { .. } => disconnects += 1,
            _ => {}
        }
    }
    assert_eq!(indices, vec![0, 1]);
    assert_eq!(disconnects, 1);

    b.shutdown();
    server.shutdown();
}
