use std::time::Duration;

use annonet_core::{Envelope, MessageType};
use annonet_transport::TransportEvent;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::*;

/// A 200000-byte payload crosses TCP in many reads and arrives intact.
#[tokio::test]
async fn test_large_payload_over_tcp() {
    let (server, clients) = server_with_clients(1).await.unwrap();
    let client = &clients[0];
    let on_server = record(&server, MessageType::UPDATE_USER);
    let on_client = record(client, MessageType::UPDATE_USER);

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    client
        .send_to_server(&Envelope::new(MessageType::UPDATE_USER, payload.clone()))
        .unwrap();
    server
        .send_to_all(&Envelope::new(MessageType::UPDATE_USER, payload.clone()))
        .unwrap();

    pump_until(&[client, &server], Duration::from_secs(10), || {
        count(&on_server) == 1 && count(&on_client) == 1
    })
    .await
    .unwrap();

    assert_eq!(&on_server.lock().unwrap()[0].payload[..], &payload[..]);
    assert_eq!(&on_client.lock().unwrap()[0].payload[..], &payload[..]);

    client.shutdown();
    server.shutdown();
}

/// Frames written a few bytes at a time by a raw peer are reassembled,
/// including a zero-length frame.
#[tokio::test]
async fn test_trickled_frames_reassemble() {
    let server = Transport::new(quiet_server_config());
    let addr = server.start_server().await.unwrap();
    let touches = record(&server, MessageType::TOUCH);
    let anchors = record(&server, MessageType::WORLD_ANCHOR);

    let mut stream = TcpStream::connect((LOCALHOST, addr.port())).await.unwrap();
    stream.set_nodelay(true).unwrap();

    let mut wire = Vec::new();
    wire.extend_from_slice(&Envelope::new(MessageType::TOUCH, &b"{\"x\":1}"[..]).serialize());
    wire.extend_from_slice(&Envelope::new(MessageType::WORLD_ANCHOR, bytes::Bytes::new()).serialize());
    wire.extend_from_slice(&Envelope::new(MessageType::TOUCH, &b"{\"x\":2}"[..]).serialize());

    for piece in wire.chunks(3) {
        stream.write_all(piece).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        server.pump().await;
    }

    pump_until(&[&server], Duration::from_secs(10), || {
        count(&touches) == 2 && count(&anchors) == 1
    })
    .await
    .unwrap();

    let touches = touches.lock().unwrap();
    assert_eq!(&touches[0].payload[..], b"{\"x\":1}");
    assert_eq!(&touches[1].payload[..], b"{\"x\":2}");
    assert!(anchors.lock().unwrap()[0].payload.is_empty());
    drop(touches);

    server.shutdown();
}

/// While paused, messages queue up without loss and are delivered in order
/// after unpause. Accepting clients still works while paused.
#[tokio::test]
async fn test_pause_defers_dispatch() {
    let server = Transport::new(quiet_server_config());
    let addr = server.start_server().await.unwrap();
    let on_server = record(&server, MessageType::TOUCH);
    server.pause();
    assert!(server.is_paused());

    let client = Transport::new(local_config(0));
    let accepted = record(&client, MessageType::ACCEPT_CLIENT);
    client.connect_to_server(LOCALHOST, addr.port()).unwrap();
    pump_until(&[&client, &server], Duration::from_secs(10), || count(&accepted) == 1)
        .await
        .unwrap();

    for i in 0..3u8 {
        client
            .send_to_server(&Envelope::new(MessageType::TOUCH, vec![i]))
            .unwrap();
    }
    pump_for(&[&client, &server], Duration::from_millis(300)).await;
    assert_eq!(count(&on_server), 0);

    server.unpause();
    pump_until(&[&server], Duration::from_secs(10), || count(&on_server) == 3)
        .await
        .unwrap();
    let order: Vec<u8> = on_server.lock().unwrap().iter().map(|e| e.payload[0]).collect();
    assert_eq!(order, vec![0, 1, 2]);

    client.shutdown();
    server.shutdown();
}

/// Reconnecting to the same server repeatedly keeps framing intact on each
/// new link, even with large multi-read payloads.
#[tokio::test]
async fn test_reconnect_to_same_server_keeps_framing() {
    let (server, clients) = server_with_clients(1).await.unwrap();
    let client = &clients[0];
    let port = server.port();
    let received = record(client, MessageType::UPDATE_USER);
    let mut server_events = server.subscribe();
    // Index 0 went to the first connection; each reconnect takes the next.
    let (mut last_index, mut disconnects) = (None, 0);

    for round in 0..4usize {
        client.connect_to_server(LOCALHOST, port).unwrap();
        pump_until(&[client, &server], Duration::from_secs(10), || {
            while let Ok(event) = server_events.try_recv() {
                match event {
                    TransportEvent::ClientConnected { index, .. } => last_index = Some(index),
                    TransportEvent::ClientDisconnected { .. } => disconnects += 1,
                    _ => {}
                }
            }
            last_index == Some(round as u32 + 1) && disconnects == round + 1 && client.is_connected()
        })
        .await
        .unwrap();

        let payload: Vec<u8> = (0..150_000u32).map(|i| (i as usize + round) as u8).collect();
        assert_eq!(
            server
                .send_to_all(&Envelope::new(MessageType::UPDATE_USER, payload.clone()))
                .unwrap(),
            1
        );
        pump_until(&[client, &server], Duration::from_secs(10), || count(&received) == round + 1)
            .await
            .unwrap();
        assert_eq!(&received.lock().unwrap()[round].payload[..], &payload[..]);
    }

    client.shutdown();
    server.shutdown();
}
