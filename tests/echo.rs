//! Loopback echo through the ring-buffered connection variant: a client sends 100
//!  structured messages, the server echoes each one, both sides observe them in order.

mod support;

use std::sync::Arc;
use std::time::Duration;

use gamenet::{Codec, Connection, ConnectionConfig, NetManager, Packet, XorCodec};

use support::{test_message_codec, wait_until, RecordingHandler, TestMessage, CMD_TEST};

/// the message codec behind an XOR mask, as a game server would deploy it
fn masked_codec() -> Arc<dyn Codec> {
    Arc::new(XorCodec::new(test_message_codec(), vec![0, 1, 2, 3, 4, 5, 6]))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_loopback_echo() {
    let manager = NetManager::new();
    let config = ConnectionConfig {
        send_packet_cache_cap: 16,
        ..Default::default()
    };

    let server_handler = RecordingHandler::echoing();
    let listener = manager
        .new_listener(
            "127.0.0.1:0",
            config.clone(),
            masked_codec(),
            server_handler.clone(),
            None,
        )
        .await
        .unwrap();
    let listen_addr = listener.addr().unwrap().to_string();

    let client_handler = RecordingHandler::new();
    let client = manager
        .new_connector(&listen_addr, config, masked_codec(), client_handler.clone())
        .await
        .expect("connect failed");

    for i in 1..=100 {
        let sent = client
            .send(
                CMD_TEST,
                Box::new(TestMessage {
                    number: i,
                    name: "x".to_string(),
                }),
            )
            .await;
        assert!(sent, "send {} refused", i);
    }

    assert!(
        wait_until(Duration::from_secs(5), || {
            server_handler.packet_count() == 100 && client_handler.packet_count() == 100
        })
        .await,
        "expected 100 packets on both sides, got server={} client={}",
        server_handler.packet_count(),
        client_handler.packet_count()
    );

    // both sides connected exactly once, nobody disconnected before shutdown
    assert!(
        wait_until(Duration::from_secs(1), || {
            server_handler.connected_count() == 1
        })
        .await
    );
    assert_eq!(client_handler.connected_count(), 1);
    assert_eq!(server_handler.disconnected_count(), 0);
    assert_eq!(client_handler.disconnected_count(), 0);

    // wire order is preserved on both sides
    for (handler, side) in [(&server_handler, "server"), (&client_handler, "client")] {
        let packets = handler.packets.lock().unwrap();
        for (idx, packet) in packets.iter().enumerate() {
            assert_eq!(packet.command(), CMD_TEST);
            let message = packet
                .get_message()
                .unwrap()
                .as_any()
                .downcast_ref::<TestMessage>()
                .unwrap();
            assert_eq!(message.number, idx as i32 + 1, "{} out of order", side);
            assert_eq!(message.name, "x");
        }
    }

    tokio::time::timeout(Duration::from_secs(5), manager.shutdown(true))
        .await
        .expect("shutdown timed out");

    // every connection disconnected exactly once during shutdown
    assert_eq!(server_handler.disconnected_count(), 1);
    assert_eq!(client_handler.disconnected_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_broadcast_reaches_every_client() {
    let manager = NetManager::new();

    let server_handler = RecordingHandler::new();
    let listener = manager
        .new_listener(
            "127.0.0.1:0",
            ConnectionConfig::default(),
            masked_codec(),
            server_handler.clone(),
            None,
        )
        .await
        .unwrap();
    let listen_addr = listener.addr().unwrap().to_string();

    let client_handlers = [RecordingHandler::new(), RecordingHandler::new()];
    for handler in &client_handlers {
        manager
            .new_connector(
                &listen_addr,
                ConnectionConfig::default(),
                masked_codec(),
                handler.clone(),
            )
            .await
            .expect("connect failed");
    }

    // the listener owns one accepted connection per client
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while listener.connection_count().await < 2 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "clients were not registered with the listener"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    listener
        .broadcast(&Packet::message(
            CMD_TEST,
            TestMessage {
                number: 7,
                name: "all".to_string(),
            },
        ))
        .await;

    for handler in &client_handlers {
        assert!(
            wait_until(Duration::from_secs(5), || handler.packet_count() == 1).await,
            "broadcast did not reach every client"
        );
        let packets = handler.packets.lock().unwrap();
        let message = packets[0]
            .get_message()
            .unwrap()
            .as_any()
            .downcast_ref::<TestMessage>()
            .unwrap();
        assert_eq!(message.number, 7);
        assert_eq!(message.name, "all");
    }

    tokio::time::timeout(Duration::from_secs(5), manager.shutdown(true))
        .await
        .expect("shutdown timed out");
}
