//! Big frames through the per-frame-allocating connection variant: the server pushes
//!  two back-to-back 50 MiB packets through the big-header codec, the client verifies
//!  length and byte pattern and acknowledges each one.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gamenet::{
    BigDataCodec, Codec, Connection, ConnectionConfig, ConnectionHandler, DirectConnection,
    NetManager, Packet, PacketCommand,
};

use support::wait_until;

const BIG_PAYLOAD_SIZE: usize = 50 * 1024 * 1024;
const CMD_BIG: PacketCommand = PacketCommand(2);
const CMD_ACK: PacketCommand = PacketCommand(3);

fn patterned_payload() -> Vec<u8> {
    (0..BIG_PAYLOAD_SIZE).map(|j| j as u8).collect()
}

/// pushes two 50 MiB packets as soon as the client is connected
struct BigPacketServerHandler {
    acks: AtomicUsize,
    disconnected: AtomicUsize,
}

#[async_trait]
impl ConnectionHandler for BigPacketServerHandler {
    async fn on_connected(&self, connection: Arc<dyn Connection>, success: bool) {
        if !success {
            return;
        }
        tokio::spawn(async move {
            for _ in 0..2 {
                connection
                    .send_packet(Packet::big_data(CMD_BIG, patterned_payload()))
                    .await;
            }
        });
    }

    async fn on_disconnected(&self, _connection: Arc<dyn Connection>) {
        self.disconnected.fetch_add(1, Ordering::AcqRel);
    }

    async fn on_recv_packet(&self, _connection: Arc<dyn Connection>, packet: Packet) {
        if packet.command() == CMD_ACK {
            self.acks.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn create_heartbeat_packet(&self, _connection: &Arc<dyn Connection>) -> Option<Packet> {
        None
    }
}

/// records the sizes of received big packets and acknowledges each one
struct BigPacketClientHandler {
    received: Mutex<Vec<Packet>>,
}

#[async_trait]
impl ConnectionHandler for BigPacketClientHandler {
    async fn on_connected(&self, _connection: Arc<dyn Connection>, _success: bool) {}

    async fn on_disconnected(&self, _connection: Arc<dyn Connection>) {}

    async fn on_recv_packet(&self, connection: Arc<dyn Connection>, packet: Packet) {
        {
            self.received.lock().unwrap().push(packet);
        }
        let count = self.received.lock().unwrap().len();
        connection
            .send_packet(Packet::big_data(
                CMD_ACK,
                format!("hello server {}", count).into_bytes(),
            ))
            .await;
    }

    fn create_heartbeat_packet(&self, _connection: &Arc<dyn Connection>) -> Option<Packet> {
        None
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_big_packets_end_to_end() {
    let manager = NetManager::new();
    let config = ConnectionConfig {
        send_packet_cache_cap: 8,
        max_packet_size: 64 * 1024 * 1024,
        ..Default::default()
    };

    let server_handler = Arc::new(BigPacketServerHandler {
        acks: AtomicUsize::new(0),
        disconnected: AtomicUsize::new(0),
    });
    let listener = manager
        .new_listener_custom(
            "127.0.0.1:0",
            config.clone(),
            Arc::new(BigDataCodec),
            server_handler.clone(),
            None,
            Box::new(|stream, config, codec, handler| {
                let connection: Arc<dyn Connection> =
                    DirectConnection::new_accept(stream, config, codec, handler);
                connection
            }),
        )
        .await
        .unwrap();
    let listen_addr = listener.addr().unwrap().to_string();

    let client_handler = Arc::new(BigPacketClientHandler {
        received: Mutex::new(Vec::new()),
    });
    let codec: Arc<dyn Codec> = Arc::new(BigDataCodec);
    manager
        .new_connector_custom(
            &listen_addr,
            config,
            codec,
            client_handler.clone(),
            Box::new(|config, codec, handler| {
                let connection: Arc<dyn Connection> = DirectConnection::new(config, codec, handler);
                connection
            }),
        )
        .await
        .expect("connect failed");

    assert!(
        wait_until(Duration::from_secs(30), || {
            client_handler.received.lock().unwrap().len() == 2
        })
        .await,
        "client received {} big packets",
        client_handler.received.lock().unwrap().len()
    );

    {
        let received = client_handler.received.lock().unwrap();
        for packet in received.iter() {
            assert_eq!(packet.command(), CMD_BIG);
            let payload = packet.payload().unwrap();
            assert_eq!(payload.len(), BIG_PAYLOAD_SIZE);
            // sample the pattern across the whole payload
            for i in (0..BIG_PAYLOAD_SIZE).step_by(4099) {
                assert_eq!(payload[i], i as u8, "pattern mismatch at byte {}", i);
            }
            assert_eq!(payload[BIG_PAYLOAD_SIZE - 1], (BIG_PAYLOAD_SIZE - 1) as u8);
        }
    }

    // the small acknowledgements make it back over the same connection
    assert!(
        wait_until(Duration::from_secs(5), || {
            server_handler.acks.load(Ordering::Acquire) == 2
        })
        .await
    );

    tokio::time::timeout(Duration::from_secs(10), manager.shutdown(true))
        .await
        .expect("shutdown timed out");
    assert_eq!(server_handler.disconnected.load(Ordering::Acquire), 1);
}
