//! Shared pieces for the in-process integration tests: a structured test message, a
//!  recording connection handler, and deadline polling helpers.

#![allow(dead_code)]

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};

use gamenet::{Codec, Connection, ConnectionHandler, Message, MessageCodec, Packet, PacketCommand};

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init()
        .ok();
}

pub const CMD_TEST: PacketCommand = PacketCommand(123);

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct TestMessage {
    pub number: i32,
    pub name: String,
}

impl TestMessage {
    pub fn deser(mut buf: &[u8]) -> anyhow::Result<TestMessage> {
        if buf.len() < 4 {
            bail!("truncated test message");
        }
        let number = buf.get_i32_le();
        let name = String::from_utf8(buf.to_vec())?;
        Ok(TestMessage { number, name })
    }
}

impl Message for TestMessage {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.number);
        buf.put_slice(self.name.as_bytes());
    }

    fn boxed_clone(&self) -> Box<dyn Message> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn test_message_codec() -> Arc<dyn Codec> {
    let mut codec = MessageCodec::new();
    codec.register(CMD_TEST, TestMessage::deser);
    Arc::new(codec)
}

/// Connection handler that records everything it observes. Optionally echoes every
///  received packet back, delays packet handling (to throttle the reader), or
///  produces heartbeat packets with a fixed payload.
pub struct RecordingHandler {
    echo: bool,
    recv_delay: Option<Duration>,
    heartbeat_payload: Option<Vec<u8>>,

    pub connected: AtomicUsize,
    pub connect_failures: AtomicUsize,
    pub disconnected: AtomicUsize,
    pub packets: Mutex<Vec<Packet>>,
}

impl RecordingHandler {
    fn base() -> RecordingHandler {
        RecordingHandler {
            echo: false,
            recv_delay: None,
            heartbeat_payload: None,
            connected: AtomicUsize::new(0),
            connect_failures: AtomicUsize::new(0),
            disconnected: AtomicUsize::new(0),
            packets: Mutex::new(Vec::new()),
        }
    }

    pub fn new() -> Arc<RecordingHandler> {
        Arc::new(Self::base())
    }

    pub fn echoing() -> Arc<RecordingHandler> {
        Arc::new(RecordingHandler {
            echo: true,
            ..Self::base()
        })
    }

    pub fn with_recv_delay(delay: Duration) -> Arc<RecordingHandler> {
        Arc::new(RecordingHandler {
            recv_delay: Some(delay),
            ..Self::base()
        })
    }

    pub fn with_heartbeat(payload: &[u8]) -> Arc<RecordingHandler> {
        Arc::new(RecordingHandler {
            heartbeat_payload: Some(payload.to_vec()),
            ..Self::base()
        })
    }

    pub fn packet_count(&self) -> usize {
        self.packets.lock().unwrap().len()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.load(Ordering::Acquire)
    }

    pub fn disconnected_count(&self) -> usize {
        self.disconnected.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ConnectionHandler for RecordingHandler {
    async fn on_connected(&self, _connection: Arc<dyn Connection>, success: bool) {
        if success {
            self.connected.fetch_add(1, Ordering::AcqRel);
        } else {
            self.connect_failures.fetch_add(1, Ordering::AcqRel);
        }
    }

    async fn on_disconnected(&self, _connection: Arc<dyn Connection>) {
        self.disconnected.fetch_add(1, Ordering::AcqRel);
    }

    async fn on_recv_packet(&self, connection: Arc<dyn Connection>, packet: Packet) {
        if let Some(delay) = self.recv_delay {
            tokio::time::sleep(delay).await;
        }
        {
            self.packets.lock().unwrap().push(packet.clone());
        }
        if self.echo {
            connection.send_packet(packet).await;
        }
    }

    fn create_heartbeat_packet(&self, _connection: &Arc<dyn Connection>) -> Option<Packet> {
        self.heartbeat_payload.clone().map(Packet::data)
    }
}

/// poll `cond` every few milliseconds until it holds or `timeout` has passed
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
