//! The ring-buffer-backed connection variant. Both directions go through
//!  fixed-capacity rings so that steady-state traffic causes no per-packet
//!  allocations: the reader fills the receive ring straight from the socket and
//!  decodes frames out of it, the writer stages header and payload bytes into the
//!  send ring and drives the socket from its contiguous chunks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{trace, warn};

use crate::codec::Codec;
use crate::config::ConnectionConfig;
use crate::connection::{
    spawn_supervised, write_loop, write_with_deadline, Connection, ConnectionCore,
    ConnectionHandler, FrameSink, OnClose,
};
use crate::net_manager::NetContext;
use crate::packet::{Message, Packet, PacketCommand};
use crate::packet_header::BIG_PACKET_HEADER_LEN;
use crate::ring_buffer::RingBuffer;

pub struct TcpConnection {
    core: Arc<ConnectionCore>,
}

impl TcpConnection {
    /// connector-role connection; dial it with [Connection::connect]
    pub fn new(
        config: Arc<ConnectionConfig>,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Arc<TcpConnection> {
        Arc::new(TcpConnection {
            core: Arc::new(ConnectionCore::new(true, config, codec, handler)),
        })
    }

    /// acceptor-role connection wrapping an already-connected socket
    pub fn new_accept(
        stream: TcpStream,
        config: Arc<ConnectionConfig>,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Arc<TcpConnection> {
        let connection = TcpConnection {
            core: Arc::new(ConnectionCore::new(false, config, codec, handler)),
        };
        connection.core.attach_stream(stream);
        Arc::new(connection)
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn connection_id(&self) -> u32 {
        self.core.connection_id
    }

    fn is_connector(&self) -> bool {
        self.core.is_connector
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.core.peer_addr()
    }

    fn send_queue_len(&self) -> usize {
        self.core.send_queue_len()
    }

    async fn send(&self, command: PacketCommand, message: Box<dyn Message>) -> bool {
        self.core
            .enqueue(Packet::Message {
                command,
                message: Arc::from(message),
            })
            .await
    }

    async fn send_packet(&self, packet: Packet) -> bool {
        self.core.enqueue(packet).await
    }

    async fn try_send_packet(&self, packet: Packet, timeout: Duration) -> bool {
        self.core.try_enqueue(packet, timeout).await
    }

    async fn connect(self: Arc<Self>, addr: &str) -> bool {
        let as_dyn: Arc<dyn Connection> = self.clone();
        self.core.dial(as_dyn, addr).await
    }

    fn start(self: Arc<Self>, ctx: &NetContext, on_close: Option<OnClose>) {
        self.core.set_on_close(on_close);

        let Some(stream) = self.core.take_stream() else {
            warn!("connection {} started without a socket", self.core.connection_id);
            return;
        };
        let Some(send_rx) = self.core.take_send_rx() else {
            warn!("connection {} started twice", self.core.connection_id);
            return;
        };
        let (read_half, write_half) = stream.into_split();
        let as_dyn: Arc<dyn Connection> = self.clone();

        spawn_supervised(
            ctx,
            "read loop",
            as_dyn.clone(),
            read_loop(
                self.core.clone(),
                as_dyn.clone(),
                read_half,
                self.core.subscribe_shutdown(),
            ),
        );

        let sink = RingFrameSink {
            core: self.core.clone(),
            write_half,
            ring: RingBuffer::new(self.core.config.send_buffer_size),
        };
        spawn_supervised(
            ctx,
            "write loop",
            as_dyn.clone(),
            write_loop(
                self.core.clone(),
                as_dyn,
                sink,
                send_rx,
                self.core.subscribe_shutdown(),
                ctx.subscribe_shutdown(),
            ),
        );
    }

    async fn close(self: Arc<Self>) {
        let as_dyn: Arc<dyn Connection> = self.clone();
        self.core.close(as_dyn).await;
    }
}

/// socket → receive ring → frames → handler
async fn read_loop(
    core: Arc<ConnectionCore>,
    as_dyn: Arc<dyn Connection>,
    mut read_half: OwnedReadHalf,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    trace!("read loop started for connection {}", core.connection_id);

    let max_payload = core
        .config
        .effective_max_packet_size(core.codec.max_payload_len());
    let mut ring = RingBuffer::new(core.config.recv_buffer_size);
    let mut scratch = Vec::new();

    while core.is_connected() {
        let view = ring.writable_continuous();
        if view.is_empty() {
            bail!(
                "inbound frame does not fit the {} byte receive ring",
                ring.capacity()
            );
        }
        let n = tokio::select! {
            res = read_half.read(view) => res?,
            _ = shutdown.recv() => return Ok(()),
        };
        if n == 0 {
            // EOF: peer-initiated close
            trace!("connection {} reached EOF", core.connection_id);
            return Ok(());
        }
        ring.commit_write(n);

        drain_frames(&core, &as_dyn, &mut ring, &mut scratch, max_payload).await?;
    }
    Ok(())
}

/// Decode and deliver every complete frame currently buffered in the receive ring.
///  Partial frames stay in the ring until more bytes arrive.
async fn drain_frames(
    core: &ConnectionCore,
    as_dyn: &Arc<dyn Connection>,
    ring: &mut RingBuffer,
    scratch: &mut Vec<u8>,
    max_payload: u32,
) -> anyhow::Result<()> {
    let codec = &core.codec;
    let header_len = codec.header_len();
    let mut header_bytes = [0u8; BIG_PACKET_HEADER_LEN];

    while ring.readable_len() >= header_len {
        ring.peek(&mut header_bytes[..header_len]);
        let header = codec.parse_header(&header_bytes[..header_len])?;

        let payload_len = header.len();
        if payload_len > max_payload {
            bail!(
                "connection {}: inbound frame of {} bytes exceeds the limit of {}",
                core.connection_id,
                payload_len,
                max_payload
            );
        }
        let frame_len = header_len + payload_len as usize;
        if frame_len > ring.capacity() {
            bail!(
                "connection {}: inbound frame of {} bytes cannot fit the {} byte receive ring",
                core.connection_id,
                frame_len,
                ring.capacity()
            );
        }
        if ring.readable_len() < frame_len {
            break;
        }

        let packet = {
            let view = ring.peek_continuous();
            if view.len() >= frame_len {
                codec.decode(&view[..frame_len])?
            } else {
                // the frame spans the wrap point: assemble it in the reused scratch buffer
                scratch.resize(frame_len, 0);
                ring.peek(&mut scratch[..frame_len]);
                codec.decode(&scratch[..frame_len])?
            }
        };
        ring.commit_read(frame_len);

        core.touch_recv_tick();
        core.handler.on_recv_packet(as_dyn.clone(), packet).await;
    }
    Ok(())
}

/// send queue → encode → send ring → socket
struct RingFrameSink {
    core: Arc<ConnectionCore>,
    write_half: OwnedWriteHalf,
    ring: RingBuffer,
}

#[async_trait]
impl FrameSink for RingFrameSink {
    async fn write_packet(
        &mut self,
        packet: Packet,
        queue: &mut mpsc::Receiver<Packet>,
    ) -> anyhow::Result<()> {
        self.stage_frame(packet).await?;

        // coalesce whatever else is already queued before hitting the socket
        while let Ok(packet) = queue.try_recv() {
            self.stage_frame(packet).await?;
        }
        self.drain_all().await
    }
}

impl RingFrameSink {
    /// encode one packet and stage header + payload into the send ring, pushing bytes
    ///  to the socket whenever the ring runs out of space
    async fn stage_frame(&mut self, packet: Packet) -> anyhow::Result<()> {
        let codec = self.core.codec.clone();
        let payload = codec.encode(&packet)?;
        let header = codec.create_header(&packet, &payload)?;

        let mut header_buf = BytesMut::with_capacity(header.serialized_len());
        header.ser(&mut header_buf);

        self.stage_bytes(&header_buf).await?;
        self.stage_bytes(&payload).await
    }

    async fn stage_bytes(&mut self, mut data: &[u8]) -> anyhow::Result<()> {
        loop {
            let n = self.ring.write(data);
            data = &data[n..];
            if data.is_empty() {
                return Ok(());
            }
            // ring full: the socket has to make room first
            self.drain_some().await?;
        }
    }

    /// one socket write from the ring's contiguous readable chunk
    async fn drain_some(&mut self) -> anyhow::Result<()> {
        let chunk = self.ring.peek_continuous();
        if chunk.is_empty() {
            return Ok(());
        }
        let n =
            write_with_deadline(&mut self.write_half, self.core.config.write_timeout, chunk).await?;
        self.ring.commit_read(n);
        Ok(())
    }

    async fn drain_all(&mut self) -> anyhow::Result<()> {
        while self.ring.readable_len() > 0 {
            self.drain_some().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataCodec;
    use crate::connection::MockConnectionHandler;

    #[tokio::test]
    async fn test_close_notifies_handler_exactly_once() {
        let mut handler = MockConnectionHandler::new();
        handler.expect_on_disconnected().times(1).returning(|_| ());

        let connection = TcpConnection::new(
            Arc::new(ConnectionConfig::default()),
            Arc::new(DataCodec),
            Arc::new(handler),
        );

        connection.clone().close().await;
        connection.clone().close().await;
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn test_send_refused_while_not_connected() {
        let mut handler = MockConnectionHandler::new();
        handler.expect_on_disconnected().returning(|_| ());

        let connection = TcpConnection::new(
            Arc::new(ConnectionConfig::default()),
            Arc::new(DataCodec),
            Arc::new(handler),
        );

        assert!(!connection.send_packet(Packet::data(vec![1])).await);
        assert!(
            !connection
                .try_send_packet(Packet::data(vec![2]), Duration::ZERO)
                .await
        );
    }
}
