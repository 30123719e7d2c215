//! The per-frame-allocating connection variant. Instead of going through ring
//!  buffers it allocates one buffer per inbound frame and writes outbound frames
//!  straight to the socket, which lets it carry frames up to the big header's 4 GiB
//!  limit - far beyond any reasonable ring size. Lifecycle, timers and handler
//!  behavior are identical to the ring variant.

use std::io::ErrorKind;
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
    spawn_supervised, write_full, write_loop, Connection, ConnectionCore, ConnectionHandler,
    FrameSink, OnClose,
};
use crate::net_manager::NetContext;
use crate::packet::{Message, Packet, PacketCommand};

pub struct DirectConnection {
    core: Arc<ConnectionCore>,
}

impl DirectConnection {
    /// connector-role connection; dial it with [Connection::connect]
    pub fn new(
        config: Arc<ConnectionConfig>,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Arc<DirectConnection> {
        Arc::new(DirectConnection {
            core: Arc::new(ConnectionCore::new(true, config, codec, handler)),
        })
    }

    /// acceptor-role connection wrapping an already-connected socket
    pub fn new_accept(
        stream: TcpStream,
        config: Arc<ConnectionConfig>,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Arc<DirectConnection> {
        let connection = DirectConnection {
            core: Arc::new(ConnectionCore::new(false, config, codec, handler)),
        };
        connection.core.attach_stream(stream);
        Arc::new(connection)
    }
}

#[async_trait]
impl Connection for DirectConnection {
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

        let sink = DirectFrameSink {
            core: self.core.clone(),
            write_half,
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

/// socket → per-frame buffer → handler; frames are read with exact-length reads, so
///  short reads are looped over inside the runtime
async fn read_loop(
    core: Arc<ConnectionCore>,
    as_dyn: Arc<dyn Connection>,
    mut read_half: OwnedReadHalf,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    trace!("read loop started for connection {}", core.connection_id);

    let codec = core.codec.clone();
    let header_len = codec.header_len();
    let max_payload = core
        .config
        .effective_max_packet_size(codec.max_payload_len());
    let mut header_buf = vec![0u8; header_len];

    while core.is_connected() {
        let res = tokio::select! {
            res = read_half.read_exact(&mut header_buf) => res,
            _ = shutdown.recv() => return Ok(()),
        };
        match res {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                // EOF at a frame boundary: peer-initiated close
                trace!("connection {} reached EOF", core.connection_id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let header = codec.parse_header(&header_buf)?;
        let payload_len = header.len();
        if payload_len > max_payload {
            bail!(
                "connection {}: inbound frame of {} bytes exceeds the limit of {}",
                core.connection_id,
                payload_len,
                max_payload
            );
        }

        let mut frame = vec![0u8; header_len + payload_len as usize];
        frame[..header_len].copy_from_slice(&header_buf);
        if payload_len > 0 {
            let res = tokio::select! {
                res = read_half.read_exact(&mut frame[header_len..]) => res,
                _ = shutdown.recv() => return Ok(()),
            };
            match res {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    trace!("connection {} reached EOF mid-frame", core.connection_id);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        let packet = codec.decode(&frame)?;
        core.touch_recv_tick();
        core.handler.on_recv_packet(as_dyn.clone(), packet).await;
    }
    Ok(())
}

/// send queue → encode → socket, two writes per frame (header, then payload)
struct DirectFrameSink {
    core: Arc<ConnectionCore>,
    write_half: OwnedWriteHalf,
}

#[async_trait]
impl FrameSink for DirectFrameSink {
    async fn write_packet(
        &mut self,
        packet: Packet,
        _queue: &mut mpsc::Receiver<Packet>,
    ) -> anyhow::Result<()> {
        let codec = self.core.codec.clone();
        let payload = codec.encode(&packet)?;
        let header = codec.create_header(&packet, &payload)?;

        let mut header_buf = BytesMut::with_capacity(header.serialized_len());
        header.ser(&mut header_buf);

        let write_timeout = self.core.config.write_timeout;
        write_full(&mut self.write_half, write_timeout, &header_buf).await?;
        write_full(&mut self.write_half, write_timeout, &payload).await
    }
}
