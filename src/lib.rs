//! A TCP networking library for game-style servers and clients: it frames
//!  application packets on top of the byte stream, performs bounded-buffer I/O with
//!  backpressure, runs heartbeat and liveness timers, and delivers decoded packets to
//!  application handlers on both accepted and dialed connections.
//!
//! ## Design
//!
//! * Each connection runs a *reader task* (socket → decode → handler) and a *writer
//!    task* (send queue → encode → socket). Blocking one connection never blocks
//!    another.
//! * The default [TcpConnection] moves bytes through fixed-capacity ring buffers in
//!    both directions, avoiding per-packet allocations on the hot path. The
//!    [DirectConnection] variant allocates per frame instead and handles frames up to
//!    4 GiB.
//! * The send queue is a bounded FIFO: [Connection::send_packet] blocks while it is
//!    full (backpressure), [Connection::try_send_packet] refuses instead - for
//!    packets that are allowed to be dropped.
//! * Connector-role connections emit heartbeats; either side can close an idle
//!    connection via the recv timeout. All failures surface as
//!    [ConnectionHandler::on_disconnected] plus logs.
//! * [NetManager::shutdown] cancels a root signal that every writer observes; the
//!    writer closes its connection, which unblocks the reader - both tasks converge on
//!    a one-shot close.
//!
//! ## Wire format
//!
//! Each frame is a fixed-size little-endian header followed by `len` payload bytes.
//!
//! Small header (4 bytes, payloads up to 256 MiB):
//! ```ascii
//! 0: len_and_flags (u32 LE) - flags in the high 4 bits, payload length in the low 28
//! ```
//!
//! Big header (8 bytes, payloads up to 4 GiB, used by [BigDataCodec]):
//! ```ascii
//! 0: len (u32 LE)
//! 4: command (u16 LE)
//! 6: flags (u16 LE)
//! ```
//!
//! With the small header, structured-message codecs put the command in the first two
//!  payload bytes; with the big header the command travels in the header and the
//!  payload stays opaque. Flags are reserved: written as 0, ignored on receive.

pub mod codec;
pub mod config;
pub mod connection;
pub mod direct_connection;
pub mod listener;
pub mod net_manager;
pub mod packet;
pub mod packet_header;
pub mod ring_buffer;
pub mod tcp_connection;

pub use codec::{BigDataCodec, Codec, DataCodec, MessageCodec, XorCodec};
pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionHandler, OnClose};
pub use direct_connection::DirectConnection;
pub use listener::{AcceptFactory, Listener, ListenerHandler};
pub use net_manager::{ConnectorFactory, NetContext, NetManager};
pub use packet::{Message, Packet, PacketCommand};
pub use packet_header::{
    BigPacketHeader, FrameHeader, PacketHeader, BIG_PACKET_HEADER_LEN, MAX_BIG_PACKET_DATA_SIZE,
    MAX_PACKET_DATA_SIZE, PACKET_HEADER_LEN,
};
pub use ring_buffer::RingBuffer;
pub use tcp_connection::TcpConnection;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
