use std::time::Duration;

use anyhow::bail;

use crate::packet_header::BIG_PACKET_HEADER_LEN;

/// Per-connection configuration. This is a plain input struct - how it is populated
///  (files, CLI, hard-coded defaults) is the application's business.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// capacity of the outbound packet queue, in packets. [crate::Connection::send_packet]
    ///  blocks while the queue is full, so this is the backpressure bound.
    pub send_packet_cache_cap: usize,

    /// send ring buffer size in bytes (ring connection variant only)
    pub send_buffer_size: usize,

    /// receive ring buffer size in bytes (ring connection variant only)
    pub recv_buffer_size: usize,

    /// Inbound frames whose header declares a larger payload cause the connection to
    ///  close. 0 means "use the header format's maximum".
    pub max_packet_size: u32,

    /// Interval between heartbeat emissions. Only connector-role connections emit
    ///  heartbeats; `None` disables them.
    pub heartbeat_interval: Option<Duration>,

    /// Close the connection when no complete inbound packet arrived for this long.
    ///  `None` disables idle detection.
    pub recv_timeout: Option<Duration>,

    /// Deadline for any single socket write; a slower peer is treated as failed.
    ///  `None` disables write deadlines.
    pub write_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> ConnectionConfig {
        ConnectionConfig {
            send_packet_cache_cap: 16,
            send_buffer_size: 64 * 1024,
            recv_buffer_size: 64 * 1024,
            max_packet_size: 0,
            heartbeat_interval: None,
            recv_timeout: None,
            write_timeout: None,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.send_packet_cache_cap == 0 {
            bail!("send packet cache capacity must be at least 1");
        }
        if self.send_buffer_size < BIG_PACKET_HEADER_LEN
            || self.recv_buffer_size < BIG_PACKET_HEADER_LEN
        {
            bail!("ring buffers must hold at least one packet header");
        }
        Ok(())
    }

    /// The inbound size limit actually enforced, clamped to the wire format's maximum.
    ///  A configured value of 0 means "whatever the format allows".
    pub fn effective_max_packet_size(&self, format_max: u32) -> u32 {
        if self.max_packet_size == 0 || self.max_packet_size > format_max {
            format_max
        } else {
            self.max_packet_size
        }
    }
}
