//! Codecs translate between [Packet]s and the bytes of a frame's payload, and they own
//!  the choice of header layout. The connection drives them through the [Codec] trait:
//!  encode produces payload bytes (no header), decode receives one complete frame
//!  *including* its header bytes.

use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::{BufMut, BytesMut};
use rustc_hash::FxHashMap;

use crate::packet::{Message, Packet, PacketCommand};
use crate::packet_header::{
    BigPacketHeader, FrameHeader, PacketHeader, BIG_PACKET_HEADER_LEN, MAX_BIG_PACKET_DATA_SIZE,
    MAX_PACKET_DATA_SIZE, PACKET_HEADER_LEN,
};

pub trait Codec: Send + Sync + 'static {
    /// serialized header size of this codec's wire format, constant per codec
    fn header_len(&self) -> usize;

    /// the wire format's own payload limit, before configuration narrows it further
    fn max_payload_len(&self) -> u32;

    /// parse header bytes peeked from the stream (exactly [Codec::header_len] bytes)
    fn parse_header(&self, header_bytes: &[u8]) -> anyhow::Result<FrameHeader>;

    /// Build the header for an outgoing packet from its final payload bytes. An
    ///  oversize payload is a fatal encode error.
    fn create_header(&self, packet: &Packet, payload: &[u8]) -> anyhow::Result<FrameHeader>;

    /// encode a packet to its payload bytes (the header is *not* included)
    fn encode(&self, packet: &Packet) -> anyhow::Result<BytesMut>;

    /// decode one fully buffered frame (header bytes included) into a packet
    fn decode(&self, frame: &[u8]) -> anyhow::Result<Packet>;
}

fn checked_payload_len(len: usize, format_max: u32) -> anyhow::Result<u32> {
    if len as u64 > format_max as u64 {
        bail!("payload of {} bytes exceeds the format maximum of {}", len, format_max);
    }
    Ok(len as u32)
}

/// The payload bytes an outgoing packet contributes: the serialized message for
///  structured packets, the raw bytes for the opaque variants (which double as
///  pre-serialized message bytes when an application re-sends a received packet).
fn raw_payload(packet: &Packet, buf: &mut BytesMut) {
    match packet {
        Packet::Message { message, .. } => message.ser(buf),
        Packet::Data { payload } => buf.put_slice(payload),
        Packet::BigData { payload, .. } => buf.put_slice(payload),
    }
}

type MessageFactory = Box<dyn Fn(&[u8]) -> anyhow::Result<Arc<dyn Message>> + Send + Sync>;

/// Codec for structured messages over the small header. The first two payload bytes
///  carry the command (little-endian), followed by the serialized message; decoding
///  dispatches on the command through a registry of per-command factories.
///
/// The registry is populated by the application before the codec is shared with
///  connections - receiving a command without a registered factory is a protocol
///  error and closes the connection.
pub struct MessageCodec {
    factories: FxHashMap<PacketCommand, MessageFactory>,
}

impl MessageCodec {
    pub fn new() -> MessageCodec {
        MessageCodec {
            factories: FxHashMap::default(),
        }
    }

    pub fn register<M, F>(&mut self, command: PacketCommand, deser: F)
    where
        M: Message,
        F: Fn(&[u8]) -> anyhow::Result<M> + Send + Sync + 'static,
    {
        let factory: MessageFactory = Box::new(move |buf| {
            let message: Arc<dyn Message> = Arc::new(deser(buf)?);
            Ok(message)
        });
        self.factories.insert(command, factory);
    }
}

impl Default for MessageCodec {
    fn default() -> MessageCodec {
        MessageCodec::new()
    }
}

impl Codec for MessageCodec {
    fn header_len(&self) -> usize {
        PACKET_HEADER_LEN
    }

    fn max_payload_len(&self) -> u32 {
        MAX_PACKET_DATA_SIZE
    }

    fn parse_header(&self, mut header_bytes: &[u8]) -> anyhow::Result<FrameHeader> {
        Ok(FrameHeader::Small(PacketHeader::deser(&mut header_bytes)?))
    }

    fn create_header(&self, _packet: &Packet, payload: &[u8]) -> anyhow::Result<FrameHeader> {
        let len = checked_payload_len(payload.len(), MAX_PACKET_DATA_SIZE)?;
        Ok(FrameHeader::Small(PacketHeader::new(len, 0)))
    }

    fn encode(&self, packet: &Packet) -> anyhow::Result<BytesMut> {
        let mut buf = BytesMut::new();
        buf.put_u16_le(packet.command().0);
        raw_payload(packet, &mut buf);
        Ok(buf)
    }

    fn decode(&self, frame: &[u8]) -> anyhow::Result<Packet> {
        let payload = frame
            .get(PACKET_HEADER_LEN..)
            .ok_or_else(|| anyhow!("frame shorter than its header"))?;
        if payload.len() < 2 {
            bail!("message frame without a command");
        }
        let command = PacketCommand(u16::from_le_bytes([payload[0], payload[1]]));

        let factory = self
            .factories
            .get(&command)
            .ok_or_else(|| anyhow!("no message factory registered for {:?}", command))?;
        let message = factory(&payload[2..])?;

        Ok(Packet::Message { command, message })
    }
}

/// Codec for opaque payloads over the small header: bytes go on the wire verbatim,
///  there is no command.
pub struct DataCodec;

impl Codec for DataCodec {
    fn header_len(&self) -> usize {
        PACKET_HEADER_LEN
    }

    fn max_payload_len(&self) -> u32 {
        MAX_PACKET_DATA_SIZE
    }

    fn parse_header(&self, mut header_bytes: &[u8]) -> anyhow::Result<FrameHeader> {
        Ok(FrameHeader::Small(PacketHeader::deser(&mut header_bytes)?))
    }

    fn create_header(&self, _packet: &Packet, payload: &[u8]) -> anyhow::Result<FrameHeader> {
        let len = checked_payload_len(payload.len(), MAX_PACKET_DATA_SIZE)?;
        Ok(FrameHeader::Small(PacketHeader::new(len, 0)))
    }

    fn encode(&self, packet: &Packet) -> anyhow::Result<BytesMut> {
        let mut buf = BytesMut::new();
        raw_payload(packet, &mut buf);
        Ok(buf)
    }

    fn decode(&self, frame: &[u8]) -> anyhow::Result<Packet> {
        let payload = frame
            .get(PACKET_HEADER_LEN..)
            .ok_or_else(|| anyhow!("frame shorter than its header"))?;
        Ok(Packet::Data {
            payload: payload.to_vec(),
        })
    }
}

/// Wraps another codec and XOR-masks the payload bytes with a fixed key, symmetrically
///  on encode and decode. Header bytes are never masked.
pub struct XorCodec {
    inner: Arc<dyn Codec>,
    key: Vec<u8>,
}

impl XorCodec {
    pub fn new(inner: Arc<dyn Codec>, key: Vec<u8>) -> XorCodec {
        assert!(!key.is_empty(), "XOR key must not be empty");
        XorCodec { inner, key }
    }

    fn apply_key(&self, data: &mut [u8]) {
        for (i, b) in data.iter_mut().enumerate() {
            *b ^= self.key[i % self.key.len()];
        }
    }
}

impl Codec for XorCodec {
    fn header_len(&self) -> usize {
        self.inner.header_len()
    }

    fn max_payload_len(&self) -> u32 {
        self.inner.max_payload_len()
    }

    fn parse_header(&self, header_bytes: &[u8]) -> anyhow::Result<FrameHeader> {
        self.inner.parse_header(header_bytes)
    }

    fn create_header(&self, packet: &Packet, payload: &[u8]) -> anyhow::Result<FrameHeader> {
        self.inner.create_header(packet, payload)
    }

    fn encode(&self, packet: &Packet) -> anyhow::Result<BytesMut> {
        let mut payload = self.inner.encode(packet)?;
        self.apply_key(&mut payload);
        Ok(payload)
    }

    fn decode(&self, frame: &[u8]) -> anyhow::Result<Packet> {
        let mut unmasked = frame.to_vec();
        let header_len = self.inner.header_len();
        if unmasked.len() < header_len {
            bail!("frame shorter than its header");
        }
        self.apply_key(&mut unmasked[header_len..]);
        self.inner.decode(&unmasked)
    }
}

/// Codec for opaque payloads over the big header, used by the per-frame-allocating
///  connection variant. The command travels in the header, so payloads up to 4 GiB
///  stay completely opaque.
pub struct BigDataCodec;

impl Codec for BigDataCodec {
    fn header_len(&self) -> usize {
        BIG_PACKET_HEADER_LEN
    }

    fn max_payload_len(&self) -> u32 {
        MAX_BIG_PACKET_DATA_SIZE
    }

    fn parse_header(&self, mut header_bytes: &[u8]) -> anyhow::Result<FrameHeader> {
        Ok(FrameHeader::Big(BigPacketHeader::deser(&mut header_bytes)?))
    }

    fn create_header(&self, packet: &Packet, payload: &[u8]) -> anyhow::Result<FrameHeader> {
        let len = checked_payload_len(payload.len(), MAX_BIG_PACKET_DATA_SIZE)?;
        Ok(FrameHeader::Big(BigPacketHeader::new(
            len,
            packet.command().0,
            0,
        )))
    }

    fn encode(&self, packet: &Packet) -> anyhow::Result<BytesMut> {
        let mut buf = BytesMut::new();
        raw_payload(packet, &mut buf);
        Ok(buf)
    }

    fn decode(&self, frame: &[u8]) -> anyhow::Result<Packet> {
        let header = self.parse_header(frame.get(..BIG_PACKET_HEADER_LEN).unwrap_or(frame))?;
        let payload = &frame[BIG_PACKET_HEADER_LEN..];
        Ok(Packet::BigData {
            command: header.command(),
            payload: payload.to_vec(),
        })
    }
}
