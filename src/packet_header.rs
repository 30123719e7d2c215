use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

use crate::packet::PacketCommand;

/// upper bound for the payload length of a small-header frame (28 bits)
pub const MAX_PACKET_DATA_SIZE: u32 = 0x0FFF_FFFF;
/// upper bound for the payload length of a big-header frame (4 GiB - 1)
pub const MAX_BIG_PACKET_DATA_SIZE: u32 = 0xFFFF_FFFF;

pub const PACKET_HEADER_LEN: usize = 4;
pub const BIG_PACKET_HEADER_LEN: usize = 8;

/// The small packet header: a single little-endian u32 packing `flags` into the high
///  4 bits and the payload length into the low 28 bits.
///
/// The command is *not* part of this header: the byte-stream layer only needs to know
///  where to split frames, everything else is the codec's business. Flags are reserved -
///  they are written as whatever value the codec set (0 by default) and ignored on
///  receive.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PacketHeader {
    len_and_flags: u32,
}
impl PacketHeader {
    pub fn new(len: u32, flags: u8) -> PacketHeader {
        PacketHeader {
            len_and_flags: ((flags as u32) << 28) | (len & MAX_PACKET_DATA_SIZE),
        }
    }

    /// payload length, excluding the header itself
    pub fn len(&self) -> u32 {
        self.len_and_flags & MAX_PACKET_DATA_SIZE
    }

    pub fn flags(&self) -> u8 {
        (self.len_and_flags >> 28) as u8
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len_and_flags);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < PACKET_HEADER_LEN {
            bail!("incomplete packet header");
        }
        Ok(PacketHeader {
            len_and_flags: buf.get_u32_le(),
        })
    }
}

/// The big packet header, for frames whose payload may exceed the small header's 28-bit
///  length budget. The command travels in the header rather than in the payload, so the
///  payload bytes stay completely opaque.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BigPacketHeader {
    len: u32,
    command: u16,
    flags: u16,
}
impl BigPacketHeader {
    pub fn new(len: u32, command: u16, flags: u16) -> BigPacketHeader {
        BigPacketHeader {
            len,
            command,
            flags,
        }
    }

    /// payload length, excluding the header itself
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn command(&self) -> PacketCommand {
        PacketCommand(self.command)
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len);
        buf.put_u16_le(self.command);
        buf.put_u16_le(self.flags);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<BigPacketHeader> {
        if buf.remaining() < BIG_PACKET_HEADER_LEN {
            bail!("incomplete big packet header");
        }
        Ok(BigPacketHeader {
            len: buf.get_u32_le(),
            command: buf.get_u16_le(),
            flags: buf.get_u16_le(),
        })
    }
}

/// Header of one frame in either of the two wire layouts. The codec decides which
///  layout is in effect; the connection only ever needs the serialized size and the
///  payload length.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FrameHeader {
    Small(PacketHeader),
    Big(BigPacketHeader),
}
impl FrameHeader {
    pub fn len(&self) -> u32 {
        match self {
            FrameHeader::Small(h) => h.len(),
            FrameHeader::Big(h) => h.len(),
        }
    }

    pub fn command(&self) -> PacketCommand {
        match self {
            FrameHeader::Small(_) => PacketCommand(0),
            FrameHeader::Big(h) => h.command(),
        }
    }

    pub fn serialized_len(&self) -> usize {
        match self {
            FrameHeader::Small(_) => PACKET_HEADER_LEN,
            FrameHeader::Big(_) => BIG_PACKET_HEADER_LEN,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            FrameHeader::Small(h) => h.ser(buf),
            FrameHeader::Big(h) => h.ser(buf),
        }
    }
}
