use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use bytes::BytesMut;

/// A [PacketCommand] identifies the application-level type of a packet. The network layer
///  only needs it for dispatch on the receiving side - what a given command means is
///  entirely up to the application.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PacketCommand(pub u16);

impl Debug for PacketCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "cmd#{}", self.0)
    }
}

/// Structured messages are pluggable: a message knows how to serialize itself, and the
///  codec's per-command factory registry takes care of deserialization and dispatch.
///
/// The serialization format is the application's choice - the library only sees bytes.
pub trait Message: Send + Sync + 'static {
    /// serialize into the (already command-prefixed) payload buffer
    fn ser(&self, buf: &mut BytesMut);

    /// deep copy, used by [Packet::clone]
    fn boxed_clone(&self) -> Box<dyn Message>;

    /// downcast support for handlers working with concrete message types
    fn as_any(&self) -> &dyn Any;
}

/// A [Packet] is one application-level message: a frame after decode or before encode.
///
/// The variants differ in how the payload is represented and where the command travels
///  on the wire:
/// * [Packet::Message] carries a structured message (small header, command in the first
///    two payload bytes)
/// * [Packet::Data] carries opaque bytes without a command (small header)
/// * [Packet::BigData] carries opaque bytes with the command in the big header, for
///    frames that may exceed any reasonable ring buffer size
pub enum Packet {
    Message {
        command: PacketCommand,
        message: Arc<dyn Message>,
    },
    Data {
        payload: Vec<u8>,
    },
    BigData {
        command: PacketCommand,
        payload: Vec<u8>,
    },
}

impl Packet {
    pub fn message(command: PacketCommand, message: impl Message) -> Packet {
        Packet::Message {
            command,
            message: Arc::new(message),
        }
    }

    pub fn data(payload: Vec<u8>) -> Packet {
        Packet::Data { payload }
    }

    pub fn big_data(command: PacketCommand, payload: Vec<u8>) -> Packet {
        Packet::BigData { command, payload }
    }

    pub fn command(&self) -> PacketCommand {
        match self {
            Packet::Message { command, .. } => *command,
            Packet::Data { .. } => PacketCommand(0),
            Packet::BigData { command, .. } => *command,
        }
    }

    pub fn get_message(&self) -> Option<&dyn Message> {
        match self {
            Packet::Message { message, .. } => Some(message.as_ref()),
            _ => None,
        }
    }

    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Packet::Message { .. } => None,
            Packet::Data { payload } => Some(payload),
            Packet::BigData { payload, .. } => Some(payload),
        }
    }
}

impl Clone for Packet {
    /// deep copy - payload bytes and structured messages are duplicated, so mutating
    ///  the original never affects the clone
    fn clone(&self) -> Packet {
        match self {
            Packet::Message { command, message } => Packet::Message {
                command: *command,
                message: Arc::from(message.boxed_clone()),
            },
            Packet::Data { payload } => Packet::Data {
                payload: payload.clone(),
            },
            Packet::BigData { command, payload } => Packet::BigData {
                command: *command,
                payload: payload.clone(),
            },
        }
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Packet::Message { command, .. } => write!(f, "Packet::Message({:?})", command),
            Packet::Data { payload } => write!(f, "Packet::Data(len:{})", payload.len()),
            Packet::BigData { command, payload } => {
                write!(f, "Packet::BigData({:?}, len:{})", command, payload.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use rstest::rstest;

    #[derive(Clone, Eq, PartialEq, Debug)]
    pub struct TestMessage {
        pub number: i32,
        pub name: String,
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

    #[rstest]
    #[case::zero(PacketCommand(0), "cmd#0")]
    #[case::small(PacketCommand(123), "cmd#123")]
    #[case::max(PacketCommand(u16::MAX), "cmd#65535")]
    fn test_command_debug(#[case] command: PacketCommand, #[case] expected: &str) {
        assert_eq!(format!("{:?}", command), expected);
    }

    #[test]
    fn test_data_clone_is_deep() {
        let mut original = Packet::data(vec![1, 2, 3]);
        let cloned = original.clone();

        if let Packet::Data { payload } = &mut original {
            payload[0] = 99;
        }

        assert_eq!(cloned.payload(), Some([1u8, 2, 3].as_ref()));
        assert_eq!(original.payload(), Some([99u8, 2, 3].as_ref()));
    }

    #[test]
    fn test_big_data_clone_is_deep() {
        let mut original = Packet::big_data(PacketCommand(7), vec![5, 6]);
        let cloned = original.clone();

        if let Packet::BigData { payload, .. } = &mut original {
            payload.clear();
        }

        assert_eq!(cloned.command(), PacketCommand(7));
        assert_eq!(cloned.payload(), Some([5u8, 6].as_ref()));
    }

    #[test]
    fn test_message_clone_copies_message() {
        let original = Packet::message(
            PacketCommand(3),
            TestMessage {
                number: 42,
                name: "x".to_string(),
            },
        );
        let cloned = original.clone();

        let original_msg = original.get_message().unwrap();
        let cloned_msg = cloned.get_message().unwrap();

        // separate allocations, equal content
        assert!(!std::ptr::eq(
            original_msg as *const dyn Message as *const (),
            cloned_msg as *const dyn Message as *const ()
        ));

        let mut buf1 = BytesMut::new();
        let mut buf2 = BytesMut::new();
        original_msg.ser(&mut buf1);
        cloned_msg.ser(&mut buf2);
        assert_eq!(buf1, buf2);
    }

    #[rstest]
    #[case::data(Packet::data(vec![1]), PacketCommand(0))]
    #[case::big_data(Packet::big_data(PacketCommand(9), vec![]), PacketCommand(9))]
    fn test_command_accessor(#[case] packet: Packet, #[case] expected: PacketCommand) {
        assert_eq!(packet.command(), expected);
    }
}
