//! Smart Device wire protocol.
//!
//! A Smart Device frame is `| type: u8 | payload_len: u8 | payload | checksum: u8 |`
//! where the checksum is the XOR of all preceding bytes. The whole frame is
//! byte-stuffed ([`cobs`]) so that `0x00` never appears on the wire, and a
//! single `0x00` delimiter terminates each encoded frame.
//!
//! [`Message`] owns one frame and exposes typed accessors over the payload
//! formats of the ten message types. Parameter values inside `DEV_WRITE`,
//! `DEV_DATA` and friends are scattered/gathered through a [`ParameterMap`],
//! which resolves a parameter index to a fixed-width byte slot (a field of a
//! shared-memory block, or a plain buffer in tests and tools).

pub mod cobs;
mod message;
mod uid;

pub use message::{ErrorCode, Message, MessageType, ParameterMap};
pub use uid::DeviceUid;

use thiserror::Error;

/// Devices expose at most this many parameters; bitmaps are a single `u16`.
pub const MAX_PARAMS: usize = 16;

/// Maximum payload bytes in a single frame.
pub const MAX_PAYLOAD_SIZE: usize = 253;

/// Maximum size of an unencoded frame: type, length, payload, checksum.
pub const MAX_FRAME_SIZE: usize = MAX_PAYLOAD_SIZE + 3;

/// Maximum size of a byte-stuffed frame, excluding the trailing delimiter.
pub const MAX_ENCODED_SIZE: usize = MAX_FRAME_SIZE + MAX_FRAME_SIZE / 254 + 1;

/// Terminates every encoded frame on the wire.
pub const DELIMITER: u8 = 0x00;

/// Ways a frame can fail to decode or a payload can fail to build.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("invalid byte stuffing")]
    InvalidEncoding,
    #[error("bad checksum: expected {expected:#04x}, computed {computed:#04x}")]
    BadChecksum { expected: u8, computed: u8 },
    #[error("unknown message type {type_id:#04x}")]
    UnknownType { type_id: u8 },
    #[error("payload length mismatch: declared {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("payload would exceed {} bytes", MAX_PAYLOAD_SIZE)]
    PayloadOverflow,
    #[error("destination buffer too small")]
    BufferTooSmall,
}

/// Iterate the set bit positions of a parameter bitmap, LSB to MSB.
pub fn bits(bitmap: u16) -> impl Iterator<Item = usize> {
    (0..MAX_PARAMS).filter(move |i| bitmap >> i & 1 == 1)
}
