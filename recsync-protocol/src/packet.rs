//! Recorder Wire Packet
//!
//! This module implements the frame codec for the recorder sync protocol.
//! Frames are length-delimited binary messages with a fixed 6-byte header.
//!
//! ## Frame Structure
//!
//! ```text
//! [magic:1][sequence:1][channel:1][command:1][length:2 LE][payload:length bytes]
//! ```
//!
//! - `magic`: always [`MAGIC`], used to resynchronize a corrupted stream
//! - `sequence`: sender-chosen counter, echoed by acknowledgments
//! - `channel`: [`channel::CONTROL`] or [`channel::FILE_TRANSFER`]
//! - `command`: command code, see [`command`]
//! - `length`: little-endian payload length
//!
//! There is no checksum. Only the magic byte and the declared length are
//! trusted, so a corrupted payload cannot be detected here.

use std::fmt;

/// First byte of every frame
pub const MAGIC: u8 = 0xAB;

/// Size of the fixed frame header in bytes
pub const HEADER_LEN: usize = 6;

/// Largest payload a single frame can carry
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Logical channel identifiers
pub mod channel {
    /// Device status queries and replies
    pub const CONTROL: u8 = 0x01;
    /// Directory listing and file content
    pub const FILE_TRANSFER: u8 = 0x02;
}

/// Command codes
///
/// Requests are sent by the host, replies by the recorder.
pub mod command {
    // CONTROL channel
    pub const GET_BATTERY: u8 = 0x01;
    pub const GET_CAPACITY: u8 = 0x02;
    pub const GET_VERSION: u8 = 0x03;
    pub const BATTERY_REPLY: u8 = 0x81;
    pub const CAPACITY_REPLY: u8 = 0x82;
    pub const VERSION_REPLY: u8 = 0x83;

    // FILE_TRANSFER channel: directory listing
    pub const LIST_REQUEST: u8 = 0x10;
    pub const LIST_REPLY: u8 = 0x90;
    pub const LIST_COMPLETE: u8 = 0x91;

    // FILE_TRANSFER channel: file import
    pub const IMPORT_REQUEST: u8 = 0x20;
    pub const IMPORT_STARTED: u8 = 0xA0;
    pub const FILE_DATA: u8 = 0xA1;
    pub const IMPORT_COMPLETE: u8 = 0xA2;
}

/// One decoded frame
///
/// Immutable once decoded; `payload.len()` always equals the length field
/// read from the frame header.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    sequence: u8,
    channel: u8,
    command: u8,
    payload: Vec<u8>,
}

impl Packet {
    /// Create a packet. Payloads longer than [`MAX_PAYLOAD_LEN`] are truncated.
    pub fn new(sequence: u8, channel: u8, command: u8, payload: impl Into<Vec<u8>>) -> Self {
        let mut payload = payload.into();
        payload.truncate(MAX_PAYLOAD_LEN);
        Self {
            sequence,
            channel,
            command,
            payload,
        }
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the packet, keeping only its payload
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Check if the packet belongs to the file transfer channel
    pub fn is_file_transfer(&self) -> bool {
        self.channel == channel::FILE_TRANSFER
    }

    /// Serialize to a wire frame
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self.sequence, self.channel, self.command, &self.payload)
    }

    /// Build the acknowledgment for this packet: same header, empty payload
    pub fn acknowledgment(&self) -> Vec<u8> {
        encode(self.sequence, self.channel, self.command, &[])
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("sequence", &self.sequence)
            .field("channel", &format_args!("{:#04x}", self.channel))
            .field("command", &format_args!("{:#04x}", self.command))
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Outcome of [`try_decode`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame; drop `consumed` bytes from the front of the buffer
    Packet { packet: Packet, consumed: usize },

    /// The frame is not complete yet; leave the buffer unchanged
    Incomplete,

    /// The buffer does not start with [`MAGIC`]
    ///
    /// `resync_at` is the offset of the next magic byte, or `None` when the
    /// whole buffer should be discarded.
    Desynced { resync_at: Option<usize> },
}

/// Encode a frame
///
/// Callers keep payloads within [`MAX_PAYLOAD_LEN`]; longer payloads are
/// truncated so the length field never lies.
///
/// # Examples
///
/// ```
/// use recsync_protocol::packet::{channel, command, encode, MAGIC};
///
/// let frame = encode(7, channel::CONTROL, command::GET_BATTERY, &[]);
/// assert_eq!(frame, vec![MAGIC, 7, 0x01, 0x01, 0x00, 0x00]);
/// ```
pub fn encode(sequence: u8, channel: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let payload = &payload[..payload.len().min(MAX_PAYLOAD_LEN)];
    let len = payload.len() as u16;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(MAGIC);
    frame.push(sequence);
    frame.push(channel);
    frame.push(command);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Try to decode one frame from the front of `buffer`
///
/// Performs no I/O and never mutates the buffer; the caller owns slicing.
///
/// # Examples
///
/// ```
/// use recsync_protocol::packet::{encode, try_decode, Decoded};
///
/// let frame = encode(1, 0x02, 0xA1, b"abc");
/// match try_decode(&frame) {
///     Decoded::Packet { packet, consumed } => {
///         assert_eq!(packet.payload(), b"abc");
///         assert_eq!(consumed, frame.len());
///     }
///     other => panic!("unexpected {:?}", other),
/// }
///
/// assert_eq!(try_decode(&frame[..4]), Decoded::Incomplete);
/// ```
pub fn try_decode(buffer: &[u8]) -> Decoded {
    let Some(&first) = buffer.first() else {
        return Decoded::Incomplete;
    };

    if first != MAGIC {
        let resync_at = buffer
            .iter()
            .skip(1)
            .position(|&b| b == MAGIC)
            .map(|pos| pos + 1);
        return Decoded::Desynced { resync_at };
    }

    if buffer.len() < HEADER_LEN {
        return Decoded::Incomplete;
    }

    let len = u16::from_le_bytes([buffer[4], buffer[5]]) as usize;
    let total = HEADER_LEN + len;
    if buffer.len() < total {
        return Decoded::Incomplete;
    }

    let packet = Packet {
        sequence: buffer[1],
        channel: buffer[2],
        command: buffer[3],
        payload: buffer[HEADER_LEN..total].to_vec(),
    };

    Decoded::Packet {
        packet,
        consumed: total,
    }
}
