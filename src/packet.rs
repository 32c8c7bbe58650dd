//! Wire-format definitions for protocol frames.
//!
//! Every datagram exchanged between peers is a [`Frame`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (flag, sequence, checksum, payload).
//! - Computing the CRC-16 checksum that guards each frame.
//! - Serialising a [`Frame`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Frame`], returning errors
//!   for malformed or truncated input.
//!
//! No I/O happens here; this is pure data transformation.  Checksum
//! *verification* is deliberately separate from decoding: a frame with a bad
//! checksum still decodes, so the receiver can answer it with a reject.
//!
//! # Wire format
//!
//! Multi-byte integers are **little-endian**; the flag is an ASCII digit.
//!
//! ```text
//!  0               1               2               3               4
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Flag      |        Sequence Number        |           Checksum            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Payload (0..=1467 bytes) ...                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 5 bytes.

use crate::simulator::ErrorInjector;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 5;

/// Receive buffer size; also the practical datagram budget including IP/UDP.
pub const BUFFER_SIZE: usize = 1500;

/// IPv4 (20) + UDP (8) header overhead subtracted from [`BUFFER_SIZE`].
const IP_UDP_OVERHEAD: usize = 28;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD: usize = BUFFER_SIZE - HEADER_LEN - IP_UDP_OVERHEAD;

// Byte offsets of each field within the serialised header.
const OFF_FLAG: usize = 0;
const OFF_SEQ: usize = 1;
const OFF_CHECKSUM: usize = 3;

/// Frame type tag carried in the first header byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    /// Connection request, and the answer to it.
    Connect = 1,
    /// Keep-alive ping, echoed by the receiver.
    Heartbeat = 2,
    /// One payload fragment (or the file-name announcement at sequence 0).
    Data = 3,
    /// Fragment accepted.
    Accept = 4,
    /// Fragment corrupted; resend requested.
    Reject = 5,
    /// No more fragments in this transfer.
    TransferEnd = 6,
    /// Role switch request / confirmation.
    SwitchRole = 7,
    /// Session termination.
    Terminate = 8,
}

impl Flag {
    /// Parse the on-wire flag byte (`b'1'..=b'8'`).
    pub fn from_wire(byte: u8) -> Option<Self> {
        Some(match byte {
            b'1' => Flag::Connect,
            b'2' => Flag::Heartbeat,
            b'3' => Flag::Data,
            b'4' => Flag::Accept,
            b'5' => Flag::Reject,
            b'6' => Flag::TransferEnd,
            b'7' => Flag::SwitchRole,
            b'8' => Flag::Terminate,
            _ => return None,
        })
    }

    /// The on-wire representation: the ASCII digit of the flag value.
    pub fn to_wire(self) -> u8 {
        b'0' + self as u8
    }
}

impl std::fmt::Display for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Flag::Connect => "CONNECT",
            Flag::Heartbeat => "HEARTBEAT",
            Flag::Data => "DATA",
            Flag::Accept => "ACCEPT",
            Flag::Reject => "REJECT",
            Flag::TransferEnd => "END",
            Flag::SwitchRole => "SWITCH",
            Flag::Terminate => "TERMINATE",
        };
        f.write_str(name)
    }
}

/// A complete protocol datagram: header fields + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flag: Flag,
    /// Fragment number; 0 for control frames and the name announcement.
    pub sequence: u16,
    /// CRC-16/XMODEM over `flag ‖ sequence ‖ payload`, possibly corrupted
    /// on purpose by the sender.
    pub checksum: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame with a correct checksum.
    pub fn new(flag: Flag, sequence: u16, payload: Vec<u8>) -> Self {
        let checksum = checksum_of(flag, sequence, &payload);
        Self {
            flag,
            sequence,
            checksum,
            payload,
        }
    }

    /// A payload-less control frame (sequence 0).
    pub fn control(flag: Flag) -> Self {
        Self::new(flag, 0, Vec::new())
    }

    /// A data fragment.
    pub fn data(sequence: u16, payload: Vec<u8>) -> Self {
        Self::new(Flag::Data, sequence, payload)
    }

    /// The file-name announcement: a data frame at sequence 0 whose
    /// checksum covers the name.
    pub fn announce(name: &str) -> Self {
        Self::new(Flag::Data, 0, name.as_bytes().to_vec())
    }

    /// Draw from `injector` and, on a hit, bump the checksum by one so the
    /// receiver sees a mismatch.
    pub fn with_injected_error(mut self, injector: &mut ErrorInjector) -> Self {
        if injector.should_corrupt() {
            self.checksum = self.checksum.wrapping_add(1);
        }
        self
    }

    /// Recompute the checksum and compare it to the transmitted one.
    pub fn checksum_valid(&self) -> bool {
        checksum_of(self.flag, self.sequence, &self.payload) == self.checksum
    }

    /// Serialise this frame into a newly allocated byte vector.
    ///
    /// The stored `checksum` is written as-is, so a corrupted checksum
    /// survives encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];

        buf[OFF_FLAG] = self.flag.to_wire();
        buf[OFF_SEQ..OFF_SEQ + 2].copy_from_slice(&self.sequence.to_le_bytes());
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&self.checksum.to_le_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        buf
    }

    /// Parse a [`Frame`] from a raw byte slice.
    ///
    /// Returns [`Err`] if `buf` is shorter than [`HEADER_LEN`] or the flag
    /// byte is not a known [`Flag`].  The checksum is *not* verified here;
    /// see [`Frame::checksum_valid`].
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::BufferTooShort);
        }

        let flag = Flag::from_wire(buf[OFF_FLAG]).ok_or(PacketError::UnknownFlag(buf[OFF_FLAG]))?;
        let sequence = u16::from_le_bytes([buf[OFF_SEQ], buf[OFF_SEQ + 1]]);
        let checksum = u16::from_le_bytes([buf[OFF_CHECKSUM], buf[OFF_CHECKSUM + 1]]);

        Ok(Frame {
            flag,
            sequence,
            checksum,
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Errors that can arise when parsing a raw datagram.
///
/// Both variants mean the datagram is malformed and is dropped without reply.
#[derive(Debug, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer shorter than the fixed header size.
    BufferTooShort,
    /// First byte is not a recognised flag.
    UnknownFlag(u8),
}

impl std::fmt::Display for PacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketError::BufferTooShort => write!(f, "malformed frame: buffer too short for header"),
            PacketError::UnknownFlag(b) => write!(f, "malformed frame: unknown flag byte {b:#04x}"),
        }
    }
}

impl std::error::Error for PacketError {}

/// Checksum over the header's flag and sequence fields followed by `payload`.
fn checksum_of(flag: Flag, sequence: u16, payload: &[u8]) -> u16 {
    let seq = sequence.to_le_bytes();
    let header = [flag.to_wire(), seq[0], seq[1]];
    crc16_xmodem(header.iter().chain(payload))
}

/// CRC-16/XMODEM: polynomial 0x1021, initial value 0, no reflection, no
/// final XOR.
fn crc16_xmodem<'a>(data: impl IntoIterator<Item = &'a u8>) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}
