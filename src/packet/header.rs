//! Wire format: a fixed 33-byte header followed by an opaque payload.
//!
//! ```text
//! byte   0-1    magic
//! byte   2      version
//! byte   3      type
//! byte   4      flags
//! byte   5-8    sequence
//! byte   9-12   ack
//! byte   13-14  window
//! byte   15-16  checksum
//! byte   17-20  payload length
//! byte   21-24  fragment id
//! byte   25-26  fragment index
//! byte   27-28  fragment total
//! byte   29-32  reserved
//! byte   33-    payload ...
//! ```
//!
//! All multi-byte fields are big-endian. The checksum is computed over the
//! header with the checksum field itself zeroed, concatenated with the
//! payload - see [`checksum_of`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::PacketError;
use crate::packet::Seq;

/// Magic number identifying a swarmlink packet.
pub const MAGIC: u16 = 0xBEEF;

/// Wire protocol version implemented by this crate.
pub const VERSION: u8 = 1;

/// Size of [`Header`] on the wire, in bytes.
pub const HEADER_LEN: usize = 33;

/// Bit in [`Header::flags`] marking the payload as compressed.
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Identifies the semantic meaning of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum PacketType {
    /// Opens a connection.
    Syn,
    /// Acknowledges a `Syn`, completing half of the handshake.
    SynAck,
    /// Carries no payload; acknowledges received sequence numbers.
    Ack,
    /// Carries an application payload on an established connection.
    Data,
    /// Begins a graceful close.
    Fin,
    /// Acknowledges a `Fin`.
    FinAck,
    /// Aborts a connection immediately.
    Rst,
    /// Keepalive probe.
    Ping,
    /// Reply to a `Ping`.
    Pong,
    /// One chunk of a fragmented message.
    Fragment,
    /// Acknowledges receipt of a specific fragment.
    FragmentAck,
    /// Negative acknowledgment, requesting retransmission.
    Nack,
}

impl PacketType {
    const fn to_byte(self) -> u8 {
        match self {
            Self::Syn => 0,
            Self::SynAck => 1,
            Self::Ack => 2,
            Self::Data => 3,
            Self::Fin => 4,
            Self::FinAck => 5,
            Self::Rst => 6,
            Self::Ping => 7,
            Self::Pong => 8,
            Self::Fragment => 9,
            Self::FragmentAck => 10,
            Self::Nack => 11,
        }
    }

    const fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Self::Syn,
            1 => Self::SynAck,
            2 => Self::Ack,
            3 => Self::Data,
            4 => Self::Fin,
            5 => Self::FinAck,
            6 => Self::Rst,
            7 => Self::Ping,
            8 => Self::Pong,
            9 => Self::Fragment,
            10 => Self::FragmentAck,
            11 => Self::Nack,
            _ => return None,
        })
    }
}

/// A fully-decoded packet: fixed header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet type.
    pub ty: PacketType,
    /// Flag bits; see `FLAG_*` constants.
    pub flags: u8,
    /// Sequence number of this packet.
    pub seq: Seq,
    /// Cumulative acknowledgment: all sequence numbers before this have
    /// been received by the sender of this packet.
    pub ack: Seq,
    /// Sender's advertised free receive-buffer space, in bytes (saturated to
    /// `u16::MAX`).
    pub window: u16,
    /// Fragment id this packet belongs to; `0` for non-fragmented packets.
    pub fragment_id: u32,
    /// Index of this fragment within its message.
    pub fragment_index: u16,
    /// Total number of fragments in this message; `0` or `1` for a
    /// non-fragmented packet.
    pub fragment_total: u16,
    /// Application payload.
    pub payload: Bytes,
}

impl Packet {
    /// Returns `true` if this is a fragment of a larger message.
    #[must_use]
    pub fn is_fragment(&self) -> bool {
        self.fragment_total > 1
    }

    /// Encodes this packet to its wire representation.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());

        buf.put_u16(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(self.ty.to_byte());
        buf.put_u8(self.flags);
        buf.put_u32(self.seq.get());
        buf.put_u32(self.ack.get());
        buf.put_u16(self.window);
        buf.put_u16(0); // checksum placeholder
        buf.put_u32(u32::try_from(self.payload.len()).unwrap_or(u32::MAX));
        buf.put_u32(self.fragment_id);
        buf.put_u16(self.fragment_index);
        buf.put_u16(self.fragment_total);
        buf.put_u32(0); // reserved
        buf.put_slice(&self.payload);

        let checksum = checksum_of(&buf);
        buf[15..17].copy_from_slice(&checksum.to_be_bytes());

        buf.freeze()
    }

    /// Decodes a packet from its wire representation.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError`] if the buffer is too short, the magic number
    /// or version do not match, the checksum is wrong, the declared payload
    /// length does not match the buffer, or the type byte is unrecognized.
    pub fn decode(mut buf: Bytes) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::Truncated);
        }

        let expected_checksum = checksum_of(&with_checksum_zeroed(&buf));

        let magic = buf.get_u16();
        if magic != MAGIC {
            return Err(PacketError::BadMagic);
        }
        let version = buf.get_u8();
        if version != VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }
        let ty_byte = buf.get_u8();
        let ty = PacketType::from_byte(ty_byte).ok_or(PacketError::UnknownType(ty_byte))?;
        let flags = buf.get_u8();
        let seq = Seq::new(buf.get_u32());
        let ack = Seq::new(buf.get_u32());
        let window = buf.get_u16();
        let checksum = buf.get_u16();
        if checksum != expected_checksum {
            return Err(PacketError::ChecksumMismatch);
        }
        let payload_len = buf.get_u32();
        let fragment_id = buf.get_u32();
        let fragment_index = buf.get_u16();
        let fragment_total = buf.get_u16();
        let _reserved = buf.get_u32();

        let actual_len = u32::try_from(buf.len()).unwrap_or(u32::MAX);
        if actual_len != payload_len {
            return Err(PacketError::LengthMismatch {
                declared: payload_len,
                actual: actual_len,
            });
        }

        Ok(Self {
            ty,
            flags,
            seq,
            ack,
            window,
            fragment_id,
            fragment_index,
            fragment_total,
            payload: buf,
        })
    }
}

/// Returns a copy of `buf` with the checksum field (bytes 15..17) zeroed,
/// for recomputing the checksum on decode.
fn with_checksum_zeroed(buf: &Bytes) -> Bytes {
    let mut copy = BytesMut::from(&buf[..]);
    copy[15..17].copy_from_slice(&[0, 0]);
    copy.freeze()
}

/// Computes the low 16 bits of the CRC32 of `data`.
fn checksum_of(data: &[u8]) -> u16 {
    (crc32fast::hash(data) & 0xFFFF) as u16
}
