//! Defines the structure of packets on the wire.
//!
//! This module only contains the type definitions and typed constructors
//! themselves, to make it easy to understand the whole protocol at a glance.
//! The actual sending/receiving logic lives in [`crate::conn`] and
//! [`crate::transport`].

mod header;
mod seq;

pub use header::{Packet, PacketType, FLAG_COMPRESSED, HEADER_LEN, MAGIC, VERSION};
pub use seq::Seq;

use bytes::Bytes;

impl Packet {
    /// Builds a `SYN` packet opening a connection.
    #[must_use]
    pub fn syn(seq: Seq) -> Self {
        Self::control(PacketType::Syn, seq, Seq::new(0), 0)
    }

    /// Builds a `SYN_ACK` packet.
    #[must_use]
    pub fn syn_ack(seq: Seq, ack: Seq, window: u16) -> Self {
        Self::control(PacketType::SynAck, seq, ack, window)
    }

    /// Builds a pure `ACK` packet (no payload).
    #[must_use]
    pub fn ack(seq: Seq, ack: Seq, window: u16) -> Self {
        Self::control(PacketType::Ack, seq, ack, window)
    }

    /// Builds a `DATA` packet carrying `payload`.
    #[must_use]
    pub fn data(seq: Seq, ack: Seq, window: u16, payload: Bytes) -> Self {
        Self {
            payload,
            ..Self::control(PacketType::Data, seq, ack, window)
        }
    }

    /// Builds a `FIN` packet beginning a graceful close.
    #[must_use]
    pub fn fin(seq: Seq, ack: Seq) -> Self {
        Self::control(PacketType::Fin, seq, ack, 0)
    }

    /// Builds a `FIN_ACK` packet.
    #[must_use]
    pub fn fin_ack(seq: Seq, ack: Seq) -> Self {
        Self::control(PacketType::FinAck, seq, ack, 0)
    }

    /// Builds an `RST` packet aborting the connection.
    #[must_use]
    pub fn rst(seq: Seq) -> Self {
        Self::control(PacketType::Rst, seq, Seq::new(0), 0)
    }

    /// Builds a `PING` keepalive probe.
    #[must_use]
    pub fn ping(seq: Seq) -> Self {
        Self::control(PacketType::Ping, seq, Seq::new(0), 0)
    }

    /// Builds a `PONG` reply to a `PING`.
    #[must_use]
    pub fn pong(seq: Seq, ack: Seq) -> Self {
        Self::control(PacketType::Pong, seq, ack, 0)
    }

    /// Builds a `FRAGMENT` packet: one chunk of a larger message.
    #[must_use]
    pub fn fragment(
        seq: Seq,
        ack: Seq,
        window: u16,
        fragment_id: u32,
        fragment_index: u16,
        fragment_total: u16,
        payload: Bytes,
    ) -> Self {
        Self {
            ty: PacketType::Fragment,
            flags: 0,
            seq,
            ack,
            window,
            fragment_id,
            fragment_index,
            fragment_total,
            payload,
        }
    }

    /// Builds a `NACK` requesting retransmission of `seq`.
    #[must_use]
    pub fn nack(seq: Seq, missing: Seq) -> Self {
        Self::control(PacketType::Nack, seq, missing, 0)
    }

    fn control(ty: PacketType, seq: Seq, ack: Seq, window: u16) -> Self {
        Self {
            ty,
            flags: 0,
            seq,
            ack,
            window,
            fragment_id: 0,
            fragment_index: 0,
            fragment_total: 0,
            payload: Bytes::new(),
        }
    }
}
