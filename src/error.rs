//! Error types, grouped by where in the stack they surface.
//!
//! Packet- and fragment-level errors never reach a caller: they are logged and
//! the offending data is dropped. Connection- and caller-level errors are the
//! ones a user of this crate will actually see in a [`Result`].

use std::net::SocketAddr;

use thiserror::Error;

use crate::packet::Seq;

/// A malformed or corrupt packet was received.
///
/// These are never surfaced to a caller - the receive loop drops the
/// datagram and moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    /// The magic number at the start of the header did not match.
    #[error("bad magic number")]
    BadMagic,
    /// The header's version field is not one this crate understands.
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),
    /// The buffer was shorter than a full header, or shorter than the header
    /// claims the payload to be.
    #[error("truncated packet")]
    Truncated,
    /// `payload length` in the header did not match the number of payload
    /// bytes actually present.
    #[error("length mismatch: header says {declared}, buffer has {actual}")]
    LengthMismatch {
        /// Length declared in the header.
        declared: u32,
        /// Length actually present in the buffer.
        actual: u32,
    },
    /// The recomputed checksum did not match the one in the header.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// The `type` byte did not map to a known packet type.
    #[error("unknown packet type {0}")]
    UnknownType(u8),
}

/// A fragment could not be folded into an in-progress reassembly.
///
/// Like [`PacketError`], these are silent: the reassembly in question is
/// either left as-is or dropped, and no peer notification is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FragmentError {
    /// A fragment's `fragment total` did not match the total already
    /// recorded for this `(peer, fragment id)`.
    #[error("fragment total mismatch: had {expected}, got {actual}")]
    FragmentTotalMismatch {
        /// Total recorded by the first fragment seen for this message.
        expected: u16,
        /// Total carried by the fragment that was rejected.
        actual: u16,
    },
    /// A fragment's index was `>=` its claimed total.
    #[error("fragment index {index} out of range for total {total}")]
    FragmentIndexOutOfRange {
        /// Index carried by the rejected fragment.
        index: u16,
        /// Total carried by the rejected fragment.
        total: u16,
    },
    /// The reassembly this fragment belonged to was evicted for being older
    /// than the configured reassembly TTL before it could complete.
    #[error("reassembly expired")]
    ReassemblyExpired,
    /// Buffering this fragment would have exceeded the per-peer reassembly
    /// memory budget.
    #[error("reassembly out of memory: {required} bytes required, {left} left")]
    OutOfMemory {
        /// Bytes this fragment would have added to the peer's reassembly
        /// budget.
        required: usize,
        /// Bytes left in the peer's reassembly budget.
        left: usize,
    },
}

/// A connection-level failure. Surfaced to every waiter on the connection
/// (pending reliable sends, the handshake future) and drives the connection
/// to [`State::Closed`](crate::conn::State::Closed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The peer sent `RST`, or this side emitted one after exhausting
    /// retransmits.
    #[error("connection reset")]
    Reset,
    /// A reliably-sent packet was retransmitted `max_retries` times without
    /// being acknowledged.
    #[error("send timed out after exhausting retries")]
    SendTimeout,
    /// The three-way handshake did not reach `Established` before the
    /// caller's deadline.
    #[error("handshake timed out")]
    HandshakeTimeout,
}

/// An error returned directly to the caller from the public send API.
#[derive(Debug, Error)]
pub enum SendError {
    /// The message is larger than this transport can ever fragment, encode,
    /// or track (more than 65535 fragments).
    #[error("payload too large: {len} bytes would need {frags} fragments")]
    PayloadTooLarge {
        /// Length of the rejected payload, in bytes.
        len: usize,
        /// Number of fragments the payload would have required.
        frags: usize,
    },
    /// The transport has been shut down; no further sends are possible.
    #[error("transport closed")]
    TransportClosed,
    /// The destination address could not be used (e.g. failed to resolve).
    #[error("invalid peer address: {0}")]
    InvalidPeer(SocketAddr),
    /// The connection to the peer failed while the send was outstanding.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    /// The underlying socket returned an I/O error.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of validating an inbound packet's sequence number against a
/// connection's receive state, used internally to decide whether to buffer,
/// deliver, or drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SeqAdmission {
    /// In order; deliverable immediately.
    InOrder,
    /// Ahead of `recv_seq`, but within the reorder buffer bound.
    Buffered,
    /// Already seen; ack again but do not re-deliver.
    Duplicate,
    /// Too far ahead of `recv_seq` to buffer.
    TooFarAhead,
}

impl SeqAdmission {
    pub(crate) fn classify(incoming: Seq, recv_seq: Seq, reorder_capacity: u32) -> Self {
        let distance = incoming.distance_from(recv_seq);
        if distance == 0 {
            Self::InOrder
        } else if distance < 0 {
            Self::Duplicate
        } else if (distance as u32) < reorder_capacity {
            Self::Buffered
        } else {
            Self::TooFarAhead
        }
    }
}
