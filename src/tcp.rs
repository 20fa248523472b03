//! TCP framing variant.
//!
//! Shares [`Packet`]'s wire format and codec but not [`crate::conn::Connection`]'s
//! state machine: TCP already provides ordering and retransmission, so this
//! layer only needs to find packet boundaries inside the byte stream. Each
//! frame is a 4-byte big-endian length prefix followed by that many bytes of
//! [`Packet::encode`] output. Intended for large, latency-tolerant transfers
//! where a caller already has (or wants) a `TcpStream` instead of a UDP
//! socket.

use std::io::{self, Read, Write};

use bytes::Bytes;

use crate::error::PacketError;
use crate::packet::Packet;

/// Maximum frame length accepted by [`read_frame`], guarding against a
/// corrupt or malicious length prefix causing an unbounded allocation.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Writes `packet` to `writer` as one length-prefixed frame.
///
/// # Errors
///
/// Propagates any [`io::Error`] from `writer`.
pub fn write_frame<W: Write>(writer: &mut W, packet: &Packet) -> io::Result<()> {
    let encoded = packet.encode();
    let len = u32::try_from(encoded.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "packet too large to frame"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&encoded)?;
    Ok(())
}

/// Reads one length-prefixed frame from `reader` and decodes it.
///
/// Returns `Ok(None)` if `reader` reached end-of-stream before any bytes of
/// a new frame were read (a clean stream close); any other truncation is an
/// error.
///
/// # Errors
///
/// Returns an [`io::Error`] if the stream fails or the length prefix exceeds
/// [`MAX_FRAME_LEN`], or wraps a [`PacketError`] if the framed bytes do not
/// decode as a valid packet.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Packet>> {
    let mut len_bytes = [0u8; 4];
    if !read_exact_or_eof(reader, &mut len_bytes)? {
        return Ok(None);
    }
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds {MAX_FRAME_LEN}"),
        ));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    let packet = Packet::decode(Bytes::from(body))
        .map_err(|err: PacketError| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(Some(packet))
}

/// Like [`Read::read_exact`], but returns `Ok(false)` instead of erroring if
/// zero bytes were available before the stream ended.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed mid-frame",
                ))
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Seq;

    #[test]
    fn round_trips_a_single_frame() {
        let packet = Packet::data(Seq::new(1), Seq::new(0), 65535, Bytes::from_static(b"hi"));
        let mut buf = Vec::new();
        write_frame(&mut buf, &packet).unwrap();

        let mut cursor = io::Cursor::new(buf);
        let decoded = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(packet, decoded);
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn round_trips_multiple_frames_back_to_back() {
        let a = Packet::ping(Seq::new(1));
        let b = Packet::pong(Seq::new(2), Seq::new(1));
        let mut buf = Vec::new();
        write_frame(&mut buf, &a).unwrap();
        write_frame(&mut buf, &b).unwrap();

        let mut cursor = io::Cursor::new(buf);
        assert_eq!(a, read_frame(&mut cursor).unwrap().unwrap());
        assert_eq!(b, read_frame(&mut cursor).unwrap().unwrap());
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        let mut cursor = io::Cursor::new(buf);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(io::ErrorKind::InvalidData, err.kind());
    }

    #[test]
    fn truncated_body_is_an_error_not_eof() {
        let packet = Packet::ping(Seq::new(1));
        let mut buf = Vec::new();
        write_frame(&mut buf, &packet).unwrap();
        buf.truncate(buf.len() - 1);

        let mut cursor = io::Cursor::new(buf);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(io::ErrorKind::UnexpectedEof, err.kind());
    }
}
