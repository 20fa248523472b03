//! Splitting oversize messages into fragments, and reassembling fragments
//! received out of order back into messages.
//!
//! Unlike a scheme where the last fragment alone announces the total count,
//! every fragment here carries `fragment_total` up front (see
//! [`crate::packet::Packet`]), so reassembly never needs to guess how large
//! the final message will be.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use ahash::HashMap;
use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::FragmentError;

/// One fragment ready to be sent as a packet payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Id shared by every fragment of this message.
    pub fragment_id: u32,
    /// This fragment's position within the message.
    pub index: u16,
    /// Total number of fragments in the message.
    pub total: u16,
    /// This fragment's payload bytes.
    pub payload: Bytes,
}

/// Splits `message` into fragments no larger than `max_fragment_len` bytes.
///
/// If the message already fits in one fragment, a single-element iterator is
/// returned with `total == 1`; callers should treat such a message as
/// non-fragmented (`Packet::fragment_total <= 1`) and send it as a plain
/// `DATA` packet rather than a `FRAGMENT` packet.
///
/// # Errors
///
/// Returns [`crate::error::SendError::PayloadTooLarge`]-shaped information
/// (as a plain `Err(usize)` of the fragment count that would have been
/// needed) if the message would need more than [`u16::MAX`] fragments.
///
/// # Panics
///
/// Panics if `max_fragment_len == 0`.
pub fn split(
    max_fragment_len: usize,
    fragment_id: u32,
    message: Bytes,
) -> Result<Vec<Fragment>, usize> {
    assert!(max_fragment_len > 0, "max_fragment_len must be nonzero");

    if message.is_empty() {
        return Ok(vec![Fragment {
            fragment_id,
            index: 0,
            total: 1,
            payload: message,
        }]);
    }

    let num_fragments = message.len().div_ceil(max_fragment_len);
    let total = u16::try_from(num_fragments).map_err(|_| num_fragments)?;

    let mut fragments = Vec::with_capacity(num_fragments);
    for (index, chunk_start) in (0..message.len()).step_by(max_fragment_len).enumerate() {
        let chunk_end = (chunk_start + max_fragment_len).min(message.len());
        fragments.push(Fragment {
            fragment_id,
            index: u16::try_from(index).expect("bounded by `total` above"),
            total,
            payload: message.slice(chunk_start..chunk_end),
        });
    }
    Ok(fragments)
}

/// Tracks in-progress reassemblies for every peer.
#[derive(Debug, Default)]
pub struct Reassembler {
    /// Per-peer in-progress reassemblies, keyed by fragment id.
    by_peer: HashMap<SocketAddr, HashMap<u32, Reassembly>>,
    /// Per-peer total bytes currently buffered across all reassemblies.
    mem_used: HashMap<SocketAddr, usize>,
}

#[derive(Debug)]
struct Reassembly {
    total: u16,
    received: Vec<Option<Bytes>>,
    num_received: u16,
    created_at: Instant,
}

impl Reassembler {
    /// Creates an empty reassembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one received fragment into the reassembler.
    ///
    /// Returns `Ok(Some(message))` once every fragment of the message has
    /// arrived, `Ok(None)` while reassembly is still in progress, or `Err`
    /// if the fragment is invalid or would exceed `mem_limit` bytes of
    /// buffering for this peer.
    ///
    /// # Errors
    ///
    /// See [`FragmentError`].
    pub fn receive(
        &mut self,
        peer: SocketAddr,
        fragment: Fragment,
        now: Instant,
        mem_limit: usize,
    ) -> Result<Option<Bytes>, FragmentError> {
        if fragment.index >= fragment.total {
            return Err(FragmentError::FragmentIndexOutOfRange {
                index: fragment.index,
                total: fragment.total,
            });
        }

        let used = self.mem_used.entry(peer).or_insert(0);
        let slots = self.by_peer.entry(peer).or_default();

        let reassembly = slots.entry(fragment.fragment_id).or_insert_with(|| {
            trace!(peer = %peer, fragment_id = fragment.fragment_id, total = fragment.total, "starting reassembly");
            Reassembly {
                total: fragment.total,
                received: vec![None; usize::from(fragment.total)],
                num_received: 0,
                created_at: now,
            }
        });

        if reassembly.total != fragment.total {
            return Err(FragmentError::FragmentTotalMismatch {
                expected: reassembly.total,
                actual: fragment.total,
            });
        }

        let slot = &mut reassembly.received[usize::from(fragment.index)];
        if slot.is_some() {
            // duplicate fragment; harmless, nothing new to buffer
            return Ok(None);
        }

        let required = fragment.payload.len();
        if *used + required > mem_limit {
            return Err(FragmentError::OutOfMemory {
                required,
                left: mem_limit.saturating_sub(*used),
            });
        }

        *slot = Some(fragment.payload);
        *used += required;
        reassembly.num_received += 1;

        if reassembly.num_received == reassembly.total {
            let reassembly = slots
                .remove(&fragment.fragment_id)
                .expect("just matched this key above");
            *used -= reassembly.received.iter().flatten().map(Bytes::len).sum::<usize>();

            let mut message = Vec::new();
            for piece in reassembly.received {
                message.extend_from_slice(&piece.expect("all slots filled: num_received == total"));
            }
            trace!(peer = %peer, fragment_id = fragment.fragment_id, len = message.len(), "reassembly complete");
            Ok(Some(Bytes::from(message)))
        } else {
            Ok(None)
        }
    }

    /// Evicts reassemblies older than `ttl`, reclaiming their memory.
    ///
    /// Returns the number of reassemblies evicted, for logging/metrics.
    pub fn evict_expired(&mut self, now: Instant, ttl: Duration) -> usize {
        let mut evicted = 0;
        for (&peer, slots) in &mut self.by_peer {
            let used = self.mem_used.entry(peer).or_insert(0);
            slots.retain(|&fragment_id, reassembly| {
                let expired = now.duration_since(reassembly.created_at) > ttl;
                if expired {
                    *used -= reassembly.received.iter().flatten().map(Bytes::len).sum::<usize>();
                    debug!(peer = %peer, fragment_id, "reassembly expired");
                    evicted += 1;
                }
                !expired
            });
        }
        evicted
    }

    /// Drops all in-progress reassemblies for `peer`, e.g. on disconnect.
    pub fn forget_peer(&mut self, peer: SocketAddr) {
        self.by_peer.remove(&peer);
        self.mem_used.remove(&peer);
    }

    /// Bytes currently buffered across all in-progress reassemblies for
    /// `peer`.
    #[must_use]
    pub fn mem_used(&self, peer: SocketAddr) -> usize {
        self.mem_used.get(&peer).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_fragment_message_is_not_fragmented() {
        let fragments = split(8, 1, Bytes::from_static(b"short")).unwrap();
        assert_eq!(1, fragments.len());
        assert_eq!(1, fragments[0].total);
    }

    #[test]
    fn round_trip_in_order() {
        let message = Bytes::from_static(b"hello world! goodbye woorld!");
        let fragments = split(8, 42, message.clone()).unwrap();
        assert_eq!(4, fragments.len());

        let mut reassembler = Reassembler::new();
        let now = Instant::now();
        let mut result = None;
        for fragment in fragments {
            result = reassembler
                .receive(addr(), fragment, now, 1024)
                .unwrap();
        }
        assert_eq!(Some(message), result);
    }

    #[test]
    fn round_trip_out_of_order() {
        let message = Bytes::from_static(b"the quick brown fox jumps over");
        let mut fragments = split(8, 7, message.clone()).unwrap();
        // reverse delivery order
        fragments.reverse();

        let mut reassembler = Reassembler::new();
        let now = Instant::now();
        let mut result = None;
        for fragment in fragments {
            result = reassembler
                .receive(addr(), fragment, now, 1024)
                .unwrap();
        }
        assert_eq!(Some(message), result);
    }

    #[test]
    fn mismatched_total_is_rejected() {
        let mut reassembler = Reassembler::new();
        let now = Instant::now();
        reassembler
            .receive(
                addr(),
                Fragment {
                    fragment_id: 1,
                    index: 0,
                    total: 3,
                    payload: Bytes::from_static(b"a"),
                },
                now,
                1024,
            )
            .unwrap();

        let err = reassembler
            .receive(
                addr(),
                Fragment {
                    fragment_id: 1,
                    index: 1,
                    total: 4,
                    payload: Bytes::from_static(b"b"),
                },
                now,
                1024,
            )
            .unwrap_err();
        assert_eq!(
            FragmentError::FragmentTotalMismatch {
                expected: 3,
                actual: 4
            },
            err
        );
    }

    #[test]
    fn expired_reassembly_is_evicted() {
        let mut reassembler = Reassembler::new();
        let t0 = Instant::now();
        reassembler
            .receive(
                addr(),
                Fragment {
                    fragment_id: 9,
                    index: 0,
                    total: 2,
                    payload: Bytes::from_static(b"a"),
                },
                t0,
                1024,
            )
            .unwrap();

        let evicted = reassembler.evict_expired(t0 + Duration::from_secs(31), Duration::from_secs(30));
        assert_eq!(1, evicted);
        assert_eq!(0, reassembler.mem_used(addr()));
    }

    #[test]
    fn out_of_memory_is_reported() {
        let mut reassembler = Reassembler::new();
        let now = Instant::now();
        let err = reassembler
            .receive(
                addr(),
                Fragment {
                    fragment_id: 1,
                    index: 0,
                    total: 2,
                    payload: Bytes::from_static(b"0123456789"),
                },
                now,
                4,
            )
            .unwrap_err();
        assert_eq!(
            FragmentError::OutOfMemory {
                required: 10,
                left: 4
            },
            err
        );
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }
}
