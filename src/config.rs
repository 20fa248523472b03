//! Transport configuration.

use std::time::Duration;

/// Tunable parameters for a [`Transport`](crate::transport::Transport).
///
/// `TransportConfig::default()` is a reasonable starting point for most
/// applications; every field is `pub` and freely overridable.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Maximum datagram payload size, in bytes, before fragmentation kicks
    /// in. Also used to derive the congestion controller's MSS
    /// (`mtu - HEADER_LEN`).
    pub mtu: usize,
    /// Initial flow-control window, in bytes, before any `ACK` has
    /// advertised a receiver window.
    pub initial_window: u32,
    /// Floor on the retransmission timeout.
    pub min_rto: Duration,
    /// Ceiling on the retransmission timeout.
    pub max_rto: Duration,
    /// Number of retransmissions attempted before a reliable send fails and
    /// the connection is reset.
    pub max_retries: u32,
    /// How often an idle `Established` connection sends a keepalive `PING`.
    pub ping_interval: Duration,
    /// How long a connection may go without any activity before it is torn
    /// down with [`ConnectionError::Reset`](crate::error::ConnectionError::Reset).
    pub connection_timeout: Duration,
    /// How long a partially-reassembled fragmented message is kept before
    /// being evicted.
    pub reassembly_ttl: Duration,
    /// Cadence of the maintenance tick (retransmissions, timeouts,
    /// reassembly eviction).
    pub maintenance_interval: Duration,
    /// Maximum bytes of in-progress fragment reassembly buffered per peer.
    pub max_reassembly_bytes_per_peer: usize,
    /// Maximum sequence-number lead a received packet may have over
    /// `recv_seq` before it is dropped instead of buffered out-of-order.
    pub reorder_buffer_capacity: u32,
    /// How long a closed connection lingers in `TimeWait` before its state
    /// is finally dropped (2*MSL).
    pub time_wait_duration: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mtu: 1400,
            initial_window: 65535,
            min_rto: Duration::from_secs(1),
            max_rto: Duration::from_secs(60),
            max_retries: 5,
            ping_interval: Duration::from_secs(15),
            connection_timeout: Duration::from_secs(60),
            reassembly_ttl: Duration::from_secs(30),
            maintenance_interval: Duration::from_millis(100),
            max_reassembly_bytes_per_peer: 16 * 1024 * 1024,
            reorder_buffer_capacity: 4096,
            time_wait_duration: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    /// Maximum segment size usable for one packet's payload: `mtu -
    /// HEADER_LEN`.
    #[must_use]
    pub fn mss(&self) -> usize {
        self.mtu.saturating_sub(crate::packet::HEADER_LEN)
    }
}
