//! Counters exposed to callers for observability.

use std::time::Duration;

use crate::conn::State;

/// Transport-wide counters, aggregated across every connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Total packets transmitted, including retransmissions.
    pub packets_sent: u64,
    /// Total packets accepted by the decoder (not dropped at the packet
    /// layer).
    pub packets_received: u64,
    /// Total payload bytes transmitted.
    pub bytes_sent: u64,
    /// Total payload bytes received.
    pub bytes_received: u64,
    /// Total retransmissions across all connections.
    pub retransmissions: u64,
    /// Total RTO-driven timeouts across all connections.
    pub timeouts: u64,
}

/// Per-connection snapshot, taken at the moment
/// [`Transport::connection_stats`](crate::transport::Transport::connection_stats)
/// is called.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionStats {
    /// Current state of the connection's state machine.
    pub state: State,
    /// Packets sent on this connection, including retransmissions.
    pub packets_sent: u64,
    /// Packets received on this connection.
    pub packets_received: u64,
    /// Payload bytes sent on this connection.
    pub bytes_sent: u64,
    /// Payload bytes received on this connection.
    pub bytes_received: u64,
    /// Retransmissions on this connection.
    pub retransmissions: u64,
    /// RTO-driven timeouts on this connection.
    pub timeouts: u64,
    /// Current smoothed RTT estimate, if any sample has been taken yet.
    pub srtt: Option<Duration>,
    /// Current congestion window, in bytes.
    pub cwnd: u32,
    /// Bytes currently outstanding (sent but not yet acknowledged).
    pub bytes_in_flight: u32,
}
