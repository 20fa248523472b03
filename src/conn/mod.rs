//! Per-peer connection state machine: the ten-state handshake/close
//! lifecycle, sequencing, retransmission, and RTT estimation.
//!
//! A [`Connection`] is sans-IO: it never touches a socket. It consumes
//! decoded [`Packet`]s and a monotonic `now`, and produces packets that the
//! caller ([`crate::transport::Transport`]) is responsible for actually
//! sending. This mirrors the split between protocol logic and I/O that the
//! rest of this crate uses throughout.

pub mod rtt;

use std::time::{Duration, Instant};

use ahash::HashMap;
use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::config::TransportConfig;
use crate::error::{ConnectionError, SeqAdmission};
use crate::flow::{DuplicateAckAction, FlowController};
use crate::packet::{Packet, PacketType, Seq};
use rtt::RttEstimator;

/// State of a connection's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// No connection exists.
    Closed,
    /// Passively waiting for a `SYN`.
    Listen,
    /// Actively sent a `SYN`, awaiting `SYN_ACK`.
    SynSent,
    /// Received a `SYN`, sent `SYN_ACK`, awaiting `ACK`.
    SynRcvd,
    /// Handshake complete; data may flow in both directions.
    Established,
    /// Sent `FIN`, awaiting its acknowledgment.
    FinWait1,
    /// Our `FIN` was acknowledged; awaiting the peer's `FIN`.
    FinWait2,
    /// Received the peer's `FIN`; the application has not yet closed its
    /// side.
    CloseWait,
    /// Sent our own `FIN` in response to the peer's; awaiting the final
    /// `ACK`.
    LastAck,
    /// Both sides have exchanged `FIN`s; lingering to absorb any
    /// retransmitted final segments before fully closing.
    TimeWait,
}

#[derive(Debug, Clone)]
struct Unacked {
    packet: Packet,
    first_sent: Instant,
    last_sent: Instant,
    retries: u32,
}

/// A packet queued for transmission once the flow/congestion controller
/// admits it.
#[derive(Debug, Clone)]
struct Queued {
    ty: PacketType,
    fragment_id: u32,
    fragment_index: u16,
    fragment_total: u16,
    payload: Bytes,
    /// Set on the final fragment (or sole packet) of a `queue_reliable` call,
    /// so [`Connection::flush`] can report which sequence number a caller
    /// should watch for completion.
    last_of_message: bool,
}

/// One fully-processed inbound packet's effects: replies to send and
/// application data ready for delivery (still possibly fragments, which the
/// transport hands to its [`crate::frag::Reassembler`]).
#[derive(Debug, Default)]
pub(crate) struct InboundOutcome {
    pub responses: Vec<Packet>,
    pub deliverable: Vec<Packet>,
    pub error: Option<ConnectionError>,
    pub established: bool,
}

/// Effects of a maintenance tick: packets to send and, if the connection
/// died, the reason.
#[derive(Debug, Default)]
pub(crate) struct TickOutcome {
    pub to_send: Vec<Packet>,
    pub error: Option<ConnectionError>,
}

/// Per-peer connection: sequencing, acknowledgment, retransmission, and the
/// handshake/close state machine.
#[derive(Debug)]
pub struct Connection {
    state: State,
    send_seq: Seq,
    recv_seq: Seq,
    unacked: HashMap<Seq, Unacked>,
    recv_buffer: HashMap<Seq, Packet>,
    send_queue: std::collections::VecDeque<Queued>,
    rtt: RttEstimator,
    rto: Duration,
    last_activity: Instant,
    flow: FlowController,
    next_fragment_id: u32,
    reorder_buffer_capacity: u32,
    max_retries: u32,
    mss: u32,
    recv_window_cap: u32,
    packets_sent: u64,
    packets_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
    retransmissions: u64,
    timeouts: u64,
}

impl Connection {
    /// Creates a connection that actively opens with `SYN`, returning it
    /// alongside the `SYN` packet to send.
    #[must_use]
    pub(crate) fn connect(config: &TransportConfig, now: Instant, initial_seq: Seq) -> (Self, Packet) {
        let mut conn = Self::new(config, now, initial_seq);
        let syn = Packet::syn(conn.send_seq);
        conn.send_seq += 1;
        conn.track_unacked(syn.clone(), now);
        conn.state = State::SynSent;
        (conn, syn)
    }

    /// Creates a connection that has just received a peer's `SYN`, returning
    /// it alongside the `SYN_ACK` to send.
    #[must_use]
    pub(crate) fn accept(
        config: &TransportConfig,
        now: Instant,
        initial_seq: Seq,
        peer_syn_seq: Seq,
    ) -> (Self, Packet) {
        let mut conn = Self::new(config, now, initial_seq);
        conn.recv_seq = peer_syn_seq + 1;
        let syn_ack = Packet::syn_ack(conn.send_seq, conn.recv_seq, conn.recv_window());
        conn.send_seq += 1;
        conn.track_unacked(syn_ack.clone(), now);
        conn.state = State::SynRcvd;
        (conn, syn_ack)
    }

    fn new(config: &TransportConfig, now: Instant, initial_seq: Seq) -> Self {
        Self {
            state: State::Closed,
            send_seq: initial_seq,
            recv_seq: Seq::new(0),
            unacked: HashMap::default(),
            recv_buffer: HashMap::default(),
            send_queue: std::collections::VecDeque::new(),
            rtt: RttEstimator::new(config.min_rto, config.max_rto),
            rto: config.min_rto,
            last_activity: now,
            flow: FlowController::new(config.mss() as u32, config.initial_window),
            next_fragment_id: 0,
            reorder_buffer_capacity: config.reorder_buffer_capacity,
            max_retries: config.max_retries,
            mss: config.mss() as u32,
            recv_window_cap: config.initial_window,
            packets_sent: 0,
            packets_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            retransmissions: 0,
            timeouts: 0,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// `true` once the handshake has completed and data may flow.
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.state == State::Established
    }

    fn recv_window(&self) -> u16 {
        let used: usize = self.recv_buffer.values().map(|p| p.payload.len()).sum();
        u16::try_from(self.recv_window_cap.saturating_sub(used as u32)).unwrap_or(u16::MAX)
    }

    fn track_unacked(&mut self, packet: Packet, now: Instant) {
        self.packets_sent += 1;
        self.bytes_sent += packet.payload.len() as u64;
        self.unacked.insert(
            packet.seq,
            Unacked {
                packet,
                first_sent: now,
                last_sent: now,
                retries: 0,
            },
        );
    }

    /// Queues `payload` for reliable delivery, fragmenting it first if it
    /// exceeds the connection's MSS.
    ///
    /// The sequence number that, once acknowledged, marks the whole message
    /// as delivered is not known until the last fragment is actually
    /// admitted and sent - watch for it in [`Connection::flush`]'s output
    /// (the packet marked as completing a message) and then poll
    /// [`Connection::is_acked`].
    ///
    /// # Errors
    ///
    /// Returns the fragment count that would have been required if it
    /// exceeds [`u16::MAX`].
    pub(crate) fn queue_reliable(&mut self, payload: Bytes) -> Result<(), usize> {
        if payload.len() as u32 <= self.mss {
            self.send_queue.push_back(Queued {
                ty: PacketType::Data,
                fragment_id: 0,
                fragment_index: 0,
                fragment_total: 0,
                payload,
                last_of_message: true,
            });
        } else {
            let fragment_id = self.next_fragment_id;
            self.next_fragment_id = self.next_fragment_id.wrapping_add(1);
            let fragments = crate::frag::split(self.mss as usize, fragment_id, payload)?;
            let last_index = fragments.len().saturating_sub(1);
            for (i, fragment) in fragments.into_iter().enumerate() {
                self.send_queue.push_back(Queued {
                    ty: PacketType::Fragment,
                    fragment_id: fragment.fragment_id,
                    fragment_index: fragment.index,
                    fragment_total: fragment.total,
                    payload: fragment.payload,
                    last_of_message: i == last_index,
                });
            }
        }
        Ok(())
    }

    /// Returns `true` if `seq` was previously sent and has since been
    /// cumulatively acknowledged (or was never tracked at all, which a
    /// caller should not rely on - only call this for a `seq` it has
    /// actually observed being sent).
    #[must_use]
    pub(crate) fn is_acked(&self, seq: Seq) -> bool {
        !self.unacked.contains_key(&seq)
    }

    /// Returns `true` if no packet (in the send queue or still unacked) is
    /// outstanding: everything queued so far has been sent and acked.
    #[must_use]
    pub(crate) fn all_acked(&self) -> bool {
        self.send_queue.is_empty() && self.unacked.values().all(|u| u.packet.ty == PacketType::Ping)
    }

    /// Drains as many queued packets as the flow/congestion controller
    /// admits right now, assigning sequence numbers and moving them into
    /// `unacked`. The second element of each pair is `true` for the packet
    /// that completes a `queue_reliable` message - watch its `seq` with
    /// [`Connection::is_acked`] to know when that send is done.
    #[must_use]
    pub(crate) fn flush(&mut self, now: Instant) -> Vec<(Packet, bool)> {
        let mut out = Vec::new();
        while let Some(next) = self.send_queue.front() {
            if !self.flow.can_send(next.payload.len() as u32) {
                break;
            }
            let queued = self.send_queue.pop_front().expect("just peeked");
            let seq = self.send_seq;
            self.send_seq += 1;

            let packet = match queued.ty {
                PacketType::Fragment => Packet::fragment(
                    seq,
                    self.recv_seq,
                    self.recv_window(),
                    queued.fragment_id,
                    queued.fragment_index,
                    queued.fragment_total,
                    queued.payload,
                ),
                _ => Packet::data(seq, self.recv_seq, self.recv_window(), queued.payload),
            };

            self.flow.on_send(packet.payload.len() as u32);
            self.track_unacked(packet.clone(), now);
            out.push((packet, queued.last_of_message));
        }
        out
    }

    /// Processes one inbound packet already known to belong to this
    /// connection.
    pub(crate) fn on_packet(&mut self, packet: Packet, now: Instant) -> InboundOutcome {
        self.last_activity = now;
        self.packets_received += 1;
        let mut outcome = InboundOutcome::default();

        match packet.ty {
            PacketType::SynAck => self.on_syn_ack(&packet, now, &mut outcome),
            PacketType::Ack => self.on_ack(packet.ack, packet.window, now),
            PacketType::Pong => self.on_ack(packet.ack, packet.window, now),
            PacketType::Data | PacketType::Fragment => self.on_data(packet, now, &mut outcome),
            PacketType::Fin => self.on_fin(&packet, now, &mut outcome),
            PacketType::FinAck => self.on_fin_ack(),
            PacketType::Rst => {
                self.state = State::Closed;
                outcome.error = Some(ConnectionError::Reset);
            }
            PacketType::Ping => {
                outcome.responses.push(Packet::pong(self.send_seq, packet.seq + 1));
            }
            PacketType::Syn | PacketType::FragmentAck | PacketType::Nack => {
                trace!(ty = ?packet.ty, "ignoring packet type not handled post-handshake");
            }
        }

        outcome
    }

    fn on_syn_ack(&mut self, packet: &Packet, now: Instant, outcome: &mut InboundOutcome) {
        if self.state != State::SynSent {
            return;
        }
        self.recv_seq = packet.seq + 1;
        self.process_cumulative_ack(packet.ack, packet.window, now);
        self.state = State::Established;
        outcome.established = true;
        outcome
            .responses
            .push(Packet::ack(self.send_seq, self.recv_seq, self.recv_window()));
    }

    fn on_ack(&mut self, ack: Seq, window: u16, now: Instant) {
        if self.state == State::SynRcvd {
            self.state = State::Established;
        }
        self.process_cumulative_ack(ack, window, now);
        if self.state == State::FinWait1 && self.unacked.is_empty() {
            self.state = State::FinWait2;
        }
        if self.state == State::LastAck && self.unacked.is_empty() {
            self.state = State::Closed;
        }
    }

    fn on_data(&mut self, packet: Packet, now: Instant, outcome: &mut InboundOutcome) {
        if !matches!(
            self.state,
            State::Established | State::FinWait1 | State::FinWait2
        ) {
            return;
        }

        self.bytes_received += packet.payload.len() as u64;
        let admission = SeqAdmission::classify(packet.seq, self.recv_seq, self.reorder_buffer_capacity);
        match admission {
            SeqAdmission::TooFarAhead => {
                warn!(seq = %packet.seq, recv_seq = %self.recv_seq, "dropping packet too far out of order");
                return;
            }
            SeqAdmission::Duplicate => {
                // already delivered; fall through to re-ack below
            }
            SeqAdmission::InOrder | SeqAdmission::Buffered => {
                self.recv_buffer.insert(packet.seq, packet);
            }
        }

        while let Some(next) = self.recv_buffer.remove(&self.recv_seq) {
            self.recv_seq += 1;
            outcome.deliverable.push(next);
        }

        outcome
            .responses
            .push(Packet::ack(self.send_seq, self.recv_seq, self.recv_window()));
    }

    fn on_fin(&mut self, packet: &Packet, now: Instant, outcome: &mut InboundOutcome) {
        match self.state {
            State::Established => {
                self.recv_seq = packet.seq + 1;
                self.state = State::CloseWait;
                outcome
                    .responses
                    .push(Packet::ack(self.send_seq, self.recv_seq, self.recv_window()));
            }
            State::FinWait1 => {
                self.recv_seq = packet.seq + 1;
                self.state = State::TimeWait;
                outcome
                    .responses
                    .push(Packet::ack(self.send_seq, self.recv_seq, self.recv_window()));
            }
            State::FinWait2 => {
                self.recv_seq = packet.seq + 1;
                self.state = State::TimeWait;
                outcome
                    .responses
                    .push(Packet::ack(self.send_seq, self.recv_seq, self.recv_window()));
            }
            _ => {}
        }
        let _ = now;
    }

    fn on_fin_ack(&mut self) {
        if self.state == State::LastAck {
            self.state = State::Closed;
        }
    }

    /// Begins a graceful close: emits `FIN` (from `Established`) or, if the
    /// peer already closed its side, the `FIN` that completes passive close
    /// (from `CloseWait`).
    #[must_use]
    pub(crate) fn close(&mut self, now: Instant) -> Option<Packet> {
        match self.state {
            State::Established => {
                let fin = Packet::fin(self.send_seq, self.recv_seq);
                self.send_seq += 1;
                self.track_unacked(fin.clone(), now);
                self.state = State::FinWait1;
                Some(fin)
            }
            State::CloseWait => {
                let fin = Packet::fin(self.send_seq, self.recv_seq);
                self.send_seq += 1;
                self.track_unacked(fin.clone(), now);
                self.state = State::LastAck;
                Some(fin)
            }
            _ => None,
        }
    }

    fn process_cumulative_ack(&mut self, ack: Seq, window: u16, now: Instant) {
        let mut newly_acked_bytes: u32 = 0;
        let mut any_removed = false;
        self.unacked.retain(|&seq, unacked| {
            if seq.distance_from(ack) < 0 {
                any_removed = true;
                newly_acked_bytes += unacked.packet.payload.len() as u32;
                if unacked.retries == 0 {
                    // Karn's algorithm: only sample RTT from non-retransmitted packets
                    self.rtt.update(now.saturating_duration_since(unacked.first_sent));
                    self.rto = self.rtt.rto();
                }
                false
            } else {
                true
            }
        });

        if any_removed {
            self.flow.on_ack(ack, newly_acked_bytes, u32::from(window));
        } else if let DuplicateAckAction::FastRetransmit(target) = self.flow.on_duplicate_ack(ack) {
            if let Some(unacked) = self.unacked.get_mut(&target) {
                debug!(seq = %target, "fast retransmit");
                unacked.last_sent = now;
                unacked.retries += 1;
                self.retransmissions += 1;
            }
        }
    }

    /// Runs one maintenance pass: retransmits anything past its RTO,
    /// sends a keepalive `PING` if idle, and reports a fatal error if the
    /// connection should be torn down.
    #[must_use]
    pub(crate) fn poll_timers(
        &mut self,
        now: Instant,
        ping_interval: Duration,
        connection_timeout: Duration,
        max_rto: Duration,
    ) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        if now.saturating_duration_since(self.last_activity) > connection_timeout
            && self.state != State::Closed
        {
            self.state = State::Closed;
            outcome.error = Some(ConnectionError::Reset);
            outcome.to_send.push(Packet::rst(self.send_seq));
            return outcome;
        }

        let mut any_timed_out = false;
        let mut dead = false;
        for unacked in self.unacked.values_mut() {
            if now.saturating_duration_since(unacked.last_sent) <= self.rto {
                continue;
            }
            if unacked.retries >= self.max_retries {
                dead = true;
                continue;
            }
            unacked.retries += 1;
            unacked.last_sent = now;
            self.retransmissions += 1;
            any_timed_out = true;
            outcome.to_send.push(unacked.packet.clone());
        }

        if dead {
            self.state = State::Closed;
            self.timeouts += 1;
            outcome.error = Some(ConnectionError::SendTimeout);
            outcome.to_send.push(Packet::rst(self.send_seq));
            return outcome;
        }

        if any_timed_out {
            self.flow.on_timeout();
            self.rto = RttEstimator::backoff(self.rto, max_rto);
            self.timeouts += 1;
        }

        if self.state == State::Established
            && now.saturating_duration_since(self.last_activity) > ping_interval
        {
            let ping = Packet::ping(self.send_seq);
            self.send_seq += 1;
            self.track_unacked(ping.clone(), now);
            outcome.to_send.push(ping);
        }

        outcome
    }

    /// Snapshot of this connection's counters, for [`crate::stats::ConnectionStats`].
    pub(crate) fn counters(&self) -> (u64, u64, u64, u64, u64, u64) {
        (
            self.packets_sent,
            self.packets_received,
            self.bytes_sent,
            self.bytes_received,
            self.retransmissions,
            self.timeouts,
        )
    }

    pub(crate) fn srtt(&self) -> Option<Duration> {
        self.rtt.smoothed()
    }

    pub(crate) fn cwnd(&self) -> u32 {
        self.flow.cwnd()
    }

    pub(crate) fn bytes_in_flight(&self) -> u32 {
        self.flow.bytes_in_flight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TransportConfig {
        TransportConfig {
            max_retries: 3,
            ..TransportConfig::default()
        }
    }

    #[test]
    fn handshake_completes() {
        let now = Instant::now();
        let (mut client, syn) = Connection::connect(&config(), now, Seq::new(100));
        assert_eq!(State::SynSent, client.state());

        let (mut server, syn_ack) = Connection::accept(&config(), now, Seq::new(500), syn.seq);
        assert_eq!(State::SynRcvd, server.state());

        let outcome = client.on_packet(syn_ack, now);
        assert!(outcome.established);
        assert_eq!(State::Established, client.state());

        let ack = outcome.responses.into_iter().next().unwrap();
        let outcome = server.on_packet(ack, now);
        assert_eq!(State::Established, server.state());
        assert!(outcome.error.is_none());
    }

    #[test]
    fn reliable_data_is_delivered_in_order() {
        let now = Instant::now();
        let mut conn = established_pair(now);
        let (client, server) = (&mut conn.0, &mut conn.1);

        client.queue_reliable(Bytes::from_static(b"hello")).unwrap();
        let packets = client.flush(now);
        assert_eq!(1, packets.len());

        let (only_packet, is_last) = packets.into_iter().next().unwrap();
        assert!(is_last);
        let outcome = server.on_packet(only_packet, now);
        assert_eq!(1, outcome.deliverable.len());
        assert_eq!(b"hello".as_slice(), &outcome.deliverable[0].payload[..]);
    }

    #[test]
    fn out_of_order_data_is_buffered_until_gap_fills() {
        let now = Instant::now();
        let (mut client, mut server) = established_pair(now);

        client.queue_reliable(Bytes::from_static(b"one")).unwrap();
        client.queue_reliable(Bytes::from_static(b"two")).unwrap();
        let packets = client.flush(now);
        assert_eq!(2, packets.len());

        let second_first = server.on_packet(packets[1].0.clone(), now);
        assert!(second_first.deliverable.is_empty(), "seq 2 shouldn't deliver before seq 1");

        let now_first = server.on_packet(packets[0].0.clone(), now);
        assert_eq!(2, now_first.deliverable.len());
    }

    #[test]
    fn fast_retransmit_on_three_duplicate_acks() {
        let now = Instant::now();
        let (mut client, _server) = established_pair(now);
        for _ in 0..5 {
            client.queue_reliable(Bytes::from_static(b"x")).unwrap();
        }
        let sent = client.flush(now);
        assert!(sent.len() >= 4);
        let target_seq = sent[3].0.seq;

        for _ in 0..3 {
            client.on_packet(Packet::ack(Seq::new(0), target_seq, 65535), now);
        }
        assert!(client.unacked.get(&target_seq).map(|u| u.retries).unwrap_or(0) >= 1);
    }

    #[test]
    fn retransmit_gives_up_after_max_retries() {
        let now = Instant::now();
        let (mut client, _syn) = Connection::connect(&config(), now, Seq::new(1));
        let mut t = now;
        let mut last_error = None;
        for _ in 0..10 {
            t += Duration::from_secs(2);
            let outcome = client.poll_timers(t, Duration::from_secs(15), Duration::from_secs(600), Duration::from_secs(60));
            if let Some(err) = outcome.error {
                last_error = Some(err);
                break;
            }
        }
        assert_eq!(Some(ConnectionError::SendTimeout), last_error);
        assert_eq!(State::Closed, client.state());
    }

    #[test]
    fn idle_timeout_resets_connection() {
        let now = Instant::now();
        let (mut client, mut server) = established_pair(now);
        let _ = &mut client;
        let outcome = server.poll_timers(
            now + Duration::from_secs(120),
            Duration::from_secs(15),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        assert_eq!(Some(ConnectionError::Reset), outcome.error);
        assert_eq!(State::Closed, server.state());
    }

    #[test]
    fn graceful_close_reaches_time_wait() {
        let now = Instant::now();
        let (mut client, mut server) = established_pair(now);

        let fin = client.close(now).unwrap();
        assert_eq!(State::FinWait1, client.state());

        let outcome = server.on_packet(fin, now);
        assert_eq!(State::CloseWait, server.state());
        let ack = outcome.responses.into_iter().next().unwrap();

        client.on_packet(ack, now);
        assert_eq!(State::FinWait2, client.state());

        let fin_back = server.close(now).unwrap();
        assert_eq!(State::LastAck, server.state());

        let outcome = client.on_packet(fin_back, now);
        assert_eq!(State::TimeWait, client.state());
        let ack_back = outcome.responses.into_iter().next().unwrap();

        server.on_packet(ack_back, now);
        assert_eq!(State::Closed, server.state());
    }

    /// Builds a pair of connections already in `Established`, skipping the
    /// handshake packet shuffling that [`handshake_completes`] exercises
    /// directly.
    fn established_pair(now: Instant) -> (Connection, Connection) {
        let (mut client, syn) = Connection::connect(&config(), now, Seq::new(10));
        let (mut server, syn_ack) = Connection::accept(&config(), now, Seq::new(20), syn.seq);
        let outcome = client.on_packet(syn_ack, now);
        let ack = outcome.responses.into_iter().next().unwrap();
        server.on_packet(ack, now);
        (client, server)
    }
}
