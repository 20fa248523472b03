//! Binds the packet codec, fragmenter, and per-peer connections to an actual
//! socket: the receive loop, the maintenance ticker, and the public
//! `send_unreliable`/`send_reliable` entry points.

pub mod socket;

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use ahash::HashMap;
use bytes::Bytes;
use tracing::{debug, trace, trace_span, warn};

use crate::config::TransportConfig;
use crate::conn::{Connection, State};
use crate::error::{ConnectionError, SendError};
use crate::frag::{self, Reassembler};
use crate::packet::{Packet, PacketType, Seq};
use crate::stats::{ConnectionStats, Stats};
use socket::{Clock, DatagramSocket};

const RECV_BUF_LEN: usize = 64 * 1024;

/// Reliable, ordered, flow- and congestion-controlled packet transport.
///
/// Owns a [`DatagramSocket`], a [`Clock`], the per-peer connection table,
/// and the fragment reassembler. Driven cooperatively: call [`Transport::poll`]
/// regularly (or rely on it being called internally by [`Transport::send_reliable`])
/// to advance the receive loop and the maintenance tick.
pub struct Transport<S, C> {
    socket: S,
    clock: C,
    config: TransportConfig,
    connections: HashMap<SocketAddr, Connection>,
    reassembler: Reassembler,
    recv_handler: Option<Box<dyn FnMut(SocketAddr, Bytes) + Send>>,
    last_maintenance: Instant,
    next_fragment_id: u32,
    closed: bool,
    stats: Stats,
}

impl<S: DatagramSocket, C: Clock> Transport<S, C> {
    /// Wraps an already-bound socket and clock with the given configuration.
    pub fn new(socket: S, clock: C, config: TransportConfig) -> Self {
        let now = clock.now();
        Self {
            socket,
            clock,
            config,
            connections: HashMap::default(),
            reassembler: Reassembler::new(),
            recv_handler: None,
            last_maintenance: now,
            next_fragment_id: 0,
            closed: false,
            stats: Stats::default(),
        }
    }

    /// Registers the callback invoked once per fully-reassembled inbound
    /// message (both reliable and unreliable).
    pub fn register_receive_handler(&mut self, handler: impl FnMut(SocketAddr, Bytes) + Send + 'static) {
        self.recv_handler = Some(Box::new(handler));
    }

    /// Marks the transport active. A no-op beyond documenting intent - the
    /// receive loop and maintenance ticker both run lazily, driven by
    /// [`Transport::poll`].
    pub fn start(&mut self) {
        self.closed = false;
    }

    /// Shuts the transport down: further sends fail with
    /// [`SendError::TransportClosed`].
    pub fn stop(&mut self) {
        self.closed = true;
    }

    /// Drains every datagram currently available on the socket and runs the
    /// maintenance tick if `maintenance_interval` has elapsed. Call this
    /// regularly from an event loop; [`Transport::send_reliable`] also calls
    /// it internally while waiting for admission and acknowledgment.
    pub fn poll(&mut self) {
        self.drain_socket();
        let now = self.clock.now();
        if now.saturating_duration_since(self.last_maintenance) >= self.config.maintenance_interval {
            self.run_maintenance(now);
            self.last_maintenance = now;
        }
        self.flush_all(now);
    }

    fn drain_socket(&mut self) {
        let mut buf = [0u8; RECV_BUF_LEN];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => self.handle_datagram(from, &buf[..len]),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(error = %err, "socket recv error");
                    break;
                }
            }
        }
    }

    fn handle_datagram(&mut self, from: SocketAddr, bytes: &[u8]) {
        let packet = match Packet::decode(Bytes::copy_from_slice(bytes)) {
            Ok(packet) => packet,
            Err(err) => {
                trace!(peer = %from, error = %err, "dropping malformed packet");
                return;
            }
        };
        self.stats.packets_received += 1;
        let now = self.clock.now();
        let _span = trace_span!("recv", peer = %from, seq = packet.seq.get()).entered();

        if packet.ty == PacketType::Syn && !self.connections.contains_key(&from) {
            self.accept(from, packet.seq, now);
            return;
        }

        if is_unreliable(&packet) {
            self.handle_unreliable(from, packet, now);
            return;
        }

        let Some(conn) = self.connections.get_mut(&from) else {
            trace!(peer = %from, "dropping packet for unknown connection");
            return;
        };

        let outcome = conn.on_packet(packet, now);
        for response in outcome.responses {
            self.send_packet(from, &response);
        }
        for deliverable in outcome.deliverable {
            self.deliver(from, deliverable, now);
        }
        if let Some(error) = outcome.error {
            debug!(peer = %from, %error, "connection failed");
            self.reassembler.forget_peer(from);
            self.connections.remove(&from);
        }
    }

    fn handle_unreliable(&mut self, from: SocketAddr, packet: Packet, now: Instant) {
        self.deliver(from, packet, now);
    }

    fn deliver(&mut self, from: SocketAddr, packet: Packet, now: Instant) {
        self.stats.bytes_received += packet.payload.len() as u64;
        if packet.is_fragment() {
            let fragment = frag::Fragment {
                fragment_id: packet.fragment_id,
                index: packet.fragment_index,
                total: packet.fragment_total,
                payload: packet.payload,
            };
            match self.reassembler.receive(
                from,
                fragment,
                now,
                self.config.max_reassembly_bytes_per_peer,
            ) {
                Ok(Some(message)) => self.emit(from, message),
                Ok(None) => {}
                Err(err) => trace!(peer = %from, error = %err, "dropping invalid fragment"),
            }
        } else {
            self.emit(from, packet.payload);
        }
    }

    fn emit(&mut self, from: SocketAddr, message: Bytes) {
        if let Some(handler) = &mut self.recv_handler {
            handler(from, message);
        }
    }

    fn accept(&mut self, from: SocketAddr, peer_syn_seq: Seq, now: Instant) {
        let initial_seq = Seq::new(rand::random());
        let (conn, syn_ack) = Connection::accept(&self.config, now, initial_seq, peer_syn_seq);
        self.send_packet(from, &syn_ack);
        self.connections.insert(from, conn);
    }

    fn run_maintenance(&mut self, now: Instant) {
        let evicted = self
            .reassembler
            .evict_expired(now, self.config.reassembly_ttl);
        if evicted > 0 {
            debug!(count = evicted, "evicted stale reassemblies");
        }

        let mut dead = Vec::new();
        for (&peer, conn) in &mut self.connections {
            let outcome = conn.poll_timers(
                now,
                self.config.ping_interval,
                self.config.connection_timeout,
                self.config.max_rto,
            );
            for packet in &outcome.to_send {
                self.stats.packets_sent += 1;
                if let Err(err) = self.socket.send_to(&packet.encode(), peer) {
                    warn!(peer = %peer, error = %err, "failed to send during maintenance");
                }
            }
            if let Some(error) = outcome.error {
                debug!(peer = %peer, %error, "connection torn down by maintenance");
                dead.push(peer);
            }
        }
        for peer in dead {
            self.connections.remove(&peer);
            self.reassembler.forget_peer(peer);
        }
    }

    fn flush_all(&mut self, now: Instant) {
        let peers: Vec<SocketAddr> = self.connections.keys().copied().collect();
        for peer in peers {
            let Some(conn) = self.connections.get_mut(&peer) else {
                continue;
            };
            let flushed = conn.flush(now);
            for (packet, _last) in flushed {
                self.send_packet(peer, &packet);
            }
        }
    }

    fn send_packet(&mut self, to: SocketAddr, packet: &Packet) {
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += packet.payload.len() as u64;
        if let Err(err) = self.socket.send_to(&packet.encode(), to) {
            warn!(peer = %to, error = %err, "failed to send packet");
        }
    }

    /// Sends `payload` with no delivery guarantee and no connection state.
    ///
    /// If `payload` exceeds the configured MTU it is fragmented, with each
    /// fragment sent as its own unreliable datagram.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::TransportClosed`] if [`Transport::stop`] has
    /// been called, or [`SendError::PayloadTooLarge`] if the message would
    /// require more than [`u16::MAX`] fragments.
    pub fn send_unreliable(&mut self, peer: SocketAddr, payload: Bytes) -> Result<(), SendError> {
        if self.closed {
            return Err(SendError::TransportClosed);
        }

        let len = payload.len();
        let mss = self.config.mss();
        let fragment_id = self.next_fragment_id;
        self.next_fragment_id = self.next_fragment_id.wrapping_add(1);

        let fragments = frag::split(mss, fragment_id, payload).map_err(|frags| SendError::PayloadTooLarge { len, frags })?;
        for fragment in fragments {
            let packet = if fragment.total <= 1 {
                Packet::data(Seq::new(0), Seq::new(0), 0, fragment.payload)
            } else {
                Packet::fragment(
                    Seq::new(0),
                    Seq::new(0),
                    0,
                    fragment.fragment_id,
                    fragment.index,
                    fragment.total,
                    fragment.payload,
                )
            };
            self.send_packet(peer, &packet);
        }
        Ok(())
    }

    /// Sends `payload` reliably, in order, fragmenting it if needed,
    /// blocking (by cooperatively driving [`Transport::poll`]) until the
    /// final fragment has been cumulatively acknowledged or `timeout`
    /// elapses.
    ///
    /// Establishes a connection to `peer` first if one does not already
    /// exist.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::TransportClosed`], [`SendError::PayloadTooLarge`],
    /// or a wrapped [`ConnectionError`] (handshake timeout, send timeout, or
    /// the peer resetting the connection).
    pub fn send_reliable(
        &mut self,
        peer: SocketAddr,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<(), SendError> {
        if self.closed {
            return Err(SendError::TransportClosed);
        }

        let deadline = self.clock.now() + timeout;
        self.ensure_connected(peer, deadline)?;

        let len = payload.len();
        let conn = self
            .connections
            .get_mut(&peer)
            .ok_or(SendError::TransportClosed)?;
        conn.queue_reliable(payload)
            .map_err(|frags| SendError::PayloadTooLarge { len, frags })?;

        let mut target_seq = None;
        loop {
            let now = self.clock.now();
            if let Some(conn) = self.connections.get_mut(&peer) {
                for (packet, is_last) in conn.flush(now) {
                    if is_last {
                        target_seq = Some(packet.seq);
                    }
                    self.send_packet(peer, &packet);
                }
            } else {
                return Err(ConnectionError::Reset.into());
            }

            if let Some(seq) = target_seq {
                match self.connections.get(&peer) {
                    Some(conn) if conn.is_acked(seq) => return Ok(()),
                    None => return Err(ConnectionError::Reset.into()),
                    _ => {}
                }
            }

            if self.clock.now() >= deadline {
                return Err(ConnectionError::SendTimeout.into());
            }
            self.poll();
        }
    }

    fn ensure_connected(&mut self, peer: SocketAddr, deadline: Instant) -> Result<(), SendError> {
        if matches!(self.connections.get(&peer).map(Connection::state), Some(State::Established)) {
            return Ok(());
        }

        if !self.connections.contains_key(&peer) {
            let now = self.clock.now();
            let initial_seq = Seq::new(rand::random());
            let (conn, syn) = Connection::connect(&self.config, now, initial_seq);
            self.send_packet(peer, &syn);
            self.connections.insert(peer, conn);
        }

        loop {
            if matches!(self.connections.get(&peer).map(Connection::state), Some(State::Established)) {
                return Ok(());
            }
            if self.clock.now() >= deadline {
                self.connections.remove(&peer);
                return Err(ConnectionError::HandshakeTimeout.into());
            }
            self.poll();
        }
    }

    /// Begins a graceful close of the connection to `peer`, if one exists.
    pub fn disconnect(&mut self, peer: SocketAddr) {
        let now = self.clock.now();
        if let Some(conn) = self.connections.get_mut(&peer) {
            if let Some(fin) = conn.close(now) {
                self.send_packet(peer, &fin);
            }
        }
    }

    /// Transport-wide counters aggregated across every connection.
    #[must_use]
    pub fn stats(&self) -> Stats {
        let mut stats = self.stats;
        for conn in self.connections.values() {
            let (.., retransmissions, timeouts) = conn.counters();
            stats.retransmissions += retransmissions;
            stats.timeouts += timeouts;
        }
        stats
    }

    /// Per-connection counters, or `None` if no connection to `peer` exists.
    #[must_use]
    pub fn connection_stats(&self, peer: SocketAddr) -> Option<ConnectionStats> {
        let conn = self.connections.get(&peer)?;
        let (packets_sent, packets_received, bytes_sent, bytes_received, retransmissions, timeouts) =
            conn.counters();
        Some(ConnectionStats {
            state: conn.state(),
            packets_sent,
            packets_received,
            bytes_sent,
            bytes_received,
            retransmissions,
            timeouts,
            srtt: conn.srtt(),
            cwnd: conn.cwnd(),
            bytes_in_flight: conn.bytes_in_flight(),
        })
    }
}

fn is_unreliable(packet: &Packet) -> bool {
    matches!(packet.ty, PacketType::Data | PacketType::Fragment)
        && packet.seq == Seq::new(0)
        && packet.ack == Seq::new(0)
}
