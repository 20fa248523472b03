//! Sliding-window flow control combined with TCP-Reno-style AIMD congestion
//! control.
//!
//! The two mechanisms are logically ANDed together: the amount a connection
//! may have outstanding at any moment is `min(flow_window, cwnd) -
//! bytes_in_flight`. Flow control reflects what the *peer* says it can
//! buffer; congestion control reflects what the *network path* seems to be
//! able to carry, inferred from acks, duplicate acks, and timeouts.

use crate::packet::Seq;

/// Admits or rejects outbound bytes against the peer's advertised window and
/// this connection's congestion window, and reacts to ack/loss signals by
/// adjusting `cwnd` per the standard Reno state machine (slow start,
/// congestion avoidance, fast retransmit, fast recovery).
#[derive(Debug, Clone)]
pub struct FlowController {
    mss: u32,
    flow_window: u32,
    receiver_window: u32,
    cwnd: u32,
    ssthresh: u32,
    bytes_in_flight: u32,
    dup_ack_count: u32,
    last_ack_seen: Option<Seq>,
    in_fast_recovery: bool,
}

/// What a caller should do in response to [`FlowController::on_duplicate_ack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateAckAction {
    /// Nothing to do yet; fewer than three duplicates seen.
    None,
    /// Three duplicate acks seen: fast-retransmit the packet at this
    /// sequence number and enter fast recovery.
    FastRetransmit(Seq),
    /// Already in fast recovery; `cwnd` was inflated further but no new
    /// retransmission is needed.
    InflateWindow,
}

impl FlowController {
    /// Creates a controller for a fresh connection.
    ///
    /// `mss` is the maximum segment size (`mtu - HEADER_LEN`); `initial_window`
    /// seeds both the flow window (until the peer's first `ACK` arrives)
    /// and `ssthresh`.
    #[must_use]
    pub fn new(mss: u32, initial_window: u32) -> Self {
        Self {
            mss,
            flow_window: initial_window,
            receiver_window: initial_window,
            cwnd: mss,
            ssthresh: initial_window,
            bytes_in_flight: 0,
            dup_ack_count: 0,
            last_ack_seen: None,
            in_fast_recovery: false,
        }
    }

    /// Bytes this connection is currently permitted to have outstanding
    /// beyond what's already in flight.
    #[must_use]
    pub fn effective_window(&self) -> u32 {
        self.flow_window
            .min(self.cwnd)
            .saturating_sub(self.bytes_in_flight)
    }

    /// Returns `true` if `n` more bytes may be sent right now.
    #[must_use]
    pub fn can_send(&self, n: u32) -> bool {
        n <= self.effective_window()
    }

    /// Records that `n` bytes were just transmitted and are now
    /// outstanding.
    pub fn on_send(&mut self, n: u32) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_add(n);
    }

    /// The current congestion window, in bytes.
    #[must_use]
    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    /// Bytes currently outstanding.
    #[must_use]
    pub fn bytes_in_flight(&self) -> u32 {
        self.bytes_in_flight
    }

    /// Records a *new* (non-duplicate) cumulative ack, releasing `acked_bytes`
    /// from flight and updating the receiver-advertised window and `cwnd`.
    pub fn on_ack(&mut self, ack: Seq, acked_bytes: u32, receiver_window: u32) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(acked_bytes);
        self.receiver_window = receiver_window;
        self.flow_window = receiver_window;
        self.dup_ack_count = 0;
        self.last_ack_seen = Some(ack);

        if self.in_fast_recovery {
            self.cwnd = self.ssthresh;
            self.in_fast_recovery = false;
            return;
        }

        if self.cwnd < self.ssthresh {
            // slow start: one MSS per ack
            self.cwnd = self.cwnd.saturating_add(self.mss);
        } else {
            // congestion avoidance: approximately one MSS per RTT
            let increment = (u64::from(self.mss) * u64::from(self.mss) / u64::from(self.cwnd).max(1))
                .max(1) as u32;
            self.cwnd = self.cwnd.saturating_add(increment);
        }
    }

    /// Records a duplicate ack (same cumulative value as the last one, with
    /// no new data acked). On the third duplicate, triggers fast retransmit;
    /// on subsequent ones while already in fast recovery, inflates `cwnd`.
    pub fn on_duplicate_ack(&mut self, ack: Seq) -> DuplicateAckAction {
        if self.last_ack_seen != Some(ack) {
            self.last_ack_seen = Some(ack);
            self.dup_ack_count = 1;
            return DuplicateAckAction::None;
        }

        self.dup_ack_count += 1;

        if self.in_fast_recovery {
            self.cwnd = self.cwnd.saturating_add(self.mss);
            return DuplicateAckAction::InflateWindow;
        }

        if self.dup_ack_count == 3 {
            self.ssthresh = (self.cwnd / 2).max(2 * self.mss);
            self.cwnd = self.ssthresh + 3 * self.mss;
            self.in_fast_recovery = true;
            return DuplicateAckAction::FastRetransmit(ack);
        }

        DuplicateAckAction::None
    }

    /// Applies the RTO timeout policy: halve `ssthresh`, reset `cwnd` to one
    /// MSS, and leave fast recovery.
    pub fn on_timeout(&mut self) {
        self.ssthresh = (self.cwnd / 2).max(2 * self.mss);
        self.cwnd = self.mss;
        self.in_fast_recovery = false;
        self.dup_ack_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSS: u32 = 1368;

    #[test]
    fn starts_in_slow_start_with_one_mss() {
        let flow = FlowController::new(MSS, 65535);
        assert_eq!(MSS, flow.cwnd());
    }

    #[test]
    fn slow_start_grows_by_one_mss_per_ack() {
        let mut flow = FlowController::new(MSS, 65535);
        flow.on_send(MSS);
        flow.on_ack(Seq::new(1), MSS, 65535);
        assert_eq!(2 * MSS, flow.cwnd());
    }

    #[test]
    fn congestion_avoidance_grows_slower_than_slow_start() {
        let mut flow = FlowController::new(MSS, 65535);
        // force into congestion avoidance by setting ssthresh low via timeout
        flow.on_timeout();
        let ssthresh_floor = 2 * MSS;
        assert_eq!(ssthresh_floor, flow.cwnd());

        flow.on_send(MSS);
        let before = flow.cwnd();
        flow.on_ack(Seq::new(1), MSS, 65535);
        let grew_by = flow.cwnd() - before;
        assert!(grew_by < MSS, "expected sub-linear growth, grew by {grew_by}");
    }

    #[test]
    fn third_duplicate_ack_triggers_fast_retransmit() {
        let mut flow = FlowController::new(MSS, 65535);
        flow.on_send(10 * MSS);
        let target = Seq::new(5);

        assert_eq!(DuplicateAckAction::None, flow.on_duplicate_ack(target));
        assert_eq!(DuplicateAckAction::None, flow.on_duplicate_ack(target));
        assert_eq!(
            DuplicateAckAction::FastRetransmit(target),
            flow.on_duplicate_ack(target)
        );
        // ssthresh = max(MSS/2, 2*MSS) = 2*MSS, cwnd = ssthresh + 3*MSS = 5*MSS
        assert_eq!(5 * MSS, flow.cwnd());
    }

    #[test]
    fn timeout_resets_to_one_mss_and_halves_ssthresh() {
        let mut flow = FlowController::new(MSS, 65535);
        flow.on_send(MSS);
        flow.on_ack(Seq::new(1), MSS, 65535); // cwnd = 2*MSS now

        flow.on_timeout();
        assert_eq!(MSS, flow.cwnd());
    }

    #[test]
    fn effective_window_accounts_for_receiver_window() {
        let mut flow = FlowController::new(MSS, 65535);
        flow.on_ack(Seq::new(0), 0, 100);
        assert!(flow.effective_window() <= 100);
    }

    #[test]
    fn bytes_in_flight_bounded_by_min_of_cwnd_and_receiver_window() {
        let mut flow = FlowController::new(MSS, 65535);
        flow.on_send(500);
        assert!(flow.bytes_in_flight() <= flow.cwnd().min(flow.effective_window() + 500));
    }
}
