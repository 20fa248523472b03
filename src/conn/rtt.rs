//! See [`RttEstimator`].

use std::time::Duration;

/// Computes a round-trip-time estimate for a connection, using the
/// Jacobson/Karels algorithm.
///
/// RTT samples must only come from packets that were never retransmitted
/// (Karn's algorithm) - otherwise it is ambiguous which transmission the ack
/// is actually for, and the sample would poison the estimate.
#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    min_rto: Duration,
    max_rto: Duration,
}

impl RttEstimator {
    /// Creates an estimator with no samples yet, bounding `rto()` to
    /// `[min_rto, max_rto]`.
    #[must_use]
    pub fn new(min_rto: Duration, max_rto: Duration) -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            min_rto,
            max_rto,
        }
    }

    /// The current smoothed RTT estimate, or `None` if no sample has been
    /// recorded yet.
    #[must_use]
    pub fn smoothed(&self) -> Option<Duration> {
        self.srtt
    }

    /// Records a fresh RTT sample and updates `srtt`/`rttvar` accordingly.
    ///
    /// ```
    /// use std::time::Duration;
    /// use swarmlink::conn::rtt::RttEstimator;
    ///
    /// let mut rtt = RttEstimator::new(Duration::from_secs(1), Duration::from_secs(60));
    /// rtt.update(Duration::from_millis(100));
    /// assert_eq!(Some(Duration::from_millis(100)), rtt.smoothed());
    /// ```
    pub fn update(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let delta = if srtt > sample {
                    srtt - sample
                } else {
                    sample - srtt
                };
                self.rttvar = self.rttvar.mul_f64(0.75) + delta.mul_f64(0.25);
                self.srtt = Some(srtt.mul_f64(0.875) + sample.mul_f64(0.125));
            }
        }
    }

    /// The current retransmission timeout: `clamp(srtt + 4*rttvar, min_rto, max_rto)`.
    ///
    /// Before any sample has been recorded, returns `min_rto`.
    #[must_use]
    pub fn rto(&self) -> Duration {
        let estimate = self.srtt.unwrap_or(Duration::ZERO) + self.rttvar * 4;
        estimate.clamp(self.min_rto, self.max_rto)
    }

    /// Doubles the current backoff of `rto`, clamped to `max_rto`.
    ///
    /// Called when an RTO fires without Karn's-algorithm-eligible samples
    /// to update `srtt`/`rttvar` directly; applied as a multiplier on top of
    /// the last computed `rto()` rather than mutating `srtt` itself, so a
    /// clean sample afterwards recovers the true estimate immediately.
    #[must_use]
    pub fn backoff(current: Duration, max_rto: Duration) -> Duration {
        (current * 2).min(max_rto)
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_srtt() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(200));
        assert_eq!(Some(Duration::from_millis(200)), rtt.smoothed());
    }

    #[test]
    fn rto_is_bounded_below() {
        let rtt = RttEstimator::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(Duration::from_secs(1), rtt.rto());
    }

    #[test]
    fn rto_is_bounded_above() {
        let mut rtt = RttEstimator::new(Duration::from_millis(1), Duration::from_secs(60));
        for _ in 0..50 {
            rtt.update(Duration::from_secs(120));
        }
        assert!(rtt.rto() <= Duration::from_secs(60));
    }

    #[test]
    fn converges_towards_stable_sample() {
        let mut rtt = RttEstimator::default();
        for _ in 0..20 {
            rtt.update(Duration::from_millis(50));
        }
        let smoothed = rtt.smoothed().unwrap();
        assert!(smoothed.as_millis().abs_diff(50) < 2);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let max = Duration::from_secs(60);
        assert_eq!(Duration::from_secs(2), RttEstimator::backoff(Duration::from_secs(1), max));
        assert_eq!(max, RttEstimator::backoff(Duration::from_secs(50), max));
    }
}
