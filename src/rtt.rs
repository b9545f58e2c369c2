use std::cmp::{max, min};
use std::time::{Duration, Instant};
use tracing::trace;

/// Round-trip estimation from (send time, ack receive time, peer ack delay)
///  triples: exponentially weighted smoothed RTT and variance, plus the minimum
///  observed over the connection's lifetime.
pub struct RttEstimator {
    smoothed: Duration,
    variance: Duration,
    min: Duration,
    granularity: Duration,
    has_sample: bool,
}

impl RttEstimator {
    pub fn new(initial_rtt: Duration, granularity: Duration) -> RttEstimator {
        RttEstimator {
            smoothed: initial_rtt,
            variance: initial_rtt / 2,
            min: Duration::MAX,
            granularity,
            has_sample: false,
        }
    }

    /// Feed one measurement: an ack received at `receive_time` for a packet sent
    ///  at `send_time`, where the peer reports having held the ack back for
    ///  `peer_ack_delay`. The delay is only subtracted when doing so cannot push
    ///  the sample below the minimum RTT, so a peer overstating its delay cannot
    ///  drive the estimate towards zero.
    pub fn add_sample(&mut self, receive_time: Instant, send_time: Instant, peer_ack_delay: Duration) {
        let mut latest = match receive_time.checked_duration_since(send_time) {
            Some(latest) if !latest.is_zero() => latest,
            _ => {
                trace!("non-positive rtt sample - ignoring (clock skew?)");
                return;
            }
        };

        self.min = min(self.min, latest);

        if latest > self.min + peer_ack_delay {
            latest -= peer_ack_delay;
        }

        if self.has_sample {
            let delta = if self.smoothed > latest {
                self.smoothed - latest
            } else {
                latest - self.smoothed
            };
            self.variance = (self.variance * 3 + delta) / 4;
            self.smoothed = (self.smoothed * 7 + latest) / 8;
        } else {
            self.smoothed = latest;
            self.variance = latest / 2;
            self.has_sample = true;
        }

        trace!("rtt sample {:?}: smoothed {:?}, variance {:?}, min {:?}", latest, self.smoothed, self.variance, self.min);
    }

    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed
    }

    pub fn rtt_variance(&self) -> Duration {
        self.variance
    }

    pub fn min_rtt(&self) -> Duration {
        self.min
    }

    pub fn has_sample(&self) -> bool {
        self.has_sample
    }

    /// Base value for the probe timeout: smoothed RTT plus four times the
    ///  variance, with the variance term floored at the configured granularity.
    pub fn pto_base(&self) -> Duration {
        self.smoothed + max(self.variance * 4, self.granularity)
    }
}
