use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::frame::{AckFrame, AckInterval};

/// Tracks received packet numbers for one epoch and produces ack frames for
///  them.
///
/// A number stays in the received set - and keeps being advertised in every ack
///  we send - until the peer acknowledges one of our ack-bearing packets. At
///  that point the peer provably knows we received everything that ack covered,
///  and the numbers can be dropped.
#[derive(Default)]
pub struct AckTracker {
    /// received packet numbers the peer does not yet know we have
    received: BTreeSet<u64>,
    /// arrivals since the last ack was generated
    new_arrivals: bool,
    /// when the current largest received number arrived, for the ack-delay field
    largest_received_at: Option<(u64, Instant)>,
    /// acks we sent, keyed by the packet number of our packet that carried them,
    ///  with the largest number that ack covered
    sent_acks: BTreeMap<u64, u64>,
}

impl AckTracker {
    pub fn new() -> AckTracker {
        AckTracker::default()
    }

    /// Register an inbound packet. Only ack-eliciting packets are recorded -
    ///  acknowledging pure acks would make every ack breed another.
    pub fn on_packet_received(&mut self, packet_number: u64, ack_eliciting: bool, now: Instant) {
        if !ack_eliciting {
            return;
        }

        if self.received.insert(packet_number) {
            self.new_arrivals = true;
        }

        match self.largest_received_at {
            Some((largest, _)) if largest >= packet_number => {}
            _ => self.largest_received_at = Some((packet_number, now)),
        }
    }

    /// true if packets arrived since the last generated ack
    pub fn has_new_ack(&self) -> bool {
        self.new_arrivals
    }

    /// true if there is anything to acknowledge at all
    pub fn has_any_ack(&self) -> bool {
        !self.received.is_empty()
    }

    /// Produce an ack frame covering the current received set, to be carried in
    ///  our packet `packet_number`. Returns None if there is nothing to
    ///  acknowledge; callers check [has_any_ack](Self::has_any_ack) first.
    pub fn generate_ack(&mut self, packet_number: u64, now: Instant) -> Option<AckFrame> {
        let largest = *self.received.last()?;

        let mut intervals: Vec<AckInterval> = Vec::new();
        for &number in self.received.iter().rev() {
            match intervals.last_mut() {
                Some(interval) if interval.low == number + 1 => interval.low = number,
                _ => intervals.push(AckInterval { low: number, high: number }),
            }
        }

        let ack_delay = match self.largest_received_at {
            Some((number, received_at)) if number == largest => {
                now.saturating_duration_since(received_at)
            }
            _ => Duration::ZERO,
        };

        self.sent_acks.insert(packet_number, largest);
        self.new_arrivals = false;

        trace!("generated ack up to {} in {} ranges, carried in packet {}", largest, intervals.len(), packet_number);
        Some(AckFrame::new(intervals, ack_delay))
    }

    /// The peer acknowledged our packet `packet_number`. If that packet carried
    ///  an ack, everything that ack covered is now known to the peer and stops
    ///  being advertised.
    pub fn on_packet_acked(&mut self, packet_number: u64) {
        if let Some(largest_covered) = self.sent_acks.remove(&packet_number) {
            self.received = self.received.split_off(&(largest_covered + 1));
            // older sent acks cover at most the same numbers, so their entries
            //  are stale as well
            self.sent_acks.retain(|_, largest| *largest > largest_covered);
            trace!("peer confirmed our ack up to {}: {} numbers remain", largest_covered, self.received.len());
        }
    }
}
