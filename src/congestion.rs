use std::cmp::max;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::config::TransportConfig;
use crate::packet::SentPacketInfo;

/// NewReno-style congestion control over a byte-based window.
///
/// The controller admits packets while `bytes_in_flight + size` fits into the
///  congestion window, grows the window on acks (exponentially in slow start,
///  linearly afterwards) and halves it when a loss starts a recovery period.
///  Acks for packets sent before the recovery period started do not grow the
///  window - they carry no information about the reduced sending rate.
///
/// Senders blocked on the window wait via [wait_for_update](Self::wait_for_update)
///  or [subscribe](Self::subscribe); every ack and loss event signals them, and
///  the waiting side re-reads the window state on wake-up.
pub struct CongestionController {
    max_datagram_size: usize,
    minimum_window: usize,
    loss_reduction_factor: f64,
    state: Mutex<CongestionState>,
    updates: watch::Sender<u64>,
}

struct CongestionState {
    congestion_window: usize,
    bytes_in_flight: usize,
    slow_start_threshold: usize,
    recovery_start: Option<Instant>,
}

impl CongestionController {
    pub fn new(config: &TransportConfig) -> CongestionController {
        let (updates, _) = watch::channel(0);
        CongestionController {
            max_datagram_size: config.max_udp_payload,
            minimum_window: config.minimum_window_packets * config.max_udp_payload,
            loss_reduction_factor: config.loss_reduction_factor,
            state: Mutex::new(CongestionState {
                congestion_window: config.initial_window_packets * config.max_udp_payload,
                bytes_in_flight: 0,
                slow_start_threshold: usize::MAX,
                recovery_start: None,
            }),
            updates,
        }
    }

    pub fn can_send(&self, size: usize) -> bool {
        let state = self.state.lock().unwrap();
        state.bytes_in_flight + size <= state.congestion_window
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.state.lock().unwrap().bytes_in_flight
    }

    pub fn congestion_window(&self) -> usize {
        self.state.lock().unwrap().congestion_window
    }

    pub fn register_in_flight(&self, packet: &SentPacketInfo) {
        if !packet.in_flight {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.bytes_in_flight += packet.size;
        trace!("{} in flight after sending {}", state.bytes_in_flight, packet.id);
    }

    pub fn register_acked(&self, packets: &[SentPacketInfo]) {
        {
            let mut state = self.state.lock().unwrap();
            for packet in packets.iter().filter(|p| p.in_flight) {
                state.bytes_in_flight = state.bytes_in_flight.saturating_sub(packet.size);

                if state.recovery_start.map_or(true, |start| packet.send_time > start) {
                    if state.congestion_window < state.slow_start_threshold {
                        // slow start
                        state.congestion_window += packet.size;
                    } else {
                        // congestion avoidance
                        state.congestion_window +=
                            self.max_datagram_size * packet.size / state.congestion_window;
                    }
                }
            }
            debug!("acked {} packets: cwnd {}, {} in flight", packets.len(), state.congestion_window, state.bytes_in_flight);
        }
        self.signal();
    }

    pub fn on_lost(&self, packets: &[SentPacketInfo], now: Instant) {
        {
            let mut state = self.state.lock().unwrap();
            let mut enter_recovery = false;
            for packet in packets.iter().filter(|p| p.in_flight) {
                state.bytes_in_flight = state.bytes_in_flight.saturating_sub(packet.size);
                if state.recovery_start.map_or(true, |start| packet.send_time > start) {
                    enter_recovery = true;
                }
            }

            if enter_recovery {
                state.slow_start_threshold = max(
                    (state.congestion_window as f64 * self.loss_reduction_factor) as usize,
                    self.minimum_window,
                );
                state.congestion_window = state.slow_start_threshold;
                state.recovery_start = Some(now);
                debug!("loss: entering recovery with cwnd {}", state.congestion_window);
            }
        }
        self.signal();
    }

    /// Blocks until the next ack or loss event. Callers re-check
    ///  [can_send](Self::can_send) afterwards; the signal means "admission may
    ///  have changed", not "admission is granted".
    pub async fn wait_for_update(&self) {
        let mut updates = self.updates.subscribe();
        let _ = updates.changed().await;
    }

    /// For callers that interleave the wait with other events: mark the current
    ///  version seen via `borrow_and_update`, re-check state, then await
    ///  `changed()` - updates in between are not lost.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.updates.subscribe()
    }

    fn signal(&self) {
        self.updates.send_modify(|version| *version = version.wrapping_add(1));
    }

    #[cfg(test)]
    pub(crate) fn set_internals(&self, congestion_window: usize, bytes_in_flight: usize) {
        let mut state = self.state.lock().unwrap();
        state.congestion_window = congestion_window;
        state.bytes_in_flight = bytes_in_flight;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::Epoch;
    use crate::packet::PacketId;
    use rstest::rstest;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::runtime::Builder;

    fn controller() -> CongestionController {
        // cwnd starts at 10 * 1452 = 14520
        CongestionController::new(&TransportConfig::default_for_internet())
    }

    fn sent(number: u64, size: usize, send_time: Instant) -> SentPacketInfo {
        SentPacketInfo {
            id: PacketId { epoch: Epoch::Application, number },
            send_time,
            size,
            ack_eliciting: true,
            in_flight: true,
        }
    }

    fn ack_only(number: u64, size: usize, send_time: Instant) -> SentPacketInfo {
        SentPacketInfo {
            in_flight: false,
            ack_eliciting: false,
            ..sent(number, size, send_time)
        }
    }

    #[rstest]
    #[case::empty_window(0, 14520, true)]
    #[case::exactly_fits(13320, 1200, true)]
    #[case::exceeds_by_one(13321, 1200, false)]
    #[case::full(14520, 1, false)]
    fn test_can_send(#[case] in_flight: usize, #[case] size: usize, #[case] expected: bool) {
        let controller = controller();
        controller.set_internals(14520, in_flight);
        assert_eq!(controller.can_send(size), expected);
    }

    #[test]
    fn test_register_in_flight_counts_only_window_consuming_packets() {
        let controller = controller();
        let now = Instant::now();

        controller.register_in_flight(&sent(0, 1200, now));
        controller.register_in_flight(&ack_only(1, 30, now));
        controller.register_in_flight(&sent(2, 800, now));

        assert_eq!(controller.bytes_in_flight(), 2000);
    }

    #[test]
    fn test_slow_start_grows_window_by_acked_bytes() {
        let controller = controller();
        let now = Instant::now();

        controller.register_in_flight(&sent(0, 1200, now));
        controller.register_acked(&[sent(0, 1200, now)]);

        assert_eq!(controller.bytes_in_flight(), 0);
        assert_eq!(controller.congestion_window(), 14520 + 1200);
    }

    #[test]
    fn test_congestion_avoidance_grows_window_linearly() {
        let controller = controller();
        let now = Instant::now();

        // a loss puts the controller into congestion avoidance (cwnd == ssthresh)
        controller.register_in_flight(&sent(0, 1200, now));
        controller.on_lost(&[sent(0, 1200, now)], now);
        let cwnd_after_loss = controller.congestion_window();

        let later = now + Duration::from_millis(10);
        controller.register_in_flight(&sent(1, 1200, later));
        controller.register_acked(&[sent(1, 1200, later)]);

        assert_eq!(
            controller.congestion_window(),
            cwnd_after_loss + 1452 * 1200 / cwnd_after_loss
        );
    }

    #[test]
    fn test_loss_halves_window_and_starts_recovery() {
        let controller = controller();
        let now = Instant::now();

        controller.register_in_flight(&sent(0, 1200, now));
        controller.on_lost(&[sent(0, 1200, now)], now);

        assert_eq!(controller.bytes_in_flight(), 0);
        assert_eq!(controller.congestion_window(), 14520 / 2);
    }

    #[test]
    fn test_window_never_drops_below_minimum() {
        let controller = controller();
        let mut now = Instant::now();

        for number in 0..8 {
            now += Duration::from_millis(10);
            controller.register_in_flight(&sent(number, 1200, now));
            controller.on_lost(&[sent(number, 1200, now)], now);
        }

        assert_eq!(controller.congestion_window(), 2 * 1452);
    }

    #[test]
    fn test_losses_within_recovery_period_reduce_window_once() {
        let controller = controller();
        let send_time = Instant::now();
        let loss_time = send_time + Duration::from_millis(10);

        controller.register_in_flight(&sent(0, 1200, send_time));
        controller.register_in_flight(&sent(1, 1200, send_time));

        controller.on_lost(&[sent(0, 1200, send_time)], loss_time);
        let cwnd_after_first = controller.congestion_window();

        // the second lost packet was sent before recovery started
        controller.on_lost(&[sent(1, 1200, send_time)], loss_time + Duration::from_millis(1));

        assert_eq!(controller.congestion_window(), cwnd_after_first);
        assert_eq!(controller.bytes_in_flight(), 0);
    }

    #[test]
    fn test_acks_of_pre_recovery_packets_do_not_grow_window() {
        let controller = controller();
        let send_time = Instant::now();
        let loss_time = send_time + Duration::from_millis(10);

        controller.register_in_flight(&sent(0, 1200, send_time));
        controller.register_in_flight(&sent(1, 1200, send_time));
        controller.on_lost(&[sent(0, 1200, send_time)], loss_time);

        let cwnd_after_loss = controller.congestion_window();
        controller.register_acked(&[sent(1, 1200, send_time)]);

        assert_eq!(controller.congestion_window(), cwnd_after_loss);
        assert_eq!(controller.bytes_in_flight(), 0);
    }

    #[test]
    fn test_acked_packets_not_in_flight_leave_state_unchanged() {
        let controller = controller();
        let now = Instant::now();

        controller.register_acked(&[ack_only(0, 30, now)]);

        assert_eq!(controller.bytes_in_flight(), 0);
        assert_eq!(controller.congestion_window(), 14520);
    }

    #[test]
    fn test_wait_for_update_wakes_on_ack() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let controller = Arc::new(controller());
            let now = Instant::now();

            let waiter = {
                let controller = controller.clone();
                tokio::spawn(async move { controller.wait_for_update().await })
            };
            tokio::time::sleep(Duration::from_millis(1)).await;
            assert!(!waiter.is_finished());

            controller.register_acked(&[sent(0, 1200, now)]);
            waiter.await.unwrap();
        });
    }

    #[test]
    fn test_wait_for_update_wakes_on_loss() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let controller = Arc::new(controller());
            let now = Instant::now();

            let waiter = {
                let controller = controller.clone();
                tokio::spawn(async move { controller.wait_for_update().await })
            };
            tokio::time::sleep(Duration::from_millis(1)).await;
            assert!(!waiter.is_finished());

            controller.on_lost(&[sent(0, 1200, now)], now);
            waiter.await.unwrap();
        });
    }
}
