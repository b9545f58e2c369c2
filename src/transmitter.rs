use anyhow::bail;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;

use crate::ack_tracker::AckTracker;
use crate::clock::Clock;
use crate::config::TransportConfig;
use crate::congestion::CongestionController;
use crate::epoch::{Epoch, EpochMap};
use crate::frame::{AckFrame, Frame};
use crate::loss_detection::LossDetection;
use crate::packet::{
    ConnectionKeys, FramePacket, InFlightRecord, OnSettled, OutboundPacket, PacketEncoder,
    PacketId, PacketOutcome, ReceivedPacket, SentPacketInfo, MAX_PACKET_NUMBER,
};
use crate::rtt::RttEstimator;
use crate::send_pipeline::{DatagramSink, SendPipeline};

/// Lifecycle of the sender loop. `Stopped` is reached through an orderly
///  [shutdown](Transmitter::shutdown) or through a terminal send failure; the
///  state watch is the single signal the application observes for both.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TransmitterState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// The sending half of a connection.
///
/// Application and control layers [enqueue](Self::enqueue) packets; one spawned
///  loop dequeues them, asks the congestion controller for admission, assigns
///  the packet number, encodes and emits the datagram and logs it as in-flight.
///  The receive path feeds acks back through [process_ack](Self::process_ack),
///  which drives the RTT estimator, retires in-flight records (invoking their
///  settlement callback) and updates the congestion window.
///
/// Ack-only packets and probes travel on a separate urgent lane that overtakes
///  packets waiting for the congestion window, so ack traffic keeps flowing
///  when the window is closed.
pub struct Transmitter {
    shared: Arc<TransmitterShared>,
    queue_tx: mpsc::UnboundedSender<SendRequest>,
    urgent_tx: mpsc::UnboundedSender<SendRequest>,
    receivers: StdMutex<Option<QueueReceivers>>,
    loop_handle: StdMutex<Option<JoinHandle<()>>>,
}

type QueueReceivers = (
    mpsc::UnboundedReceiver<SendRequest>,
    mpsc::UnboundedReceiver<SendRequest>,
);

struct SendRequest {
    work: SendWork,
    label: String,
    on_settled: Option<OnSettled>,
}

enum SendWork {
    Packet(Arc<dyn OutboundPacket>),
    /// synthesize an ack-only packet at emission time, when its packet number
    ///  is known
    AckOnly(Epoch),
}

#[derive(Default)]
struct EpochCounters {
    sent: AtomicU64,
    acked: AtomicU64,
    lost: AtomicU64,
}

struct TransmitterShared {
    config: Arc<TransportConfig>,
    pipeline: SendPipeline,
    clock: Arc<dyn Clock>,
    loss_detection: Arc<dyn LossDetection>,
    congestion: Arc<CongestionController>,
    rtt: RwLock<RttEstimator>,
    sent_log: EpochMap<Mutex<BTreeMap<u64, InFlightRecord>>>,
    ack_trackers: EpochMap<Mutex<AckTracker>>,
    counters: EpochMap<EpochCounters>,
    state: watch::Sender<TransmitterState>,
    fatal: StdMutex<Option<String>>,
}

impl Transmitter {
    pub fn new(
        config: Arc<TransportConfig>,
        sink: Arc<dyn DatagramSink>,
        encoder: Arc<dyn PacketEncoder>,
        clock: Arc<dyn Clock>,
        loss_detection: Arc<dyn LossDetection>,
    ) -> anyhow::Result<Transmitter> {
        config.validate()?;

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (urgent_tx, urgent_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(TransmitterState::Idle);

        let shared = TransmitterShared {
            pipeline: SendPipeline::new(sink, encoder),
            clock,
            loss_detection,
            congestion: Arc::new(CongestionController::new(&config)),
            rtt: RwLock::new(RttEstimator::new(config.initial_rtt, config.rtt_granularity)),
            sent_log: EpochMap::default(),
            ack_trackers: EpochMap::default(),
            counters: EpochMap::default(),
            state,
            fatal: StdMutex::new(None),
            config,
        };

        Ok(Transmitter {
            shared: Arc::new(shared),
            queue_tx,
            urgent_tx,
            receivers: StdMutex::new(Some((queue_rx, urgent_rx))),
            loop_handle: StdMutex::new(None),
        })
    }

    /// Start the sender loop once handshake secrets are available. Packets
    ///  enqueued before this point stay queued and are sent afterwards.
    ///
    /// NB: must be called from within a tokio runtime.
    pub fn start(&self, keys: ConnectionKeys) -> anyhow::Result<()> {
        if *self.shared.state.borrow() != TransmitterState::Idle {
            bail!("transmitter can only be started from idle");
        }
        let Some((queue_rx, urgent_rx)) = self.receivers.lock().unwrap().take() else {
            bail!("transmitter already started");
        };

        self.shared.state.send_replace(TransmitterState::Running);
        let shared = self.shared.clone();
        let handle = tokio::spawn(TransmitterShared::run(shared, queue_rx, urgent_rx, keys));
        *self.loop_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Append a packet to the waiting queue. Rejected once shutdown has begun.
    pub fn enqueue(
        &self,
        packet: Arc<dyn OutboundPacket>,
        label: impl Into<String>,
        on_settled: Option<OnSettled>,
    ) -> anyhow::Result<()> {
        self.ensure_accepting()?;

        if packet.encoded_size() > self.shared.config.max_udp_payload {
            bail!(
                "packet of {} bytes exceeds the configured payload size of {}",
                packet.encoded_size(), self.shared.config.max_udp_payload
            );
        }

        let label = label.into();
        debug!("queueing packet ({})", label);
        if self.queue_tx.send(SendRequest { work: SendWork::Packet(packet), label, on_settled }).is_err() {
            bail!("transmitter is shut down");
        }
        Ok(())
    }

    /// Dispatch a probe to make a silent peer respond. Probes bypass the
    ///  congestion window and overtake waiting packets.
    pub fn send_probe(&self) -> anyhow::Result<()> {
        self.ensure_accepting()?;

        debug!("queueing probe");
        let request = SendRequest {
            work: SendWork::Packet(Arc::new(FramePacket::probe(Epoch::Application))),
            label: "probe".to_string(),
            on_settled: None,
        };
        if self.urgent_tx.send(request).is_err() {
            bail!("transmitter is shut down");
        }
        Ok(())
    }

    /// Entry point for frames from the receive path. Anything but an ack frame
    ///  here is a bug in the frame dispatcher.
    pub async fn process(&self, frame: &Frame, epoch: Epoch, receive_time: Instant) {
        match frame {
            Frame::Ack(ack) => self.process_ack(ack, epoch, receive_time).await,
            other => {
                debug_assert!(false, "non-ack frame routed to ack processing: {:?}", other);
                error!("non-ack frame routed to ack processing - dropping: {:?}", other);
            }
        }
    }

    /// Process an acknowledgement received at `receive_time`: take an RTT
    ///  sample from the largest acked packet, retire every acked in-flight
    ///  record (settling it as acked), and grow the congestion window.
    ///
    /// Acks for unknown packet numbers are ignored - they are duplicates or
    ///  refer to packets already retired. An ack delivered under the wrong
    ///  epoch matches nothing in that epoch's log and is thereby ignored too.
    pub async fn process_ack(&self, ack: &AckFrame, epoch: Epoch, receive_time: Instant) {
        let shared = &self.shared;
        let largest = ack.largest_acknowledged();

        let mut retired: Vec<SentPacketInfo> = Vec::new();
        let mut retired_numbers: Vec<u64> = Vec::new();
        {
            let mut log = shared.sent_log[epoch].lock().await;

            if let Some(record) = log.get(&largest) {
                if record.ack_eliciting {
                    shared.rtt.write().await
                        .add_sample(receive_time, record.send_time, ack.ack_delay());
                }
            }

            for number in ack.acked_packet_numbers() {
                match log.remove(&number) {
                    Some(record) => {
                        trace!("ack received for {} ({})", record.id, record.label);
                        shared.counters[epoch].acked.fetch_add(1, Relaxed);
                        retired.push(record.info());
                        retired_numbers.push(number);
                        record.settle(PacketOutcome::Acked);
                    }
                    None => trace!("ack for unknown packet {}#{} - ignoring", epoch, number),
                }
            }
        }

        if !retired_numbers.is_empty() {
            // if any of our acked packets carried an ack frame, the peer now
            //  knows what it covered and the tracker can retire that state
            let mut tracker = shared.ack_trackers[epoch].lock().await;
            for &number in &retired_numbers {
                tracker.on_packet_acked(number);
            }
        }

        shared.loss_detection.on_ack_received(epoch, largest, receive_time).await;

        if !retired.is_empty() {
            shared.congestion.register_acked(&retired);
        }
    }

    /// Loss detection declared these packets lost: retire their records
    ///  (settling them as lost) and let the congestion controller enter
    ///  recovery.
    pub async fn on_lost(&self, lost: &[PacketId]) {
        let shared = &self.shared;

        let mut infos = Vec::new();
        for epoch in Epoch::ALL {
            if !lost.iter().any(|id| id.epoch == epoch) {
                continue;
            }
            let mut log = shared.sent_log[epoch].lock().await;
            for id in lost.iter().filter(|id| id.epoch == epoch) {
                if let Some(record) = log.remove(&id.number) {
                    debug!("packet {} declared lost ({})", record.id, record.label);
                    shared.counters[epoch].lost.fetch_add(1, Relaxed);
                    infos.push(record.info());
                    record.settle(PacketOutcome::Lost);
                }
            }
        }

        if !infos.is_empty() {
            shared.congestion.on_lost(&infos, shared.clock.now());
        }
    }

    /// Observation hook for the receive path: record an inbound packet so an
    ///  ack can be scheduled for it.
    pub async fn packet_received(&self, packet: &ReceivedPacket) {
        self.shared.ack_trackers[packet.epoch].lock().await
            .on_packet_received(packet.packet_number, packet.ack_eliciting, self.shared.clock.now());
    }

    /// The receive path finished processing an inbound packet. If new acks are
    ///  pending for the epoch, an ack-only packet is scheduled on the urgent
    ///  lane - interrupting a sender that waits for the congestion window, so
    ///  acks are not delayed by backpressure.
    pub async fn packet_processed(&self, epoch: Epoch) {
        if !self.shared.ack_trackers[epoch].lock().await.has_new_ack() {
            return;
        }

        trace!("scheduling ack-only packet for epoch {}", epoch);
        let request = SendRequest {
            work: SendWork::AckOnly(epoch),
            label: "ack".to_string(),
            on_settled: None,
        };
        // a closed channel means the loop is gone; the final ack is moot then
        let _ = self.urgent_tx.send(request);
    }

    /// Orderly shutdown: interrupts the sender loop at its suspension points,
    ///  settles queued-but-unsent packets as lost and waits for the loop to
    ///  finish.
    pub async fn shutdown(&self) {
        let current_state = *self.shared.state.borrow();
        match current_state {
            TransmitterState::Idle => {
                self.shared.state.send_replace(TransmitterState::Stopped);
                return;
            }
            TransmitterState::Running => {
                info!("shutting down transmitter");
                self.shared.state.send_replace(TransmitterState::Stopping);
            }
            TransmitterState::Stopping | TransmitterState::Stopped => {}
        }

        let mut state_rx = self.shared.state.subscribe();
        let _ = state_rx.wait_for(|state| *state == TransmitterState::Stopped).await;
    }

    pub fn state(&self) -> TransmitterState {
        *self.shared.state.borrow()
    }

    /// The state watch doubles as the terminal signal: `Stopped` without a
    ///  prior `shutdown` call means the connection died on a send error; see
    ///  [fatal_error](Self::fatal_error).
    pub fn watch_state(&self) -> watch::Receiver<TransmitterState> {
        self.shared.state.subscribe()
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.shared.fatal.lock().unwrap().clone()
    }

    pub fn congestion_controller(&self) -> Arc<CongestionController> {
        self.shared.congestion.clone()
    }

    pub async fn smoothed_rtt(&self) -> Duration {
        self.shared.rtt.read().await.smoothed_rtt()
    }

    /// base value for the external loss detector's probe timeout
    pub async fn pto_base(&self) -> Duration {
        self.shared.rtt.read().await.pto_base()
    }

    fn ensure_accepting(&self) -> anyhow::Result<()> {
        match *self.shared.state.borrow() {
            TransmitterState::Idle | TransmitterState::Running => Ok(()),
            state => bail!("transmitter does not accept packets in state {:?}", state),
        }
    }
}

impl Drop for Transmitter {
    fn drop(&mut self) {
        if let Some(handle) = self.loop_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl TransmitterShared {
    async fn run(
        shared: Arc<TransmitterShared>,
        mut queue_rx: mpsc::UnboundedReceiver<SendRequest>,
        mut urgent_rx: mpsc::UnboundedReceiver<SendRequest>,
        keys: ConnectionKeys,
    ) {
        info!("sender loop starting");
        let result = shared.sender_loop(&mut queue_rx, &mut urgent_rx, &keys).await;
        match &result {
            Ok(()) => info!("sender loop stopping"),
            Err(e) => {
                error!("I/O error while sending datagrams - terminating connection: {:#}", e);
                *shared.fatal.lock().unwrap() = Some(format!("{:#}", e));
            }
        }

        // settle everything that never made it onto the wire
        queue_rx.close();
        urgent_rx.close();
        while let Ok(request) = urgent_rx.try_recv() {
            Self::settle_unsent(request);
        }
        while let Ok(request) = queue_rx.try_recv() {
            Self::settle_unsent(request);
        }

        shared.log_statistics().await;
        shared.state.send_replace(TransmitterState::Stopped);
    }

    async fn sender_loop(
        &self,
        queue_rx: &mut mpsc::UnboundedReceiver<SendRequest>,
        urgent_rx: &mut mpsc::UnboundedReceiver<SendRequest>,
        keys: &ConnectionKeys,
    ) -> anyhow::Result<()> {
        let mut next_packet_number: EpochMap<u64> = EpochMap::default();
        let mut congestion_updates = self.congestion.subscribe();
        let mut state_rx = self.state.subscribe();

        loop {
            let request = tokio::select! {
                biased;
                _ = state_rx.wait_for(|state| *state == TransmitterState::Stopping) => return Ok(()),
                Some(request) = urgent_rx.recv() => request,
                Some(request) = queue_rx.recv() => request,
            };

            let request = match self
                .admit(&mut next_packet_number, &mut congestion_updates, &mut state_rx, urgent_rx, keys, request)
                .await?
            {
                Some(request) => request,
                None => return Ok(()),
            };

            self.emit(&mut next_packet_number, keys, request).await?;
        }
    }

    /// Wait until the congestion controller admits the packet. Urgent work
    ///  arriving in the meantime is exempt from the window and emitted
    ///  immediately, ahead of the deferred packet. Returns None when shutdown
    ///  interrupted the wait (the packet is settled as lost then).
    async fn admit(
        &self,
        next_packet_number: &mut EpochMap<u64>,
        congestion_updates: &mut watch::Receiver<u64>,
        state_rx: &mut watch::Receiver<TransmitterState>,
        urgent_rx: &mut mpsc::UnboundedReceiver<SendRequest>,
        keys: &ConnectionKeys,
        request: SendRequest,
    ) -> anyhow::Result<Option<SendRequest>> {
        let (in_flight, size) = match &request.work {
            SendWork::Packet(packet) => (packet.is_in_flight(), packet.encoded_size()),
            SendWork::AckOnly(_) => (false, 0),
        };
        if !in_flight {
            return Ok(Some(request));
        }

        let mut was_blocked = false;
        loop {
            // mark the current version seen *before* checking, so an update
            //  between the check and the wait below is not lost
            congestion_updates.borrow_and_update();
            if self.congestion.can_send(size) {
                break;
            }
            was_blocked = true;
            trace!("congestion window full ({} bytes in flight), deferring packet ({})", self.congestion.bytes_in_flight(), request.label);

            let mut pending_urgent: Option<SendRequest> = None;
            tokio::select! {
                biased;
                _ = state_rx.wait_for(|state| *state == TransmitterState::Stopping) => {
                    Self::settle_unsent(request);
                    return Ok(None);
                }
                Some(urgent) = urgent_rx.recv() => {
                    pending_urgent = Some(urgent);
                }
                _ = congestion_updates.changed() => {}
            }
            if let Some(urgent) = pending_urgent {
                if let Err(e) = self.emit(next_packet_number, keys, urgent).await {
                    Self::settle_unsent(request);
                    return Err(e);
                }
            }
        }

        if was_blocked {
            debug!("congestion window reopened, sending deferred packet ({})", request.label);
        }
        Ok(Some(request))
    }

    async fn emit(
        &self,
        next_packet_number: &mut EpochMap<u64>,
        keys: &ConnectionKeys,
        request: SendRequest,
    ) -> anyhow::Result<()> {
        let SendRequest { work, label, on_settled } = request;

        let (epoch, packet): (Epoch, Arc<dyn OutboundPacket>) = match work {
            SendWork::Packet(packet) => (packet.epoch(), packet),
            SendWork::AckOnly(epoch) => {
                let packet_number = next_packet_number[epoch];
                let ack = self.ack_trackers[epoch].lock().await
                    .generate_ack(packet_number, self.clock.now());
                match ack {
                    Some(frame) => (epoch, Arc::new(FramePacket::ack_only(epoch, frame)) as Arc<dyn OutboundPacket>),
                    None => {
                        trace!("nothing to acknowledge for epoch {} - skipping ack-only packet", epoch);
                        return Ok(());
                    }
                }
            }
        };

        let packet_number = next_packet_number[epoch];
        debug_assert!(packet_number <= MAX_PACKET_NUMBER);

        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "packet_send", ?correlation_id);

        let send_time = self.clock.now();
        let size = match self.pipeline
            .encode_and_send(packet.as_ref(), packet_number, keys)
            .instrument(span)
            .await
        {
            Ok(size) => size,
            Err(e) => {
                if let Some(on_settled) = on_settled {
                    on_settled(PacketOutcome::Lost);
                }
                return Err(e);
            }
        };

        // packet numbers are only consumed by packets actually emitted
        next_packet_number[epoch] = packet_number + 1;

        let id = PacketId { epoch, number: packet_number };
        debug!("packet sent ({}), pn {}, {} bytes", label, id, size);

        let record = InFlightRecord {
            id,
            send_time,
            size,
            ack_eliciting: packet.is_ack_eliciting(),
            in_flight: packet.is_in_flight(),
            packet,
            label,
            on_settled,
        };
        let info = record.info();

        self.sent_log[epoch].lock().await.insert(packet_number, record);
        self.counters[epoch].sent.fetch_add(1, Relaxed);
        self.congestion.register_in_flight(&info);
        self.loss_detection.on_packet_sent(info).await;
        Ok(())
    }

    fn settle_unsent(request: SendRequest) {
        debug!("packet ({}) was never sent - settling as lost", request.label);
        if let Some(on_settled) = request.on_settled {
            on_settled(PacketOutcome::Lost);
        }
    }

    async fn log_statistics(&self) {
        for (epoch, log) in self.sent_log.iter() {
            let log = log.lock().await;
            let counters = &self.counters[epoch];
            info!(
                "acknowledgement statistics for epoch {}: {} sent, {} acked, {} lost, {} outstanding",
                epoch,
                counters.sent.load(Relaxed),
                counters.acked.load(Relaxed),
                counters.lost.load(Relaxed),
                log.len()
            );
            for record in log.values() {
                debug!("  unacknowledged: {} ({}) {:?}", record.id, record.label, record.packet);
            }
        }
    }
}
