use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::time::Instant;

use crate::epoch::Epoch;
use crate::packet::SentPacketInfo;

/// Notification seam for the loss detector, which owns the PTO and loss timers
///  outside this crate. It learns about every sent packet and every processed
///  ack, and reports losses back through `Transmitter::on_lost`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LossDetection: Send + Sync + 'static {
    async fn on_packet_sent(&self, packet: SentPacketInfo);

    async fn on_ack_received(&self, epoch: Epoch, largest_acked: u64, receive_time: Instant);
}

/// For connections that run without loss recovery, e.g. during bring-up.
pub struct NoLossDetection;

#[async_trait]
impl LossDetection for NoLossDetection {
    async fn on_packet_sent(&self, _packet: SentPacketInfo) {}

    async fn on_ack_received(&self, _epoch: Epoch, _largest_acked: u64, _receive_time: Instant) {}
}
