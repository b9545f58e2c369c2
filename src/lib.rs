//! Client-side transmission core for a connection-oriented, multiplexed,
//!  encrypted datagram transport.
//!
//! This crate owns the hard middle of such a client: everything between
//!  "the application has frames to send" and "bytes were handed to the wire",
//!  plus the receive-side bookkeeping that feeds back into sending.
//!
//! ## Sending
//!
//! Packets are queued with the [Transmitter](transmitter::Transmitter). One
//!  spawned loop dequeues them, asks the
//!  [CongestionController](congestion::CongestionController) for admission,
//!  assigns the per-epoch packet number, has the
//!  [PacketEncoder](packet::PacketEncoder) collaborator produce the datagram
//!  and emits it through the [DatagramSink](send_pipeline::DatagramSink). Sent
//!  packets are logged as in-flight until an acknowledgement retires them or
//!  external loss detection declares them lost; either way the packet's
//!  settlement callback fires exactly once.
//!
//! Packet numbers are independent per [Epoch](epoch::Epoch) - the
//!  cryptographic phase a packet belongs to - and strictly increasing within
//!  one: a number is only consumed by a packet that actually went out.
//!
//! Packets carrying only acks and padding do not count against the congestion
//!  window. They travel on an urgent lane that interrupts a sender waiting for
//!  the window, which is what keeps acknowledgements and probes flowing when
//!  the path is congested.
//!
//! ## Acknowledgements, both directions
//!
//! Inbound acks drive the [RttEstimator](rtt::RttEstimator) (smoothed RTT,
//!  variance, minimum) and the congestion window, and retire in-flight
//!  records. In the other direction the [AckTracker](ack_tracker::AckTracker)
//!  records every ack-eliciting packet we receive and produces compact ack
//!  ranges on demand; once the peer acknowledges one of our ack-bearing
//!  packets, the state that ack covered is dropped.
//!
//! ## Stream reassembly
//!
//! Inbound stream data arrives as arbitrarily overlapping, out-of-order byte
//!  ranges. The [ReassemblyBuffer](reassembly::ReassemblyBuffer) buffers them
//!  per stream and hands the application the gap-free prefix.
//!
//! ## Out of scope
//!
//! The handshake and key derivation, packet and frame wire parsing,
//!  encryption, the request/response layer, socket management and loss
//!  detection timers live outside this crate, behind the collaborator traits
//!  in [packet], [send_pipeline], [clock] and [loss_detection].

pub mod ack_tracker;
pub mod clock;
pub mod config;
pub mod congestion;
pub mod epoch;
pub mod frame;
pub mod loss_detection;
pub mod packet;
pub mod reassembly;
pub mod rtt;
pub mod send_pipeline;
pub mod transmitter;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
