use bytes::Bytes;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use std::time::Instant;

use crate::epoch::Epoch;
use crate::frame::{AckFrame, Frame};

/// Packet numbers are 62-bit unsigned integers, leaving the top bits for the
///  variable-length wire encoding.
pub const MAX_PACKET_NUMBER: u64 = (1 << 62) - 1;

/// Byte overhead a packet adds around its frames: first byte, connection id,
///  packet number and AEAD tag.
pub const PACKET_ENVELOPE_OVERHEAD: usize = 29;

/// Identity of a sent packet: epoch plus the packet number within that epoch's
///  number space. Ordered by epoch first, then number.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PacketId {
    pub epoch: Epoch,
    pub number: u64,
}

impl Display for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.epoch, self.number)
    }
}

/// An outgoing protocol packet as the transmitter handles it. The transmitter
///  never looks inside frames beyond classification; serialization and
///  encryption are the [PacketEncoder]'s business.
pub trait OutboundPacket: Send + Sync + Debug {
    fn epoch(&self) -> Epoch;

    fn frames(&self) -> &[Frame];

    /// The size of the encoded datagram, known before encoding. Admission
    ///  against the congestion window is decided on this value.
    fn encoded_size(&self) -> usize;

    fn is_ack_eliciting(&self) -> bool {
        self.frames().iter().any(|f| f.is_ack_eliciting())
    }

    /// In-flight packets consume congestion window. Packets carrying only acks
    ///  and padding do not, which is what keeps ack traffic and probes flowing
    ///  when the window is closed.
    fn is_in_flight(&self) -> bool {
        self.frames().iter().any(|f| !matches!(f, Frame::Ack(_) | Frame::Padding(_)))
    }
}

/// The standard [OutboundPacket]: an epoch and a list of frames.
#[derive(Debug)]
pub struct FramePacket {
    epoch: Epoch,
    frames: Vec<Frame>,
    in_flight: bool,
}

impl FramePacket {
    pub fn new(epoch: Epoch, frames: Vec<Frame>) -> FramePacket {
        let in_flight = frames.iter().any(|f| !matches!(f, Frame::Ack(_) | Frame::Padding(_)));
        FramePacket { epoch, frames, in_flight }
    }

    /// a packet carrying nothing but an ack - neither ack-eliciting nor in-flight
    pub fn ack_only(epoch: Epoch, ack: AckFrame) -> FramePacket {
        FramePacket {
            epoch,
            frames: vec![Frame::Ack(ack)],
            in_flight: false,
        }
    }

    /// A probe to make a silent peer respond: ack-eliciting, but exempt from the
    ///  congestion window so it can escape a blocked sender.
    pub fn probe(epoch: Epoch) -> FramePacket {
        FramePacket {
            epoch,
            frames: vec![Frame::Ping],
            in_flight: false,
        }
    }
}

impl OutboundPacket for FramePacket {
    fn epoch(&self) -> Epoch {
        self.epoch
    }

    fn frames(&self) -> &[Frame] {
        &self.frames
    }

    fn encoded_size(&self) -> usize {
        PACKET_ENVELOPE_OVERHEAD + self.frames.iter().map(Frame::encoded_len).sum::<usize>()
    }

    fn is_in_flight(&self) -> bool {
        self.in_flight
    }
}

/// Keying material installed when the handshake layer has derived secrets.
///  Opaque to the transmission core, interpreted by the [PacketEncoder].
#[derive(Clone)]
pub struct ConnectionKeys {
    secret: Bytes,
}

impl ConnectionKeys {
    pub fn new(secret: impl Into<Bytes>) -> ConnectionKeys {
        ConnectionKeys { secret: secret.into() }
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }
}

impl Debug for ConnectionKeys {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // never log keying material
        write!(f, "ConnectionKeys(..)")
    }
}

/// The framing / encryption collaborator: turns a packet plus its assigned
///  packet number into datagram bytes.
pub trait PacketEncoder: Send + Sync + 'static {
    fn encode(
        &self,
        packet: &dyn OutboundPacket,
        packet_number: u64,
        keys: &ConnectionKeys,
    ) -> anyhow::Result<Bytes>;
}

/// Copyable metadata about a sent packet, handed to congestion control and
///  loss detection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SentPacketInfo {
    pub id: PacketId,
    pub send_time: Instant,
    pub size: usize,
    pub ack_eliciting: bool,
    pub in_flight: bool,
}

/// How a sent packet left the system.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketOutcome {
    Acked,
    Lost,
}

/// Per-packet settlement callback; invoked exactly once, when the packet is
///  acknowledged or declared lost.
pub type OnSettled = Box<dyn FnOnce(PacketOutcome) + Send + 'static>;

/// What the decode layer reports about an inbound packet so acks can be
///  scheduled for it.
#[derive(Copy, Clone, Debug)]
pub struct ReceivedPacket {
    pub epoch: Epoch,
    pub packet_number: u64,
    pub ack_eliciting: bool,
}

/// A sent packet while it awaits acknowledgement or a loss declaration: held
///  in the transmitter's per-epoch log from the moment the datagram is handed
///  to the sink.
pub(crate) struct InFlightRecord {
    pub id: PacketId,
    pub send_time: Instant,
    pub size: usize,
    pub ack_eliciting: bool,
    pub in_flight: bool,
    pub packet: Arc<dyn OutboundPacket>,
    pub label: String,
    pub on_settled: Option<OnSettled>,
}

impl InFlightRecord {
    pub fn info(&self) -> SentPacketInfo {
        SentPacketInfo {
            id: self.id,
            send_time: self.send_time,
            size: self.size,
            ack_eliciting: self.ack_eliciting,
            in_flight: self.in_flight,
        }
    }

    pub fn settle(mut self, outcome: PacketOutcome) {
        if let Some(on_settled) = self.on_settled.take() {
            on_settled(outcome);
        }
    }
}
