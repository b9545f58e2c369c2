use bytes::{BufMut, Bytes, BytesMut};
use bytes_varint::VarIntSupportMut;
use std::time::Duration;

use crate::reassembly::StreamElement;

/// Protocol frames as the transmission core sees them: in-memory values that
///  classify a packet (ack-eliciting or not, window-consuming or not) and know
///  their own encoded representation. Decoding inbound frames happens in the
///  packet decode layer and is not part of this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// the given number of padding bytes
    Padding(usize),
    Ping,
    Ack(AckFrame),
    Crypto(CryptoFrame),
    Stream(StreamFrame),
    MaxData(u64),
}

impl Frame {
    /// A frame is ack-eliciting if the peer is obliged to acknowledge the packet
    ///  carrying it. Acks and padding are the exceptions: acknowledging them would
    ///  make every ack breed another.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(self, Frame::Ack(_) | Frame::Padding(_))
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Padding(len) => *len,
            Frame::Ping => 1,
            Frame::Ack(ack) => ack.encoded_len(),
            Frame::Crypto(crypto) => {
                1 + varint_len(crypto.offset)
                    + varint_len(crypto.data.len() as u64)
                    + crypto.data.len()
            }
            Frame::Stream(stream) => {
                1 + varint_len(stream.stream_id)
                    + varint_len(stream.offset)
                    + varint_len(stream.data.len() as u64)
                    + stream.data.len()
            }
            Frame::MaxData(limit) => 1 + varint_len(*limit),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            // a padding byte is a frame of its own, so N bytes are N frames
            Frame::Padding(len) => buf.put_bytes(0x00, *len),
            Frame::Ping => buf.put_u8(0x01),
            Frame::Ack(ack) => ack.ser(buf),
            Frame::Crypto(crypto) => {
                buf.put_u8(0x06);
                buf.put_u64_varint(crypto.offset);
                buf.put_usize_varint(crypto.data.len());
                buf.put_slice(&crypto.data);
            }
            Frame::Stream(stream) => {
                // base type with OFF and LEN bits always set, FIN bit as applicable
                let mut frame_type = 0x08 | 0x04 | 0x02;
                if stream.fin {
                    frame_type |= 0x01;
                }
                buf.put_u8(frame_type);
                buf.put_u64_varint(stream.stream_id);
                buf.put_u64_varint(stream.offset);
                buf.put_usize_varint(stream.data.len());
                buf.put_slice(&stream.data);
            }
            Frame::MaxData(limit) => {
                buf.put_u8(0x10);
                buf.put_u64_varint(*limit);
            }
        }
    }
}

/// A closed range `[low, high]` of acknowledged packet numbers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AckInterval {
    pub low: u64,
    pub high: u64,
}

/// An acknowledgement of received packet numbers: disjoint intervals in
///  descending order, plus the delay between receiving the largest acknowledged
///  packet and sending this frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    intervals: Vec<AckInterval>,
    ack_delay: Duration,
}

impl AckFrame {
    /// NB: `intervals` must be non-empty, disjoint and in descending order; the
    ///      ack tracker produces them that way, and ack processing relies on it.
    pub fn new(intervals: Vec<AckInterval>, ack_delay: Duration) -> AckFrame {
        assert!(!intervals.is_empty(), "ack frame must acknowledge at least one packet");
        debug_assert!(intervals.windows(2).all(|w| w[0].low > w[1].high + 1));
        debug_assert!(intervals.iter().all(|i| i.low <= i.high));

        AckFrame { intervals, ack_delay }
    }

    /// convenience for acknowledging a single packet number
    pub fn single(packet_number: u64, ack_delay: Duration) -> AckFrame {
        AckFrame::new(vec![AckInterval { low: packet_number, high: packet_number }], ack_delay)
    }

    pub fn largest_acknowledged(&self) -> u64 {
        self.intervals[0].high
    }

    pub fn ack_delay(&self) -> Duration {
        self.ack_delay
    }

    pub fn intervals(&self) -> &[AckInterval] {
        &self.intervals
    }

    /// all acknowledged packet numbers, in descending order
    pub fn acked_packet_numbers(&self) -> impl Iterator<Item = u64> + '_ {
        self.intervals.iter().flat_map(|i| (i.low..=i.high).rev())
    }

    fn encoded_len(&self) -> usize {
        let first = &self.intervals[0];
        let mut len = 1
            + varint_len(first.high)
            + varint_len(self.ack_delay.as_micros() as u64)
            + varint_len((self.intervals.len() - 1) as u64)
            + varint_len(first.high - first.low);

        for pair in self.intervals.windows(2) {
            let gap = pair[0].low - pair[1].high - 2;
            len += varint_len(gap) + varint_len(pair[1].high - pair[1].low);
        }
        len
    }

    fn ser(&self, buf: &mut BytesMut) {
        let first = &self.intervals[0];
        buf.put_u8(0x02);
        buf.put_u64_varint(first.high);
        buf.put_u64_varint(self.ack_delay.as_micros() as u64);
        buf.put_usize_varint(self.intervals.len() - 1);
        buf.put_u64_varint(first.high - first.low);

        for pair in self.intervals.windows(2) {
            buf.put_u64_varint(pair[0].low - pair[1].high - 2);
            buf.put_u64_varint(pair[1].high - pair[1].low);
        }
    }
}

/// A contiguous chunk of application stream data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: u64,
    pub offset: u64,
    pub data: Bytes,
    pub fin: bool,
}

impl StreamFrame {
    pub fn element(&self) -> StreamElement {
        StreamElement::new(self.offset, self.data.clone(), self.fin)
    }
}

/// A contiguous chunk of handshake data, carried outside any application stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoFrame {
    pub offset: u64,
    pub data: Bytes,
}

pub(crate) fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}
