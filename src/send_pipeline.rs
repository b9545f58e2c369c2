use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::trace;

use crate::packet::{ConnectionKeys, OutboundPacket, PacketEncoder};

/// Sends one datagram to the peer. Abstracted to keep the I/O out of the
///  transmitter for testing; the production implementation is a connected
///  [UdpSocket].
///
/// A send error is terminal for the connection - the sender loop stops on it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSink: Send + Sync + 'static {
    async fn send_datagram(&self, datagram: &[u8]) -> anyhow::Result<()>;
}

#[async_trait]
impl DatagramSink for UdpSocket {
    async fn send_datagram(&self, datagram: &[u8]) -> anyhow::Result<()> {
        let sent = self.send(datagram).await?;
        if sent != datagram.len() {
            bail!("short datagram write: {} of {} bytes", sent, datagram.len());
        }
        Ok(())
    }
}

/// Encoding and emission as one step: the encoder collaborator turns a packet
///  and its assigned number into datagram bytes, the sink puts them on the wire.
pub struct SendPipeline {
    sink: Arc<dyn DatagramSink>,
    encoder: Arc<dyn PacketEncoder>,
}

impl SendPipeline {
    pub fn new(sink: Arc<dyn DatagramSink>, encoder: Arc<dyn PacketEncoder>) -> SendPipeline {
        SendPipeline { sink, encoder }
    }

    /// Returns the emitted datagram's length - the size that counts against the
    ///  congestion window for in-flight packets.
    pub async fn encode_and_send(
        &self,
        packet: &dyn OutboundPacket,
        packet_number: u64,
        keys: &ConnectionKeys,
    ) -> anyhow::Result<usize> {
        let datagram = self.encoder.encode(packet, packet_number, keys)?;
        trace!("sending datagram of {} bytes", datagram.len());
        self.sink.send_datagram(&datagram).await?;
        Ok(datagram.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::Epoch;
    use crate::frame::Frame;
    use crate::packet::FramePacket;
    use bytes::Bytes;
    use tokio::runtime::Builder;

    struct FixedEncoder(&'static [u8]);

    impl PacketEncoder for FixedEncoder {
        fn encode(
            &self,
            _packet: &dyn OutboundPacket,
            _packet_number: u64,
            _keys: &ConnectionKeys,
        ) -> anyhow::Result<Bytes> {
            Ok(Bytes::from_static(self.0))
        }
    }

    struct FailingEncoder;

    impl PacketEncoder for FailingEncoder {
        fn encode(
            &self,
            _packet: &dyn OutboundPacket,
            _packet_number: u64,
            _keys: &ConnectionKeys,
        ) -> anyhow::Result<Bytes> {
            bail!("no keys for this epoch");
        }
    }

    #[test]
    fn test_encoded_bytes_reach_the_sink() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut sink = MockDatagramSink::new();
            sink.expect_send_datagram()
                .once()
                .withf(|datagram| datagram == b"datagram bytes")
                .returning(|_| Ok(()));

            let pipeline = SendPipeline::new(
                Arc::new(sink),
                Arc::new(FixedEncoder(b"datagram bytes")),
            );

            let packet = FramePacket::new(Epoch::Application, vec![Frame::Ping]);
            let sent = pipeline
                .encode_and_send(&packet, 0, &ConnectionKeys::new(Bytes::new()))
                .await
                .unwrap();
            assert_eq!(sent, b"datagram bytes".len());
        });
    }

    #[test]
    fn test_encoder_failure_propagates_without_touching_the_sink() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut sink = MockDatagramSink::new();
            sink.expect_send_datagram().never();

            let pipeline = SendPipeline::new(Arc::new(sink), Arc::new(FailingEncoder));

            let packet = FramePacket::new(Epoch::Application, vec![Frame::Ping]);
            let result = pipeline
                .encode_and_send(&packet, 0, &ConnectionKeys::new(Bytes::new()))
                .await;
            assert!(result.is_err());
        });
    }

    #[test]
    fn test_sink_failure_propagates() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut sink = MockDatagramSink::new();
            sink.expect_send_datagram()
                .once()
                .returning(|_| bail!("network unreachable"));

            let pipeline = SendPipeline::new(
                Arc::new(sink),
                Arc::new(FixedEncoder(b"x")),
            );

            let packet = FramePacket::new(Epoch::Application, vec![Frame::Ping]);
            let result = pipeline
                .encode_and_send(&packet, 0, &ConnectionKeys::new(Bytes::new()))
                .await;
            assert!(result.is_err());
        });
    }
}
