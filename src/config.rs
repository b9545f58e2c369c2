use anyhow::bail;
use std::time::Duration;

/// Tuning knobs for the transmission core. All window sizes are expressed in
///  whole datagrams and converted to bytes against `max_udp_payload`.
pub struct TransportConfig {
    /// This is the UDP payload size the transport assumes end-to-end. Packets are
    ///  never fragmented, so this size must be supported on all routes to the peer.
    ///
    /// With full Ethernet frames and no optional IP headers this is
    ///  `1500 - 20 - 8 = 1472` for IPV4 and `1500 - 40 - 8 = 1452` for IPV6.
    ///  Choosing it too big causes packets to be dropped silently on some routes,
    ///  choosing it too small wastes bandwidth.
    pub max_udp_payload: usize,

    /// Initial congestion window, in packets of `max_udp_payload` bytes.
    pub initial_window_packets: usize,

    /// The congestion window is never reduced below this many packets, so the
    ///  connection can always make some progress after heavy loss.
    pub minimum_window_packets: usize,

    /// Multiplier applied to the congestion window when entering recovery.
    pub loss_reduction_factor: f64,

    /// Assumed round-trip time before the first RTT sample arrives. This seeds
    ///  the smoothed RTT and (halved) the RTT variance.
    pub initial_rtt: Duration,

    /// Lower bound for timer calculations derived from RTT variance; variance
    ///  below this granularity is indistinguishable from scheduling noise.
    pub rtt_granularity: Duration,

    /// Upper bound for bytes buffered per stream while waiting for gaps to be
    ///  filled. Adding data beyond this bound is reported as backpressure rather
    ///  than silently discarded.
    pub max_reassembly_bytes_per_stream: usize,
}

impl TransportConfig {
    /// Conservative defaults for traffic crossing the open internet: IPV6-safe
    ///  payload size, RFC-style window parameters.
    pub fn default_for_internet() -> TransportConfig {
        TransportConfig {
            max_udp_payload: 1452,
            initial_window_packets: 10,
            minimum_window_packets: 2,
            loss_reduction_factor: 0.5,
            initial_rtt: Duration::from_millis(100),
            rtt_granularity: Duration::from_millis(1),
            max_reassembly_bytes_per_stream: 16 * 1024 * 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_udp_payload < 100 {
            bail!("UDP payload size is too small");
        }
        if self.minimum_window_packets == 0 {
            bail!("minimum congestion window must be at least one packet");
        }
        if self.initial_window_packets < self.minimum_window_packets {
            bail!("initial congestion window is below the minimum window");
        }
        if !(0.0 < self.loss_reduction_factor && self.loss_reduction_factor < 1.0) {
            bail!("loss reduction factor must be strictly between 0 and 1");
        }
        if self.max_reassembly_bytes_per_stream < self.max_udp_payload {
            bail!("reassembly buffer must hold at least one packet");
        }
        Ok(())
    }
}
