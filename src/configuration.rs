use crate::rate_control::{CongestionControl, RateControl};
use std::time::Duration;
use tokio::io::{Error, ErrorKind, Result};

const DEFAULT_MSS: u32 = 1500;
const DEFAULT_WINDOW_SIZE: u32 = 8192;
const DEFAULT_UDT_BUF_SIZE: u32 = 8192;
const DEFAULT_UDP_BUF_SIZE: usize = 8_000_000;
const UDT_VERSION: u32 = 4;

/// Builds the congestion controller of a connection from its negotiated
/// window size (packets) and the maintenance interval.
pub type CongestionControlFactory = fn(u32, Duration) -> Box<dyn CongestionControl>;

fn default_congestion_control(max_window_size: u32, syn_interval: Duration) -> Box<dyn CongestionControl> {
    Box::new(RateControl::new(max_window_size, syn_interval))
}

/// Lower bound accepted by `set_timeout`.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Options for UDT protocol
#[derive(Debug, Clone)]
pub struct UdtConfiguration {
    /// Packet size: the optimal size is the network MTU size. The default value is 1500 bytes.
    /// A UDT connection will choose the smaller value of the MSS between the two peer sides.
    pub mss: u32,
    /// Maximum window size (nb of packets). Negotiated with the peer, the smaller wins.
    /// Default: 8192
    pub flight_flag_size: u32,
    /// Size of temporary storage for packets to receive (nb of packets)
    pub rcv_buf_size: u32,
    /// UDT uses UDP as the data channel, so the UDP buffer size may affect the performance.
    /// The sending buffer size is applied on the UDP socket. The actual value used
    /// by the kernel is bounded by "net.core.wmem_max".
    pub udp_snd_buf_size: usize,
    /// UDT uses UDP as the data channel, so the UDP buffer size may affect the performance.
    /// The receiving buffer size is applied on the UDP socket. The actual value used
    /// by the kernel is bounded by "net.core.rmem_max".
    pub udp_rcv_buf_size: usize,
    /// Whether SO_REUSEPORT option should be set on the UDP socket (unix only).
    /// Default: false.
    pub udp_reuse_port: bool,
    /// How long a client keeps retrying its handshake before giving up.
    /// Must not be below 250ms. Default: 12 seconds
    pub connect_timeout: Duration,
    /// Delay between two handshake retransmissions. Default: 250ms
    pub handshake_retry_interval: Duration,
    /// Cadence of the ACK / NAK / EXP maintenance timer. Default: 10ms
    pub syn_interval: Duration,
    /// A light ACK is sent every `light_ack_interval` received data packets. Default: 64
    pub light_ack_interval: usize,
    /// Congestion control policy. Default: AIMD with slow start
    pub congestion_control: CongestionControlFactory,
}

impl UdtConfiguration {
    pub fn udt_version(&self) -> u32 {
        UDT_VERSION
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        validate_timeout(timeout)?;
        self.connect_timeout = timeout;
        Ok(())
    }
}

pub(crate) fn validate_timeout(timeout: Duration) -> Result<()> {
    if timeout < MIN_TIMEOUT {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "timeout must be at least 250ms",
        ));
    }
    Ok(())
}

impl Default for UdtConfiguration {
    fn default() -> Self {
        Self {
            mss: DEFAULT_MSS,
            flight_flag_size: DEFAULT_WINDOW_SIZE,
            rcv_buf_size: DEFAULT_UDT_BUF_SIZE,
            udp_snd_buf_size: DEFAULT_UDP_BUF_SIZE,
            udp_rcv_buf_size: DEFAULT_UDP_BUF_SIZE,
            udp_reuse_port: false,
            connect_timeout: Duration::from_secs(12),
            handshake_retry_interval: Duration::from_millis(250),
            syn_interval: Duration::from_millis(10),
            light_ack_interval: 64,
            congestion_control: default_congestion_control,
        }
    }
}
