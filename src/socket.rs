use crate::configuration::UdtConfiguration;
use crate::control_packet::{HandShakeInfo, UdtControlPacket};
use crate::data_packet::UdtDataPacket;
use crate::packet::DATA_PACKET_OVERHEAD;
use crate::queue::{RcvBuffer, SndBuffer};
use crate::rate_control::CongestionControl;
use crate::seq_number::SeqNumber;
use crate::state::SocketState;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::io::{Error, ErrorKind, Result};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

pub type SocketId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketType {
    Stream = 1,
    Datagram = 2,
}

impl TryFrom<u32> for SocketType {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            1 => Ok(Self::Stream),
            2 => Ok(Self::Datagram),
            _ => Err(Error::new(ErrorKind::InvalidData, "unknown socket type")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdtStatus {
    Initial,
    SynSent,
    SynAckReceived,
    Connected,
    Closed,
}

/// Notifications raised by the protocol engine for one connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The handshake completed.
    Connected,
    /// The handshake got no answer within the configured timeout.
    Timeout,
    /// The peer sent a shutdown.
    Closed,
    /// The connection broke (peer silent for too long, or the UDP socket failed).
    Error(Error),
}

#[derive(Debug)]
pub(crate) struct HandshakeRetry {
    pub packet: UdtControlPacket,
    pub started: Instant,
    pub next_send: Instant,
}

/// Channels through which an engine-side socket talks to its application handle.
#[derive(Debug)]
pub(crate) struct SocketChannels {
    pub events: mpsc::UnboundedSender<ConnectionEvent>,
    pub delivered: mpsc::UnboundedSender<Bytes>,
}

/// Receiving halves matching `SocketChannels`.
#[derive(Debug)]
pub(crate) struct SocketReceivers {
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
    pub delivered: mpsc::UnboundedReceiver<Bytes>,
}

pub(crate) fn socket_channels() -> (SocketChannels, SocketReceivers) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
    (
        SocketChannels {
            events: events_tx,
            delivered: delivered_tx,
        },
        SocketReceivers {
            events: events_rx,
            delivered: delivered_rx,
        },
    )
}

/// One end of a reliable stream, owned by the endpoint it is bound to.
#[derive(Debug)]
pub(crate) struct UdtSocket {
    pub socket_id: SocketId,
    pub socket_type: SocketType,
    pub status: UdtStatus,
    pub peer_addr: Option<SocketAddr>,
    pub peer_socket_id: SocketId,
    pub initial_seq_number: SeqNumber,
    pub configuration: UdtConfiguration,
    pub timeout: Duration,
    pub max_packet_size: u32,
    pub max_window_size: u32,
    pub accepted: bool,

    pub snd_buffer: SndBuffer,
    pub rcv_buffer: RcvBuffer,
    pub state: SocketState,
    pub rate_control: Box<dyn CongestionControl>,
    pub handshake: Option<HandshakeRetry>,
    channels: SocketChannels,
}

impl UdtSocket {
    pub fn new(socket_id: SocketId, configuration: UdtConfiguration, channels: SocketChannels) -> Self {
        let isn = SeqNumber::random();
        let max_packet_size = configuration.mss;
        let max_window_size = configuration.flight_flag_size;
        Self {
            socket_id,
            socket_type: SocketType::Stream,
            status: UdtStatus::Initial,
            peer_addr: None,
            peer_socket_id: 0,
            initial_seq_number: isn,
            timeout: configuration.connect_timeout,
            max_packet_size,
            max_window_size,
            accepted: false,
            snd_buffer: SndBuffer::new(payload_size(max_packet_size), isn),
            rcv_buffer: RcvBuffer::new(configuration.rcv_buf_size, isn),
            state: SocketState::new(isn),
            rate_control: (configuration.congestion_control)(
                max_window_size,
                configuration.syn_interval,
            ),
            handshake: None,
            configuration,
            channels,
        }
    }

    /// A socket created by a listener after a valid cookie echo.
    pub fn accepted(
        socket_id: SocketId,
        configuration: UdtConfiguration,
        channels: SocketChannels,
        peer: SocketAddr,
        hs: &HandShakeInfo,
    ) -> Self {
        let mut socket = Self::new(socket_id, configuration, channels);
        socket.accepted = true;
        socket.socket_type = hs.socket_type;
        socket.peer_addr = Some(peer);
        socket.negotiate(hs);
        socket.establish(hs);
        socket
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        crate::configuration::validate_timeout(timeout)?;
        self.timeout = timeout;
        Ok(())
    }

    /// Keeps the smaller packet and window sizes of both sides.
    pub fn negotiate(&mut self, hs: &HandShakeInfo) {
        self.max_packet_size = self.max_packet_size.min(hs.max_packet_size);
        self.max_window_size = self.max_window_size.min(hs.max_window_size);
        self.snd_buffer
            .set_payload_size(payload_size(self.max_packet_size));
        self.rate_control = (self.configuration.congestion_control)(
            self.max_window_size,
            self.configuration.syn_interval,
        );
    }

    /// Switches to `Connected` once the peer's identity and first sequence are known.
    pub fn establish(&mut self, hs: &HandShakeInfo) {
        self.status = UdtStatus::Connected;
        self.peer_socket_id = hs.socket_id;
        self.handshake = None;
        // the first data packet from the peer must not look like a loss
        self.state = SocketState::new(hs.initial_seq_number);
        self.rcv_buffer = RcvBuffer::new(self.configuration.rcv_buf_size, hs.initial_seq_number);
    }

    /// The handshake this side sends, with its own identity and sizes.
    pub fn handshake_info(&self, connection_type: i32, syn_cookie: u32) -> Option<HandShakeInfo> {
        let peer = self.peer_addr?;
        Some(HandShakeInfo {
            udt_version: self.configuration.udt_version(),
            socket_type: self.socket_type,
            initial_seq_number: self.initial_seq_number,
            max_packet_size: self.max_packet_size,
            max_window_size: self.max_window_size,
            connection_type,
            socket_id: self.socket_id,
            syn_cookie,
            ip_address: peer.ip(),
        })
    }

    pub fn start_handshake(&mut self, packet: UdtControlPacket, now: Instant) {
        let started = self.handshake.as_ref().map(|h| h.started).unwrap_or(now);
        self.handshake = Some(HandshakeRetry {
            packet,
            started,
            next_send: now,
        });
    }

    pub fn window(&self) -> u32 {
        self.rate_control
            .get_congestion_window_size()
            .min(self.max_window_size)
            .max(1)
    }

    pub fn has_data_to_send(&self) -> bool {
        self.status == UdtStatus::Connected && self.snd_buffer.has_data_to_send(self.window())
    }

    /// Next data packet for the wire, if the send buffer and window allow one.
    pub fn next_data_packet(&mut self, timestamp: u32) -> Option<UdtDataPacket> {
        let window = self.window();
        let (seq, block, _retransmit) = self.snd_buffer.next_block(window)?;
        Some(block.as_data_packet(seq, self.peer_socket_id, timestamp))
    }

    pub fn notify(&self, event: ConnectionEvent) {
        let _ = self.channels.events.send(event);
    }

    pub fn deliver(&self, data: Bytes) {
        let _ = self.channels.delivered.send(data);
    }
}

pub(crate) fn payload_size(max_packet_size: u32) -> usize {
    max_packet_size.saturating_sub(DATA_PACKET_OVERHEAD).max(1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn peer_handshake(max_packet_size: u32, max_window_size: u32) -> HandShakeInfo {
        HandShakeInfo {
            udt_version: 4,
            socket_type: SocketType::Stream,
            initial_seq_number: 500.into(),
            max_packet_size,
            max_window_size,
            connection_type: 1,
            socket_id: 99,
            syn_cookie: 0,
            ip_address: IpAddr::from([127, 0, 0, 1]),
        }
    }

    #[test]
    fn timeout_floor() {
        let (channels, _rx) = socket_channels();
        let mut socket = UdtSocket::new(1, UdtConfiguration::default(), channels);
        assert_eq!(
            socket.set_timeout(Duration::from_millis(100)).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(socket.timeout, Duration::from_secs(12));
        socket.set_timeout(Duration::from_millis(300)).unwrap();
        assert_eq!(socket.timeout, Duration::from_millis(300));
    }

    #[test]
    fn accepted_socket_negotiates_and_seeds_lrsn() {
        let (channels, _rx) = socket_channels();
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let socket = UdtSocket::accepted(
            7,
            UdtConfiguration::default(),
            channels,
            peer,
            &peer_handshake(1400, 10_000),
        );
        assert_eq!(socket.status, UdtStatus::Connected);
        assert_eq!(socket.max_packet_size, 1400);
        assert_eq!(socket.max_window_size, 8192);
        assert_eq!(socket.peer_socket_id, 99);
        assert_eq!(socket.state.lrsn.number(), 499);
        assert_eq!(socket.rcv_buffer.next_to_read().number(), 500);
    }

    #[test]
    fn payload_leaves_room_for_headers() {
        assert_eq!(payload_size(1500), 1468);
    }
}
