use crate::common::ensure_ipv4;
use crate::configuration::UdtConfiguration;
use crate::control_packet::{
    AckInfo, AckOptionalInfo, ControlPacketType, HandShakeInfo, NakInfo, UdtControlPacket,
};
use crate::cookie;
use crate::data_packet::UdtDataPacket;
use crate::packet::UdtPacket;
use crate::socket::{
    socket_channels, ConnectionEvent, SocketId, SocketReceivers, UdtSocket, UdtStatus,
};
use crate::udt::UdtCore;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{Error, ErrorKind, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);
const MAX_EXP_COUNT: u32 = 16;
const MIN_BROKEN_SILENCE: Duration = Duration::from_secs(5);

/// What an endpoint tells the listener bound on it.
#[derive(Debug)]
pub(crate) enum ListenerSignal {
    Accepted {
        peer: SocketAddr,
        socket_id: SocketId,
        receivers: SocketReceivers,
    },
    Close,
}

#[derive(Debug)]
struct ListenerSlot {
    signals: mpsc::UnboundedSender<ListenerSignal>,
    configuration: UdtConfiguration,
    closing: bool,
}

/// Send half of the UDP socket. Sends never wait: a full kernel buffer drops
/// the datagram like the network would, any other error marks the endpoint failed.
///
/// Sends use a non-blocking std clone of the descriptor: tokio's `try_send_to`
/// reports `WouldBlock` until the reactor has polled the socket.
#[derive(Debug)]
struct UdtChannel {
    sender: std::net::UdpSocket,
    socket: Arc<UdpSocket>,
    start_time: Instant,
    failure: Option<Error>,
}

impl UdtChannel {
    fn timestamp(&self, now: Instant) -> u32 {
        now.saturating_duration_since(self.start_time).as_micros() as u32
    }

    fn send_control(&mut self, addr: SocketAddr, packet: UdtControlPacket, now: Instant) {
        let packet = packet.with_timestamp(self.timestamp(now));
        self.send(addr, packet.into());
    }

    fn send(&mut self, addr: SocketAddr, packet: UdtPacket) {
        match self.sender.send_to(&packet.serialize(), addr) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                trace!("udp send buffer full, dropping packet to {}", addr);
            }
            Err(err) => {
                error!("udp send to {} failed: {}", addr, err);
                self.failure.get_or_insert(err);
            }
        }
    }
}

/// Owns one bound UDP socket and every connection multiplexed on it.
#[derive(Debug)]
pub(crate) struct UdtEndpoint {
    local_addr: SocketAddr,
    channel: UdtChannel,
    sockets: BTreeMap<SocketId, UdtSocket>,
    // (peer address, peer socket id) -> accepted socket
    peers: BTreeMap<(SocketAddr, SocketId), SocketId>,
    listener: Option<ListenerSlot>,
    workers: Vec<JoinHandle<()>>,
}

impl UdtEndpoint {
    /// Binds the UDP socket. Must be called from within a tokio runtime.
    pub fn bind(addr: SocketAddr, configuration: &UdtConfiguration) -> Result<Self> {
        ensure_ipv4(&addr)?;
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        if configuration.udp_reuse_port {
            socket.set_reuse_port(true)?;
        }
        if let Err(err) = socket.set_send_buffer_size(configuration.udp_snd_buf_size) {
            debug!("could not set udp send buffer size: {}", err);
        }
        if let Err(err) = socket.set_recv_buffer_size(configuration.udp_rcv_buf_size) {
            debug!("could not set udp receive buffer size: {}", err);
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        let sender: std::net::UdpSocket = socket.try_clone()?.into();
        sender.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(socket.into())?);
        let local_addr = socket.local_addr()?;
        debug!("udt endpoint bound on {}", local_addr);

        Ok(Self {
            local_addr,
            channel: UdtChannel {
                sender,
                socket,
                start_time: Instant::now(),
                failure: None,
            },
            sockets: BTreeMap::new(),
            peers: BTreeMap::new(),
            listener: None,
            workers: vec![],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn udp_socket(&self) -> Arc<UdpSocket> {
        self.channel.socket.clone()
    }

    pub fn attach_workers(&mut self, workers: impl IntoIterator<Item = JoinHandle<()>>) {
        self.workers.extend(workers);
    }

    pub fn socket(&self, socket_id: SocketId) -> Option<&UdtSocket> {
        self.sockets.get(&socket_id)
    }

    pub fn socket_mut(&mut self, socket_id: SocketId) -> Option<&mut UdtSocket> {
        self.sockets.get_mut(&socket_id)
    }

    /// No connection and no listener left: the UDP socket can be closed.
    pub fn is_idle(&self) -> bool {
        self.sockets.is_empty() && self.listener.is_none()
    }

    pub fn take_failure(&mut self) -> Option<Error> {
        self.channel.failure.take()
    }

    pub fn add_socket(&mut self, core: &mut UdtCore, socket: UdtSocket) {
        core.routes.insert(socket.socket_id, self.local_addr);
        self.sockets.insert(socket.socket_id, socket);
    }

    pub fn listen(
        &mut self,
        signals: mpsc::UnboundedSender<ListenerSignal>,
        configuration: UdtConfiguration,
    ) -> Result<()> {
        if self.listener.is_some() {
            return Err(Error::new(
                ErrorKind::AddrInUse,
                "a listener is already bound on this address",
            ));
        }
        self.listener = Some(ListenerSlot {
            signals,
            configuration,
            closing: false,
        });
        Ok(())
    }

    /// Stops accepting. `Close` is signalled once every accepted connection is gone.
    pub fn close_listener(&mut self) {
        if let Some(listener) = self.listener.as_mut() {
            listener.closing = true;
        }
        self.check_listener_drained();
    }

    fn check_listener_drained(&mut self) {
        let drained = self
            .listener
            .as_ref()
            .map(|l| l.closing && !self.sockets.values().any(|s| s.accepted))
            .unwrap_or(false);
        if drained {
            if let Some(listener) = self.listener.take() {
                debug!("listener on {} closed", self.local_addr);
                let _ = listener.signals.send(ListenerSignal::Close);
            }
        }
    }

    /// Starts the client handshake towards `peer`.
    pub fn connect(
        &mut self,
        socket_id: SocketId,
        peer: SocketAddr,
        now: Instant,
    ) -> Result<()> {
        ensure_ipv4(&peer)?;
        let socket = self
            .sockets
            .get_mut(&socket_id)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "unknown socket id"))?;
        if socket.status != UdtStatus::Initial {
            return Err(Error::new(
                ErrorKind::AlreadyExists,
                "socket is already connecting or connected",
            ));
        }
        socket.peer_addr = Some(peer);
        socket.status = UdtStatus::SynSent;
        let hs = socket
            .handshake_info(1, 0)
            .ok_or_else(|| Error::new(ErrorKind::Other, "missing peer address"))?;
        socket.start_handshake(UdtControlPacket::new_handshake(hs, 0), now);
        debug!("socket {} sending handshake to {}", socket_id, peer);
        handshake_timer(socket, &mut self.channel, now);
        Ok(())
    }

    pub fn send(
        &mut self,
        core: &mut UdtCore,
        socket_id: SocketId,
        data: &[u8],
        now: Instant,
    ) -> Result<()> {
        let socket = self
            .sockets
            .get_mut(&socket_id)
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "connection is closed"))?;
        socket.snd_buffer.add_message(data);
        if socket.has_data_to_send() {
            core.scheduler.schedule_if_idle(socket_id, now);
        }
        Ok(())
    }

    /// Removes the connection, telling the peer if the handshake had completed.
    pub fn shutdown(&mut self, core: &mut UdtCore, socket_id: SocketId, now: Instant) {
        if let Some(socket) = self.sockets.get(&socket_id) {
            if let (UdtStatus::Connected, Some(peer)) = (socket.status, socket.peer_addr) {
                let packet = UdtControlPacket::new(ControlPacketType::Shutdown, socket.peer_socket_id);
                self.channel.send_control(peer, packet, now);
            }
        }
        self.remove_socket(core, socket_id, None);
    }

    pub fn remove_socket(
        &mut self,
        core: &mut UdtCore,
        socket_id: SocketId,
        event: Option<ConnectionEvent>,
    ) {
        core.routes.remove(&socket_id);
        core.scheduler.remove(socket_id);
        if let Some(mut socket) = self.sockets.remove(&socket_id) {
            socket.status = UdtStatus::Closed;
            if let Some(peer) = socket.peer_addr {
                let key = (peer, socket.peer_socket_id);
                if self.peers.get(&key) == Some(&socket_id) {
                    self.peers.remove(&key);
                }
            }
            if let Some(event) = event {
                socket.notify(event);
            }
            trace!("socket {} removed from {}", socket_id, self.local_addr);
        }
        self.check_listener_drained();
    }

    /// Tears down every connection after a fatal transport error.
    pub fn fail(&mut self, core: &mut UdtCore, err: &Error) {
        warn!("udt endpoint {} failed: {}", self.local_addr, err);
        let ids: Vec<_> = self.sockets.keys().copied().collect();
        for socket_id in ids {
            let event = ConnectionEvent::Error(Error::new(err.kind(), err.to_string()));
            self.remove_socket(core, socket_id, Some(event));
        }
        if let Some(listener) = self.listener.take() {
            let _ = listener.signals.send(ListenerSignal::Close);
        }
    }

    pub fn receive(&mut self, core: &mut UdtCore, raw: &[u8], from: SocketAddr, now: Instant) {
        let packet = match UdtPacket::deserialize(raw) {
            Ok(packet) => packet,
            Err(err) => {
                debug!("dropping malformed datagram from {}: {}", from, err);
                return;
            }
        };
        trace!("{} <- {} for socket {}", self.local_addr, from, packet.dest_socket_id());
        match packet {
            UdtPacket::Control(ctrl) if ctrl.dest_socket_id == 0 => match ctrl.packet_type {
                ControlPacketType::Handshake(hs) => self.on_listen_handshake(core, hs, from, now),
                other => trace!("dropping {:?} without destination from {}", other, from),
            },
            UdtPacket::Control(ctrl) => self.on_control(core, ctrl, from, now),
            UdtPacket::Data(data) => self.on_data(data, from, now),
        }
    }

    fn on_listen_handshake(
        &mut self,
        core: &mut UdtCore,
        hs: HandShakeInfo,
        from: SocketAddr,
        now: Instant,
    ) {
        let listener = match self.listener.as_ref() {
            Some(listener) if !listener.closing => listener,
            _ => {
                trace!("no listener on {}, dropping handshake from {}", self.local_addr, from);
                return;
            }
        };
        let minute = cookie::current_minute();

        match hs.connection_type {
            1 => {
                let dest = hs.socket_id;
                let reply = HandShakeInfo {
                    max_packet_size: hs.max_packet_size.min(listener.configuration.mss),
                    max_window_size: hs
                        .max_window_size
                        .min(listener.configuration.flight_flag_size),
                    syn_cookie: cookie::syn_cookie(&from, minute),
                    ..hs
                };
                self.channel
                    .send_control(from, UdtControlPacket::new_handshake(reply, dest), now);
            }
            -1 => {
                if !cookie::is_valid_cookie(&from, hs.syn_cookie, minute) {
                    debug!("dropping handshake with invalid cookie from {}", from);
                    return;
                }
                if let Some(existing) = self
                    .peers
                    .get(&(from, hs.socket_id))
                    .and_then(|id| self.sockets.get(id))
                {
                    trace!("repeated handshake from {}, confirming again", from);
                    if let Some(confirm) = existing.handshake_info(-1, hs.syn_cookie) {
                        let packet = UdtControlPacket::new_handshake(confirm, hs.socket_id);
                        self.channel.send_control(from, packet, now);
                    }
                    return;
                }

                let socket_id = core.new_socket_id();
                let (channels, receivers) = socket_channels();
                let socket = UdtSocket::accepted(
                    socket_id,
                    listener.configuration.clone(),
                    channels,
                    from,
                    &hs,
                );
                if let Some(confirm) = socket.handshake_info(-1, hs.syn_cookie) {
                    let packet = UdtControlPacket::new_handshake(confirm, hs.socket_id);
                    self.channel.send_control(from, packet, now);
                }
                let accepted = ListenerSignal::Accepted {
                    peer: from,
                    socket_id,
                    receivers,
                };
                if listener.signals.send(accepted).is_err() {
                    debug!("listener on {} is gone, dropping connection", self.local_addr);
                    return;
                }
                debug!("accepted socket {} from {}", socket_id, from);
                self.peers.insert((from, hs.socket_id), socket_id);
                self.add_socket(core, socket);
            }
            other => trace!("unexpected connection type {} from {}", other, from),
        }
    }

    fn on_control(
        &mut self,
        core: &mut UdtCore,
        ctrl: UdtControlPacket,
        from: SocketAddr,
        now: Instant,
    ) {
        let socket_id = ctrl.dest_socket_id;
        let socket = match self.sockets.get_mut(&socket_id) {
            Some(socket) if socket.peer_addr == Some(from) => socket,
            _ => {
                trace!("dropping control packet for unknown socket {}", socket_id);
                return;
            }
        };
        let channel = &mut self.channel;
        socket.state.on_peer_activity(now);

        let closing = match ctrl.packet_type {
            ControlPacketType::Handshake(hs) => {
                on_client_handshake(core, socket, channel, hs, now);
                None
            }
            ControlPacketType::KeepAlive => None,
            ControlPacketType::Ack(ack) => {
                on_ack(core, socket, channel, ctrl.additional_info, ack, now);
                None
            }
            ControlPacketType::Nak(nak) => {
                let losses = nak.lost_sequences();
                for (start, end) in &losses {
                    socket.snd_buffer.on_loss(*start, *end);
                }
                socket.rate_control.on_loss(&losses);
                if socket.has_data_to_send() {
                    core.scheduler.schedule_if_idle(socket_id, now);
                }
                None
            }
            ControlPacketType::Shutdown => {
                debug!("socket {} shut down by peer", socket_id);
                Some(ConnectionEvent::Closed)
            }
            ControlPacketType::Ack2 => {
                if let Some((_, rtt)) = socket.state.ack_window.get(ctrl.additional_info.into()) {
                    socket.state.flow.update_rtt(rtt);
                    socket.rate_control.set_rtt(socket.state.flow.rtt);
                }
                None
            }
            ControlPacketType::Unknown(code) => {
                warn!("unsupported control packet type {:#x} from {}", code, from);
                None
            }
        };
        if let Some(event) = closing {
            self.remove_socket(core, socket_id, Some(event));
        }
    }

    fn on_data(&mut self, packet: UdtDataPacket, from: SocketAddr, now: Instant) {
        let socket_id = packet.header.dest_socket_id;
        let socket = match self.sockets.get_mut(&socket_id) {
            Some(socket) if socket.status == UdtStatus::Connected && socket.peer_addr == Some(from) => {
                socket
            }
            _ => {
                trace!("dropping data packet for unknown socket {}", socket_id);
                return;
            }
        };
        let seq = packet.header.seq_number;
        socket.state.on_peer_activity(now);
        if socket.rcv_buffer.get_available_buf_size() == 0 && seq != socket.rcv_buffer.next_to_read() {
            // treated as lost: the next arrival reports it
            return;
        }

        socket.state.flow.on_pkt_arrival(seq.number(), now);
        if let Some((first, last)) = socket.state.on_data_seq(seq) {
            let nak = UdtControlPacket::new_nak(
                NakInfo::encode_range(first, last),
                socket.peer_socket_id,
            );
            self.channel.send_control(from, nak, now);
            socket.state.last_nak_time = now;
        }

        if socket.rcv_buffer.insert(seq, packet.data) {
            for data in socket.rcv_buffer.drain_ready() {
                socket.deliver(data);
            }
        }

        socket.state.light_ack_counter += 1;
        if socket.state.light_ack_counter >= socket.configuration.light_ack_interval {
            let ack = AckInfo {
                next_seq_number: socket.rcv_buffer.next_to_read(),
                info: None,
            };
            let packet = UdtControlPacket::new_ack(0.into(), ack, socket.peer_socket_id);
            self.channel.send_control(from, packet, now);
            socket.state.light_ack_counter = 0;
        }
    }

    /// Sends at most one data packet for the connection and re-arms it.
    pub fn transmit(&mut self, core: &mut UdtCore, socket_id: SocketId, now: Instant) {
        let socket = match self.sockets.get_mut(&socket_id) {
            Some(socket) if socket.status == UdtStatus::Connected => socket,
            _ => return,
        };
        let peer = match socket.peer_addr {
            Some(peer) => peer,
            None => return,
        };
        if let Some(packet) = socket.next_data_packet(self.channel.timestamp(now)) {
            self.channel.send(peer, packet.into());
            socket.state.last_snd_time = now;
        }
        if socket.has_data_to_send() {
            core.scheduler
                .schedule(socket_id, now + socket.rate_control.get_pkt_send_period());
        }
    }

    /// Periodic maintenance: handshake retries, ACK, NAK, EXP and keep-alive.
    pub fn on_timer(&mut self, core: &mut UdtCore, now: Instant) {
        let ids: Vec<_> = self.sockets.keys().copied().collect();
        for socket_id in ids {
            let event = match self.sockets.get_mut(&socket_id) {
                Some(socket) => check_timers(core, socket, &mut self.channel, now),
                None => None,
            };
            if let Some(event) = event {
                self.remove_socket(core, socket_id, Some(event));
            }
        }
    }
}

impl Drop for UdtEndpoint {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

fn on_client_handshake(
    core: &mut UdtCore,
    socket: &mut UdtSocket,
    channel: &mut UdtChannel,
    hs: HandShakeInfo,
    now: Instant,
) {
    match (socket.status, hs.connection_type) {
        (UdtStatus::SynSent, 1) => {
            socket.negotiate(&hs);
            socket.status = UdtStatus::SynAckReceived;
            if let Some(reply) = socket.handshake_info(-1, hs.syn_cookie) {
                socket.start_handshake(UdtControlPacket::new_handshake(reply, 0), now);
                trace!("socket {} echoing cookie", socket.socket_id);
                handshake_timer(socket, channel, now);
            }
        }
        (UdtStatus::SynAckReceived, -1) => {
            socket.negotiate(&hs);
            socket.establish(&hs);
            debug!(
                "socket {} connected to {} (peer socket {})",
                socket.socket_id,
                hs.ip_address,
                hs.socket_id
            );
            socket.notify(ConnectionEvent::Connected);
            if socket.has_data_to_send() {
                core.scheduler.schedule(socket.socket_id, now);
            }
        }
        (status, connection_type) => trace!(
            "ignoring handshake type {} for socket {} in state {:?}",
            connection_type,
            socket.socket_id,
            status
        ),
    }
}

fn on_ack(
    core: &mut UdtCore,
    socket: &mut UdtSocket,
    channel: &mut UdtChannel,
    ack_number: u32,
    ack: AckInfo,
    now: Instant,
) {
    let peer = match socket.peer_addr {
        Some(peer) => peer,
        None => return,
    };
    let acked = socket.snd_buffer.ack(ack.next_seq_number);
    if acked > 0 {
        socket.rate_control.on_ack(ack.next_seq_number);
    }
    if let Some(info) = &ack.info {
        if info.rtt > 0 {
            socket.state.flow.rtt = Duration::from_micros(info.rtt.into());
            socket.state.flow.rtt_var = Duration::from_micros(info.rtt_variance.into());
            socket.rate_control.set_rtt(socket.state.flow.rtt);
        }
        if info.pack_recv_rate > 0 {
            socket.rate_control.set_rcv_rate(info.pack_recv_rate);
        }
        if info.link_capacity > 0 {
            socket.rate_control.set_bandwidth(info.link_capacity);
        }
    }
    channel.send_control(
        peer,
        UdtControlPacket::new_ack2(ack_number, socket.peer_socket_id),
        now,
    );
    if socket.has_data_to_send() {
        core.scheduler.schedule_if_idle(socket.socket_id, now);
    }
}

fn handshake_timer(
    socket: &mut UdtSocket,
    channel: &mut UdtChannel,
    now: Instant,
) -> Option<ConnectionEvent> {
    let peer = socket.peer_addr?;
    let retry = socket.handshake.as_mut()?;
    if now.saturating_duration_since(retry.started) >= socket.timeout {
        debug!("socket {} handshake timed out", socket.socket_id);
        return Some(ConnectionEvent::Timeout);
    }
    if now >= retry.next_send {
        channel.send_control(peer, retry.packet.clone(), now);
        retry.next_send = now + socket.configuration.handshake_retry_interval;
    }
    None
}

fn check_timers(
    core: &mut UdtCore,
    socket: &mut UdtSocket,
    channel: &mut UdtChannel,
    now: Instant,
) -> Option<ConnectionEvent> {
    match socket.status {
        UdtStatus::SynSent | UdtStatus::SynAckReceived => {
            return handshake_timer(socket, channel, now)
        }
        UdtStatus::Connected => {}
        _ => return None,
    }
    let peer = socket.peer_addr?;
    let peer_socket_id = socket.peer_socket_id;
    let state = &mut socket.state;

    // Full ACK when the receive point moved, or again after two RTTs.
    let ack_point = socket.rcv_buffer.next_to_read();
    let since_ack = now.saturating_duration_since(state.last_sent_ack_time);
    if ack_point != state.last_sent_ack || since_ack >= 2 * state.flow.rtt {
        let ack_number = state.next_ack_number();
        let ack = AckInfo {
            next_seq_number: ack_point,
            info: Some(AckOptionalInfo {
                rtt: state.flow.rtt.as_micros() as u32,
                rtt_variance: state.flow.rtt_var.as_micros() as u32,
                available_buf_size: socket.rcv_buffer.get_available_buf_size(),
                pack_recv_rate: state.flow.get_pkt_rcv_speed(),
                link_capacity: state.flow.get_bandwidth(),
            }),
        };
        channel.send_control(peer, UdtControlPacket::new_ack(ack_number, ack, peer_socket_id), now);
        state.ack_window.store(ack_point, ack_number);
        state.last_sent_ack = ack_point;
        state.last_sent_ack_time = now;
        state.light_ack_counter = 0;
        state.last_snd_time = now;
    }

    if !state.rcv_loss_list.is_empty()
        && now.saturating_duration_since(state.last_nak_time) >= state.nak_interval()
    {
        let loss_info = state
            .rcv_loss_list
            .ranges()
            .flat_map(|(first, last)| NakInfo::encode_range(first, last))
            .collect();
        channel.send_control(peer, UdtControlPacket::new_nak(loss_info, peer_socket_id), now);
        state.last_nak_time = now;
    }

    let last_event = std::cmp::max(state.last_rsp_time, state.last_exp_time);
    if now.saturating_duration_since(last_event) >= state.exp_interval(socket.configuration.syn_interval) {
        if state.exp_count > MAX_EXP_COUNT
            && now.saturating_duration_since(state.last_rsp_time) > MIN_BROKEN_SILENCE
        {
            warn!("socket {} lost its peer {}", socket.socket_id, peer);
            return Some(ConnectionEvent::Error(Error::new(
                ErrorKind::TimedOut,
                "peer stopped responding",
            )));
        }
        if socket.snd_buffer.flow_window_size() > 0 {
            socket.snd_buffer.expire_all();
            socket.rate_control.on_timeout();
            core.scheduler.schedule(socket.socket_id, now);
        }
        state.exp_count += 1;
        state.last_exp_time = now;
    }

    if now.saturating_duration_since(state.last_snd_time) >= KEEP_ALIVE_INTERVAL {
        channel.send_control(
            peer,
            UdtControlPacket::new(ControlPacketType::KeepAlive, peer_socket_id),
            now,
        );
        state.last_snd_time = now;
    }
    None
}
