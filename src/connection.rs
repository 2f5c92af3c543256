use crate::configuration::{validate_timeout, UdtConfiguration};
use crate::socket::{ConnectionEvent, SocketId, SocketReceivers, UdtStatus};
use crate::udt::Udt;
use bytes::{Buf, Bytes};
use std::net::SocketAddr;
use tokio::io::{Error, ErrorKind, Result};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

/// Application handle on one reliable stream.
///
/// Dropping it shuts the connection down.
#[derive(Debug)]
pub struct UdtConnection {
    udt: Udt,
    socket_id: SocketId,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    delivered: mpsc::UnboundedReceiver<Bytes>,
    leftover: Bytes,
}

impl UdtConnection {
    fn new(udt: Udt, socket_id: SocketId, receivers: SocketReceivers) -> Self {
        Self {
            udt,
            socket_id,
            events: receivers.events,
            delivered: receivers.delivered,
            leftover: Bytes::new(),
        }
    }

    pub(crate) fn accepted(udt: Udt, socket_id: SocketId, receivers: SocketReceivers) -> Self {
        Self::new(udt, socket_id, receivers)
    }

    /// Creates an unconnected socket bound on `local`, sharing the UDP socket
    /// with other connections already bound there.
    pub fn open(udt: &Udt, local: SocketAddr) -> Result<Self> {
        Self::open_with(udt, local, UdtConfiguration::default())
    }

    pub fn open_with(udt: &Udt, local: SocketAddr, config: UdtConfiguration) -> Result<Self> {
        validate_timeout(config.connect_timeout)?;
        let (socket_id, receivers) = udt.open_socket(local, config)?;
        Ok(Self::new(udt.clone(), socket_id, receivers))
    }

    /// Opens a socket on `local` and connects it to `remote`.
    pub async fn connect_to(udt: &Udt, local: SocketAddr, remote: SocketAddr) -> Result<Self> {
        let mut connection = Self::open(udt, local)?;
        connection.connect(remote).await?;
        Ok(connection)
    }

    /// Runs the handshake. Fails with `TimedOut` if the peer does not answer
    /// within the connection timeout.
    pub async fn connect(&mut self, remote: SocketAddr) -> Result<()> {
        {
            let shared = self.udt.shared();
            let mut state = shared.lock();
            let (endpoint, _) = state.socket_endpoint(self.socket_id)?;
            let local_addr = endpoint.local_addr();
            let result = endpoint.connect(self.socket_id, remote, Instant::now());
            state.settle(local_addr);
            result?;
        }
        match self.events.recv().await {
            Some(ConnectionEvent::Connected) => Ok(()),
            Some(ConnectionEvent::Timeout) => Err(Error::new(
                ErrorKind::TimedOut,
                "connection handshake timed out",
            )),
            Some(ConnectionEvent::Error(err)) => Err(err),
            Some(ConnectionEvent::Closed) | None => Err(Error::new(
                ErrorKind::ConnectionAborted,
                "connection closed during handshake",
            )),
        }
    }

    /// Changes the handshake timeout. Values below 250ms are refused.
    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        validate_timeout(timeout)?;
        let mut state = self.udt.shared().lock();
        let (endpoint, _) = state.socket_endpoint(self.socket_id)?;
        let socket = endpoint
            .socket_mut(self.socket_id)
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "connection is closed"))?;
        socket.set_timeout(timeout)
    }

    /// Buffers `msg` for transmission. Never waits: pacing and the flow
    /// window decide when it goes out.
    pub fn send(&self, msg: &[u8]) -> Result<()> {
        let shared = self.udt.shared();
        {
            let mut state = shared.lock();
            let (endpoint, core) = state.socket_endpoint(self.socket_id)?;
            endpoint.send(core, self.socket_id, msg, Instant::now())?;
        }
        shared.wake_scheduler();
        Ok(())
    }

    /// Reads received bytes in order. Returns 0 once the connection is closed
    /// and everything received was read.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.leftover.is_empty() {
            match self.delivered.recv().await {
                Some(data) => self.leftover = data,
                None => return Ok(0),
            }
        }
        let nbytes = buf.len().min(self.leftover.len());
        buf[..nbytes].copy_from_slice(&self.leftover[..nbytes]);
        self.leftover.advance(nbytes);
        Ok(nbytes)
    }

    /// Next notification for this connection, `None` once it is gone.
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }

    /// Sends a shutdown to the peer and releases the connection.
    pub fn shutdown(&self) {
        let mut state = self.udt.shared().lock();
        let local_addr = match state.socket_endpoint(self.socket_id) {
            Ok((endpoint, core)) => {
                endpoint.shutdown(core, self.socket_id, Instant::now());
                endpoint.local_addr()
            }
            Err(_) => return,
        };
        state.settle(local_addr);
    }

    pub fn socket_id(&self) -> SocketId {
        self.socket_id
    }

    pub fn status(&self) -> UdtStatus {
        let mut state = self.udt.shared().lock();
        if let Ok((endpoint, _)) = state.socket_endpoint(self.socket_id) {
            if let Some(socket) = endpoint.socket(self.socket_id) {
                return socket.status;
            }
        }
        UdtStatus::Closed
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        let mut state = self.udt.shared().lock();
        let (endpoint, _) = state.socket_endpoint(self.socket_id).ok()?;
        Some(endpoint.local_addr())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        let mut state = self.udt.shared().lock();
        let (endpoint, _) = state.socket_endpoint(self.socket_id).ok()?;
        endpoint.socket(self.socket_id)?.peer_addr
    }
}

impl Drop for UdtConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}
