use crate::configuration::{validate_timeout, UdtConfiguration};
use crate::connection::UdtConnection;
use crate::endpoint::ListenerSignal;
use crate::udt::Udt;
use std::net::SocketAddr;
use tokio::io::{Error, ErrorKind, Result};
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum ListenerEvent {
    /// The listener is bound and accepting.
    Listening(SocketAddr),
    /// A peer completed the handshake.
    Connection(SocketAddr, UdtConnection),
    /// The listener was closed and its last accepted connection is gone.
    Close,
}

/// Accepts connections on a local address.
#[derive(Debug)]
pub struct UdtListener {
    udt: Udt,
    local_addr: SocketAddr,
    signals: mpsc::UnboundedReceiver<ListenerSignal>,
    announced: bool,
    closing: bool,
    closed: bool,
}

impl UdtListener {
    pub fn bind(udt: &Udt, bind_addr: SocketAddr) -> Result<Self> {
        Self::bind_with(udt, bind_addr, UdtConfiguration::default())
    }

    /// `config` applies to the UDP socket, if a new one gets bound, and to
    /// every accepted connection.
    pub fn bind_with(udt: &Udt, bind_addr: SocketAddr, config: UdtConfiguration) -> Result<Self> {
        validate_timeout(config.connect_timeout)?;
        let (local_addr, signals) = udt.listen(bind_addr, config)?;
        Ok(Self {
            udt: udt.clone(),
            local_addr,
            signals,
            announced: false,
            closing: false,
            closed: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn accept(&mut self) -> Result<(SocketAddr, UdtConnection)> {
        loop {
            match self.next_event().await {
                Some(ListenerEvent::Listening(_)) => continue,
                Some(ListenerEvent::Connection(peer, connection)) => return Ok((peer, connection)),
                Some(ListenerEvent::Close) | None => {
                    return Err(Error::new(ErrorKind::NotConnected, "listener is closed"))
                }
            }
        }
    }

    /// `Listening` first, then one `Connection` per accepted peer, then
    /// `Close` after `close()` once drained.
    pub async fn next_event(&mut self) -> Option<ListenerEvent> {
        if !self.announced {
            self.announced = true;
            return Some(ListenerEvent::Listening(self.local_addr));
        }
        if self.closed {
            return None;
        }
        match self.signals.recv().await {
            Some(ListenerSignal::Accepted {
                peer,
                socket_id,
                receivers,
            }) => Some(ListenerEvent::Connection(
                peer,
                UdtConnection::accepted(self.udt.clone(), socket_id, receivers),
            )),
            Some(ListenerSignal::Close) | None => {
                self.closed = true;
                Some(ListenerEvent::Close)
            }
        }
    }

    /// Stops accepting new peers. Connections already accepted stay open.
    pub fn close(&mut self) {
        if !self.closing {
            self.closing = true;
            self.udt.close_listener(self.local_addr);
        }
    }
}

impl Drop for UdtListener {
    fn drop(&mut self) {
        self.close();
    }
}
