use crate::configuration::UdtConfiguration;
use crate::endpoint::{ListenerSignal, UdtEndpoint};
use crate::queue::{maintenance_worker, receive_worker, scheduler_worker, UdtSndQueue};
use crate::socket::{socket_channels, SocketId, SocketReceivers, UdtSocket};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::io::{Error, ErrorKind, Result};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::debug;

/// State shared by every endpoint of one context.
#[derive(Debug)]
pub(crate) struct UdtCore {
    pub scheduler: UdtSndQueue,
    /// socket id -> local address of the endpoint owning it
    pub routes: BTreeMap<SocketId, SocketAddr>,
    next_socket_id: SocketId,
}

impl UdtCore {
    pub fn new() -> Self {
        Self {
            scheduler: UdtSndQueue::new(),
            routes: BTreeMap::new(),
            next_socket_id: rand::random(),
        }
    }

    /// Ids count down from a random seed and wrap from 1 to `u32::MAX`.
    /// 0 means "no destination" on the wire and is never handed out.
    pub fn new_socket_id(&mut self) -> SocketId {
        loop {
            let socket_id = self.next_socket_id;
            self.next_socket_id = match socket_id {
                0 | 1 => SocketId::MAX,
                id => id - 1,
            };
            if socket_id != 0 && !self.routes.contains_key(&socket_id) {
                return socket_id;
            }
        }
    }
}

/// Bound endpoints, by port then address.
#[derive(Debug, Default)]
pub(crate) struct EndpointRegistry {
    endpoints: BTreeMap<u16, BTreeMap<IpAddr, UdtEndpoint>>,
}

impl EndpointRegistry {
    /// Address of the endpoint already serving `addr`, if any.
    /// Mixing the wildcard and a specific address on one port is refused.
    pub fn lookup(&self, addr: &SocketAddr) -> Result<Option<SocketAddr>> {
        if addr.port() == 0 {
            return Ok(None);
        }
        let by_ip = match self.endpoints.get(&addr.port()) {
            Some(by_ip) => by_ip,
            None => return Ok(None),
        };
        if by_ip.contains_key(&addr.ip()) {
            return Ok(Some(*addr));
        }
        if addr.ip().is_unspecified() || by_ip.keys().any(|ip| ip.is_unspecified()) {
            return Err(Error::new(
                ErrorKind::AddrInUse,
                "port already bound on an overlapping address",
            ));
        }
        Ok(None)
    }

    pub fn insert(&mut self, endpoint: UdtEndpoint) {
        let addr = endpoint.local_addr();
        self.endpoints
            .entry(addr.port())
            .or_default()
            .insert(addr.ip(), endpoint);
    }

    pub fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut UdtEndpoint> {
        self.endpoints.get_mut(&addr.port())?.get_mut(&addr.ip())
    }

    pub fn remove(&mut self, addr: &SocketAddr) -> Option<UdtEndpoint> {
        let by_ip = self.endpoints.get_mut(&addr.port())?;
        let endpoint = by_ip.remove(&addr.ip());
        if by_ip.is_empty() {
            self.endpoints.remove(&addr.port());
        }
        endpoint
    }

    pub fn len(&self) -> usize {
        self.endpoints.values().map(|by_ip| by_ip.len()).sum()
    }
}

#[derive(Debug)]
pub(crate) struct UdtState {
    pub endpoints: EndpointRegistry,
    pub core: UdtCore,
}

impl UdtState {
    fn new() -> Self {
        Self {
            endpoints: EndpointRegistry::default(),
            core: UdtCore::new(),
        }
    }

    /// The endpoint serving `addr`, bound and started if needed.
    fn endpoint_for(
        &mut self,
        shared: &Weak<Shared>,
        addr: SocketAddr,
        configuration: &UdtConfiguration,
    ) -> Result<SocketAddr> {
        if let Some(existing) = self.endpoints.lookup(&addr)? {
            return Ok(existing);
        }
        let mut endpoint = UdtEndpoint::bind(addr, configuration)?;
        let local_addr = endpoint.local_addr();
        endpoint.attach_workers([
            tokio::spawn(receive_worker(
                shared.clone(),
                endpoint.udp_socket(),
                local_addr,
            )),
            tokio::spawn(maintenance_worker(
                shared.clone(),
                local_addr,
                configuration.syn_interval,
            )),
        ]);
        self.endpoints.insert(endpoint);
        Ok(local_addr)
    }

    /// Endpoint owning the socket, with the context core.
    pub fn socket_endpoint(
        &mut self,
        socket_id: SocketId,
    ) -> Result<(&mut UdtEndpoint, &mut UdtCore)> {
        let addr = self
            .core
            .routes
            .get(&socket_id)
            .copied()
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "connection is closed"))?;
        let endpoint = self
            .endpoints
            .get_mut(&addr)
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "endpoint is closed"))?;
        Ok((endpoint, &mut self.core))
    }

    /// Applies a pending transport failure and releases the endpoint once unused.
    pub fn settle(&mut self, addr: SocketAddr) {
        let release = match self.endpoints.get_mut(&addr) {
            Some(endpoint) => {
                if let Some(err) = endpoint.take_failure() {
                    endpoint.fail(&mut self.core, &err);
                }
                endpoint.is_idle()
            }
            None => false,
        };
        if release {
            debug!("releasing udt endpoint {}", addr);
            self.endpoints.remove(&addr);
        }
    }

    pub fn receive(&mut self, addr: SocketAddr, raw: &[u8], from: SocketAddr, now: Instant) {
        if let Some(endpoint) = self.endpoints.get_mut(&addr) {
            endpoint.receive(&mut self.core, raw, from, now);
        }
        self.settle(addr);
    }

    pub fn on_timer(&mut self, addr: SocketAddr, now: Instant) {
        if let Some(endpoint) = self.endpoints.get_mut(&addr) {
            endpoint.on_timer(&mut self.core, now);
        }
        self.settle(addr);
    }

    pub fn fail(&mut self, addr: SocketAddr, err: Error) {
        if let Some(mut endpoint) = self.endpoints.remove(&addr) {
            endpoint.fail(&mut self.core, &err);
        }
    }

    pub fn transmit(&mut self, socket_id: SocketId, now: Instant) {
        let addr = match self.core.routes.get(&socket_id) {
            Some(addr) => *addr,
            None => return,
        };
        if let Some(endpoint) = self.endpoints.get_mut(&addr) {
            endpoint.transmit(&mut self.core, socket_id, now);
        }
        self.settle(addr);
    }
}

#[derive(Debug)]
pub(crate) struct Shared {
    state: Mutex<UdtState>,
    notify: Arc<Notify>,
}

impl Shared {
    /// Every protocol step runs under this lock and never awaits while holding it.
    pub fn lock(&self) -> MutexGuard<'_, UdtState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn wake_scheduler(&self) {
        self.notify.notify_one();
    }
}

/// A protocol context: the endpoints bound through it and the scheduler pacing
/// all their connections. Cheap to clone; workers stop once every clone,
/// connection and listener is dropped.
///
/// Must be created from within a tokio runtime.
#[derive(Debug, Clone)]
pub struct Udt {
    inner: Arc<Shared>,
}

impl Default for Udt {
    fn default() -> Self {
        Self::new()
    }
}

impl Udt {
    pub fn new() -> Self {
        let notify = Arc::new(Notify::new());
        let inner = Arc::new(Shared {
            state: Mutex::new(UdtState::new()),
            notify: notify.clone(),
        });
        tokio::spawn(scheduler_worker(Arc::downgrade(&inner), notify));
        Self { inner }
    }

    /// Number of UDP sockets currently open.
    pub fn endpoint_count(&self) -> usize {
        self.inner.lock().endpoints.len()
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.inner
    }

    pub(crate) fn open_socket(
        &self,
        local: SocketAddr,
        configuration: UdtConfiguration,
    ) -> Result<(SocketId, SocketReceivers)> {
        let mut state = self.inner.lock();
        let addr = state.endpoint_for(&Arc::downgrade(&self.inner), local, &configuration)?;
        let UdtState { endpoints, core } = &mut *state;
        let endpoint = endpoints
            .get_mut(&addr)
            .ok_or_else(|| Error::new(ErrorKind::Other, "endpoint vanished"))?;
        let socket_id = core.new_socket_id();
        let (channels, receivers) = socket_channels();
        endpoint.add_socket(core, UdtSocket::new(socket_id, configuration, channels));
        Ok((socket_id, receivers))
    }

    pub(crate) fn listen(
        &self,
        local: SocketAddr,
        configuration: UdtConfiguration,
    ) -> Result<(SocketAddr, mpsc::UnboundedReceiver<ListenerSignal>)> {
        let mut state = self.inner.lock();
        let addr = state.endpoint_for(&Arc::downgrade(&self.inner), local, &configuration)?;
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let result = match state.endpoints.get_mut(&addr) {
            Some(endpoint) => endpoint.listen(signals_tx, configuration),
            None => Err(Error::new(ErrorKind::Other, "endpoint vanished")),
        };
        // a refused listener must not keep a fresh endpoint alive
        state.settle(addr);
        result.map(|_| (addr, signals_rx))
    }

    pub(crate) fn close_listener(&self, local: SocketAddr) {
        let mut state = self.inner.lock();
        if let Some(endpoint) = state.endpoints.get_mut(&local) {
            endpoint.close_listener();
        }
        state.settle(local);
    }
}
