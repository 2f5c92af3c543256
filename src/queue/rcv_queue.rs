use crate::udt::Shared;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::io::ErrorKind;
use tokio::net::UdpSocket;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::trace;

/// Largest UDP payload. Connections sharing an endpoint may negotiate
/// different packet sizes, so reads never assume one.
const MAX_DATAGRAM_SIZE: usize = 65536;

/// Reads datagrams off one endpoint's UDP socket and hands them to the protocol.
pub(crate) async fn receive_worker(
    shared: Weak<Shared>,
    channel: Arc<UdpSocket>,
    local_addr: SocketAddr,
) {
    let mut buf = vec![0_u8; MAX_DATAGRAM_SIZE];
    loop {
        let result = channel.recv_from(&mut buf).await;
        let shared = match shared.upgrade() {
            Some(shared) => shared,
            None => break,
        };
        match result {
            Ok((size, from)) => {
                shared
                    .lock()
                    .receive(local_addr, &buf[..size], from, Instant::now());
            }
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused
                ) =>
            {
                trace!("ignoring icmp error on {}: {}", local_addr, err);
                continue;
            }
            Err(err) => {
                shared.lock().fail(local_addr, err);
                break;
            }
        }
        shared.wake_scheduler();
    }
}

/// ACK, NAK, EXP and handshake retries, on a fixed cadence independent of traffic.
pub(crate) async fn maintenance_worker(
    shared: Weak<Shared>,
    local_addr: SocketAddr,
    period: Duration,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let shared = match shared.upgrade() {
            Some(shared) => shared,
            None => break,
        };
        shared.lock().on_timer(local_addr, Instant::now());
        shared.wake_scheduler();
    }
}
