use crate::heap::PriorityQueue;
use crate::socket::SocketId;
use crate::timer::sleep_until;
use crate::udt::Shared;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

const IDLE_RECHECK: Duration = Duration::from_millis(100);

/// Serves the scheduler: one packet for the earliest due connection per pass,
/// across every endpoint of the context.
pub(crate) async fn scheduler_worker(shared: Weak<Shared>, notify: Arc<Notify>) {
    loop {
        let deadline = {
            let shared = match shared.upgrade() {
                Some(shared) => shared,
                None => break,
            };
            let mut state = shared.lock();
            let now = Instant::now();
            match state.core.scheduler.pop_due(now) {
                Some(socket_id) => {
                    state.transmit(socket_id, now);
                    None
                }
                None => Some(
                    state
                        .core
                        .scheduler
                        .next_deadline()
                        .map_or(now + IDLE_RECHECK, |d| d.min(now + IDLE_RECHECK)),
                ),
            }
        };
        match deadline {
            None => tokio::task::yield_now().await,
            Some(deadline) => {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = sleep_until(deadline) => {}
                }
            }
        }
    }
}

/// Time-ordered queue of connections with output pending.
/// Earliest eligible send time is served first, one packet per pass.
#[derive(Debug)]
pub(crate) struct UdtSndQueue {
    sockets: PriorityQueue<SocketId, Instant>,
}

impl Default for UdtSndQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl UdtSndQueue {
    pub fn new() -> Self {
        Self {
            sockets: PriorityQueue::new(),
        }
    }

    /// Inserts the socket, or moves its entry to `not_before`.
    pub fn schedule(&mut self, socket_id: SocketId, not_before: Instant) {
        self.sockets.push(socket_id, not_before);
    }

    /// Inserts the socket unless it already waits in the queue, keeping its pacing.
    pub fn schedule_if_idle(&mut self, socket_id: SocketId, not_before: Instant) {
        if !self.sockets.contains(&socket_id) {
            self.sockets.push(socket_id, not_before);
        }
    }

    pub fn remove(&mut self, socket_id: SocketId) {
        self.sockets.remove(&socket_id);
    }

    #[cfg(test)]
    pub fn is_scheduled(&self, socket_id: SocketId) -> bool {
        self.sockets.contains(&socket_id)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.sockets.peek().map(|(_, ts)| *ts)
    }

    /// Pops the earliest socket if its time has come.
    pub fn pop_due(&mut self, now: Instant) -> Option<SocketId> {
        match self.sockets.peek() {
            Some((_, ts)) if *ts <= now => self.sockets.pop().map(|(id, _)| id),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sockets.len()
    }
}
