use crate::seq_number::{AckSeqNumber, SeqNumber};
use std::collections::VecDeque;
use tokio::time::{Duration, Instant};

pub(crate) const ACK_HISTORY_SIZE: usize = 16;

/// Most-recent-first ring of the full ACKs sent out, used to turn an ACK-ACK
/// into a round trip time sample.
#[derive(Debug)]
pub(crate) struct AckWindow {
    size: usize,
    acks: VecDeque<(AckSeqNumber, SeqNumber, Instant)>,
}

impl Default for AckWindow {
    fn default() -> Self {
        Self::new(ACK_HISTORY_SIZE)
    }
}

impl AckWindow {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            acks: VecDeque::with_capacity(size),
        }
    }

    pub fn store(&mut self, seq: SeqNumber, ack: AckSeqNumber) {
        if self.acks.len() >= self.size {
            self.acks.pop_back();
        }
        self.acks.push_front((ack, seq, Instant::now()));
    }

    /// Returns the acknowledged sequence and the time elapsed since the ACK was sent.
    pub fn get(&self, ack: AckSeqNumber) -> Option<(SeqNumber, Duration)> {
        self.acks
            .iter()
            .find(|(number, _, _)| *number == ack)
            .map(|(_, seq, ts)| (*seq, ts.elapsed()))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.acks.len()
    }
}
