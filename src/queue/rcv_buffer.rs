use crate::seq_number::SeqNumber;
use bytes::Bytes;
use std::collections::HashMap;

/// Reorders incoming payloads and releases them once contiguous.
#[derive(Debug)]
pub(crate) struct RcvBuffer {
    packets: HashMap<SeqNumber, Bytes>,
    max_size: u32,
    next_to_read: SeqNumber,
}

impl RcvBuffer {
    pub fn new(max_size: u32, initial_seq_number: SeqNumber) -> Self {
        Self {
            max_size,
            packets: HashMap::new(),
            next_to_read: initial_seq_number,
        }
    }

    pub fn get_available_buf_size(&self) -> u32 {
        self.max_size.saturating_sub(self.packets.len() as u32)
    }

    /// First sequence number not received yet; everything before it was delivered.
    pub fn next_to_read(&self) -> SeqNumber {
        self.next_to_read
    }

    /// Stores a payload. Returns false for duplicates, stale packets and when full.
    pub fn insert(&mut self, seq_number: SeqNumber, data: Bytes) -> bool {
        if seq_number - self.next_to_read < 0 || self.packets.contains_key(&seq_number) {
            return false;
        }
        if seq_number != self.next_to_read && self.get_available_buf_size() == 0 {
            return false;
        }
        self.packets.insert(seq_number, data);
        true
    }

    /// Pops the payloads that are now contiguous, in sequence order.
    pub fn drain_ready(&mut self) -> Vec<Bytes> {
        let mut ready = vec![];
        while let Some(data) = self.packets.remove(&self.next_to_read) {
            ready.push(data);
            self.next_to_read = self.next_to_read + 1;
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_order_once_gap_is_filled() {
        let mut buffer = RcvBuffer::new(16, SeqNumber::max());
        assert!(buffer.insert(1.into(), Bytes::from_static(b"c")));
        assert!(buffer.insert(SeqNumber::max(), Bytes::from_static(b"a")));
        assert_eq!(buffer.drain_ready(), vec![Bytes::from_static(b"a")]);
        assert!(!buffer.insert(SeqNumber::max(), Bytes::from_static(b"a")));
        assert!(buffer.insert(0.into(), Bytes::from_static(b"b")));
        assert!(!buffer.insert(1.into(), Bytes::from_static(b"c")));
        assert_eq!(
            buffer.drain_ready(),
            vec![Bytes::from_static(b"b"), Bytes::from_static(b"c")]
        );
        assert_eq!(buffer.next_to_read().number(), 2);
    }

    #[test]
    fn refuses_when_full() {
        let mut buffer = RcvBuffer::new(1, 0.into());
        assert!(buffer.insert(5.into(), Bytes::new()));
        assert!(!buffer.insert(6.into(), Bytes::new()));
        assert_eq!(buffer.get_available_buf_size(), 0);
    }
}
