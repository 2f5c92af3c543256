use crate::data_packet::{PacketPosition, UdtDataPacket, UdtDataPacketHeader};
use crate::loss_list::LossList;
use crate::seq_number::{MsgNumber, SeqNumber};
use crate::socket::SocketId;
use bytes::Bytes;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub(crate) struct SndBufferBlock {
    data: Bytes,
    msg_number: MsgNumber,
    in_order: bool,
    position: PacketPosition,
}

impl SndBufferBlock {
    pub fn as_data_packet(
        &self,
        seq_number: SeqNumber,
        dest_socket_id: SocketId,
        timestamp: u32,
    ) -> UdtDataPacket {
        UdtDataPacket {
            data: self.data.clone(),
            header: UdtDataPacketHeader {
                msg_number: self.msg_number,
                dest_socket_id,
                seq_number,
                in_order: self.in_order,
                position: self.position,
                timestamp,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SentBlock {
    pub seq_number: SeqNumber,
    pub block: SndBufferBlock,
}

/// Outgoing side of a connection.
///
/// `pending` holds messages not sent yet, each one a list of fragments.
/// `sent` holds the unacknowledged fragments split in generations, oldest
/// first; a new generation opens exactly when the sequence number wraps to 0,
/// so each generation is sorted by raw sequence number.
#[derive(Debug)]
pub(crate) struct SndBuffer {
    pending: VecDeque<VecDeque<SndBufferBlock>>,
    sent: VecDeque<Vec<SentBlock>>,
    loss_list: LossList,
    payload_size: usize,
    next_msg_number: MsgNumber,
    sequence: SeqNumber,
    flow_window_size: u32,
}

impl SndBuffer {
    pub fn new(payload_size: usize, initial_seq_number: SeqNumber) -> Self {
        Self {
            pending: VecDeque::new(),
            sent: VecDeque::from([Vec::new()]),
            loss_list: LossList::new(),
            payload_size: payload_size.max(1),
            next_msg_number: 1.into(),
            sequence: initial_seq_number,
            flow_window_size: 0,
        }
    }

    pub fn set_payload_size(&mut self, payload_size: usize) {
        self.payload_size = payload_size.max(1);
    }

    pub fn add_message(&mut self, data: &[u8]) -> usize {
        let msg_number = self.next_msg_number;
        let chunks = data.chunks(self.payload_size);
        let chunks_len = chunks.len();
        let message: VecDeque<_> = chunks
            .enumerate()
            .map(|(idx, chunk)| SndBufferBlock {
                data: Bytes::copy_from_slice(chunk),
                msg_number,
                in_order: true,
                position: PacketPosition::new(idx, chunks_len),
            })
            .collect();
        if !message.is_empty() {
            self.pending.push_back(message);
        }
        // message numbers restart at 1
        self.next_msg_number = match self.next_msg_number + 1 {
            n if n == MsgNumber::zero() => 1.into(),
            n => n,
        };
        chunks_len
    }

    /// Next sequence number to assign.
    #[cfg(test)]
    pub fn sequence(&self) -> SeqNumber {
        self.sequence
    }

    pub fn flow_window_size(&self) -> u32 {
        self.flow_window_size
    }

    #[cfg(test)]
    pub fn generations(&self) -> usize {
        self.sent.len()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.iter().any(|msg| !msg.is_empty())
    }

    pub fn has_retransmissions(&self) -> bool {
        !self.loss_list.is_empty()
    }

    /// Whether `next_block` would return something for this window.
    pub fn has_data_to_send(&self, window: u32) -> bool {
        self.has_retransmissions() || (self.has_pending() && self.flow_window_size < window)
    }

    /// Picks the next fragment to put on the wire: a reported loss first,
    /// otherwise a fresh fragment if the window allows it.
    /// Returns the sequence number to use and whether it is a retransmission.
    pub fn next_block(&mut self, window: u32) -> Option<(SeqNumber, SndBufferBlock, bool)> {
        while let Some(seq) = self.loss_list.pop_after(self.first_unacked()) {
            if let Some(sent) = self.find_sent(seq) {
                return Some((seq, sent.block.clone(), true));
            }
        }

        if self.flow_window_size >= window {
            return None;
        }
        while self.pending.front().map(|msg| msg.is_empty()).unwrap_or(false) {
            self.pending.pop_front();
        }
        let block = self.pending.front_mut()?.pop_front()?;

        let seq_number = self.sequence;
        self.append_sent(SentBlock {
            seq_number,
            block: block.clone(),
        });
        self.sequence = self.sequence + 1;
        if self.sequence == SeqNumber::zero() {
            self.sent.push_back(Vec::new());
        }
        self.flow_window_size += 1;
        Some((seq_number, block, false))
    }

    fn append_sent(&mut self, sent: SentBlock) {
        match self.sent.back_mut() {
            Some(generation) => generation.push(sent),
            None => self.sent.push_back(vec![sent]),
        }
    }

    fn first_unacked(&self) -> SeqNumber {
        self.sent
            .iter()
            .find_map(|generation| generation.first())
            .map(|sent| sent.seq_number)
            .unwrap_or(self.sequence)
    }

    pub fn find_sent(&self, seq: SeqNumber) -> Option<&SentBlock> {
        self.sent.iter().find_map(|generation| {
            generation
                .binary_search_by(|sent| (sent.seq_number - seq).cmp(&0))
                .ok()
                .map(|idx| &generation[idx])
        })
    }

    /// Drops every fragment sent before `ack` and returns how many were removed.
    /// Acknowledging the same number twice removes nothing the second time.
    pub fn ack(&mut self, ack: SeqNumber) -> usize {
        let mut acked = 0;
        while let Some(generation) = self.sent.front_mut() {
            let idx = generation.partition_point(|sent| ack - sent.seq_number > 0);
            generation.drain(..idx);
            acked += idx;
            if generation.is_empty() && self.sent.len() > 1 {
                self.sent.pop_front();
                continue;
            }
            break;
        }
        self.flow_window_size = self.flow_window_size.saturating_sub(acked as u32);
        acked
    }

    pub fn on_loss(&mut self, start: SeqNumber, end: SeqNumber) {
        self.loss_list.insert(start, end);
    }

    /// Queues every outstanding fragment for retransmission.
    pub fn expire_all(&mut self) {
        let ranges: Vec<_> = self
            .sent
            .iter()
            .filter_map(|generation| Some((generation.first()?, generation.last()?)))
            .map(|(first, last)| (first.seq_number, last.seq_number))
            .collect();
        for (first, last) in ranges {
            self.loss_list.insert(first, last);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send_all(buffer: &mut SndBuffer) -> Vec<SeqNumber> {
        std::iter::from_fn(|| buffer.next_block(u32::MAX))
            .map(|(seq, _, _)| seq)
            .collect()
    }

    #[test]
    fn fragments_by_payload_size() {
        let mut buffer = SndBuffer::new(1468, 10.into());
        assert_eq!(buffer.add_message(&[7u8; 4096]), 3);
        let blocks: Vec<_> = std::iter::from_fn(|| buffer.next_block(u32::MAX)).collect();
        let sizes: Vec<_> = blocks.iter().map(|(_, b, _)| b.data.len()).collect();
        assert_eq!(sizes, vec![1468, 1468, 1160]);
        let positions: Vec<_> = blocks.iter().map(|(_, b, _)| b.position).collect();
        assert_eq!(
            positions,
            vec![PacketPosition::First, PacketPosition::Middle, PacketPosition::Last]
        );
        assert_eq!(buffer.flow_window_size(), 3);
        assert_eq!(buffer.sequence().number(), 13);
    }

    #[test]
    fn ack_removes_prefix_and_is_idempotent() {
        let mut buffer = SndBuffer::new(1, 100.into());
        buffer.add_message(&[0u8; 5]);
        send_all(&mut buffer);
        assert_eq!(buffer.ack(103.into()), 3);
        assert_eq!(buffer.flow_window_size(), 2);
        assert_eq!(buffer.ack(103.into()), 0);
        assert_eq!(buffer.ack(101.into()), 0);
        assert_eq!(buffer.flow_window_size(), 2);
        assert!(buffer.find_sent(102.into()).is_none());
        assert!(buffer.find_sent(103.into()).is_some());
    }

    #[test]
    fn new_generation_on_wrap() {
        let mut buffer = SndBuffer::new(1, SeqNumber::max() - 1);
        buffer.add_message(&[0u8; 4]);
        let seqs: Vec<_> = send_all(&mut buffer).iter().map(|s| s.number()).collect();
        assert_eq!(seqs, vec![0x7fff_fffe, 0x7fff_ffff, 0, 1]);
        assert_eq!(buffer.generations(), 2);

        // acknowledging 1 covers the whole old generation plus sequence 0
        assert_eq!(buffer.ack(1.into()), 3);
        assert_eq!(buffer.generations(), 1);
        assert_eq!(buffer.flow_window_size(), 1);
    }

    #[test]
    fn window_gates_new_fragments_but_not_retransmissions() {
        let mut buffer = SndBuffer::new(1, 0.into());
        buffer.add_message(&[0u8; 4]);
        assert!(buffer.next_block(2).is_some());
        assert!(buffer.next_block(2).is_some());
        assert!(buffer.next_block(2).is_none());
        assert!(!buffer.has_data_to_send(2));

        buffer.on_loss(1.into(), 1.into());
        assert!(buffer.has_data_to_send(2));
        let (seq, _, retransmit) = buffer.next_block(2).unwrap();
        assert_eq!(seq.number(), 1);
        assert!(retransmit);
        assert_eq!(buffer.flow_window_size(), 2);
    }

    #[test]
    fn acked_losses_are_skipped() {
        let mut buffer = SndBuffer::new(1, 0.into());
        buffer.add_message(&[0u8; 3]);
        send_all(&mut buffer);
        buffer.expire_all();
        buffer.ack(2.into());
        let (seq, _, retransmit) = buffer.next_block(0).unwrap();
        assert_eq!((seq.number(), retransmit), (2, true));
        assert!(buffer.next_block(0).is_none());
    }
}
