use crate::ack_window::AckWindow;
use crate::flow::UdtFlow;
use crate::loss_list::LossList;
use crate::seq_number::{AckSeqNumber, SeqNumber};
use tokio::time::{Duration, Instant};

const MIN_NAK_INTERVAL: Duration = Duration::from_millis(20);
const MIN_EXP_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Debug)]
pub(crate) struct SocketState {
    pub last_rsp_time: Instant,
    pub last_exp_time: Instant,
    pub exp_count: u32,
    pub last_snd_time: Instant,

    // Receiving related
    /// Last received sequence number: everything up to it was either
    /// received or sits in `rcv_loss_list`.
    pub lrsn: SeqNumber,
    pub rcv_loss_list: LossList,
    pub last_sent_ack: SeqNumber,
    pub last_sent_ack_time: Instant,
    pub last_ack_seq_number: AckSeqNumber,
    pub last_nak_time: Instant,
    pub light_ack_counter: usize,
    pub ack_window: AckWindow,
    pub flow: UdtFlow,
}

impl SocketState {
    /// `peer_isn` is the first sequence number the peer will send.
    pub fn new(peer_isn: SeqNumber) -> Self {
        let now = Instant::now();
        Self {
            last_rsp_time: now,
            last_exp_time: now,
            exp_count: 1,
            last_snd_time: now,
            lrsn: peer_isn - 1,
            rcv_loss_list: LossList::new(),
            last_sent_ack: peer_isn,
            last_sent_ack_time: now,
            last_ack_seq_number: AckSeqNumber::zero(),
            last_nak_time: now,
            light_ack_counter: 0,
            ack_window: AckWindow::default(),
            flow: UdtFlow::default(),
        }
    }

    /// Loss detection on data arrival. Returns the gap newly found lost, if any.
    pub fn on_data_seq(&mut self, seq: SeqNumber) -> Option<(SeqNumber, SeqNumber)> {
        let distance = seq - self.lrsn;
        let mut gap = None;
        if distance > 1 {
            let first = self.lrsn + 1;
            let last = seq - 1;
            self.rcv_loss_list.insert(first, last);
            gap = Some((first, last));
        } else if distance < 0 {
            self.rcv_loss_list.remove(seq);
        }
        if distance > 0 {
            self.lrsn = seq;
        }
        gap
    }

    pub fn on_peer_activity(&mut self, now: Instant) {
        self.last_rsp_time = now;
        self.exp_count = 1;
    }

    pub fn next_ack_number(&mut self) -> AckSeqNumber {
        self.last_ack_seq_number = self.last_ack_seq_number + 1;
        self.last_ack_seq_number
    }

    pub fn nak_interval(&self) -> Duration {
        std::cmp::max(self.flow.rtt + 4 * self.flow.rtt_var, MIN_NAK_INTERVAL)
    }

    pub fn exp_interval(&self, syn_interval: Duration) -> Duration {
        let base = self.flow.rtt + 4 * self.flow.rtt_var + syn_interval;
        std::cmp::max(self.exp_count * base, self.exp_count * MIN_EXP_INTERVAL)
    }
}
