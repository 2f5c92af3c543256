use std::collections::VecDeque;
use tokio::time::{Duration, Instant};

pub(crate) const HISTORY_WINDOW_SIZE: usize = 16;
pub const PROBE_MODULO: u32 = 16;

/// Receiver-side link measurements of one connection: packet arrival history,
/// packet-pair intervals and the smoothed round trip time.
#[derive(Debug)]
pub(crate) struct UdtFlow {
    // Both windows are most-recent-first.
    arrival_window: VecDeque<Duration>,
    probe_window: VecDeque<Duration>,
    last_arrival_time: Option<Instant>,
    last_probe_time: Option<Instant>,
    pub rtt: Duration,
    pub rtt_var: Duration,
}

impl Default for UdtFlow {
    fn default() -> Self {
        Self {
            last_arrival_time: None,
            arrival_window: VecDeque::with_capacity(HISTORY_WINDOW_SIZE),
            last_probe_time: None,
            probe_window: VecDeque::with_capacity(HISTORY_WINDOW_SIZE),
            rtt: Duration::from_millis(100),
            rtt_var: Duration::from_millis(50),
        }
    }
}

fn push_recent(window: &mut VecDeque<Duration>, value: Duration) {
    if window.len() == HISTORY_WINDOW_SIZE {
        window.pop_back();
    }
    window.push_front(value);
}

impl UdtFlow {
    /// Records a data packet arrival. Every packet whose sequence is `16n + 1`
    /// also closes a packet-pair sample started by the previous marker.
    pub fn on_pkt_arrival(&mut self, seq_number: u32, now: Instant) {
        if let Some(last) = self.last_arrival_time {
            push_recent(&mut self.arrival_window, now - last);
        }
        self.last_arrival_time = Some(now);

        if seq_number % PROBE_MODULO == 1 {
            if let Some(last_probe) = self.last_probe_time {
                push_recent(&mut self.probe_window, now - last_probe);
            }
            self.last_probe_time = Some(now);
        }
    }

    #[cfg(test)]
    pub fn arrival_history(&self) -> &VecDeque<Duration> {
        &self.arrival_window
    }

    #[cfg(test)]
    pub fn probe_history(&self) -> &VecDeque<Duration> {
        &self.probe_window
    }

    /// Returns a number of packets per second
    pub fn get_pkt_rcv_speed(&self) -> u32 {
        if self.arrival_window.len() < HISTORY_WINDOW_SIZE / 2 {
            return 0;
        }
        filtered_rate(&self.arrival_window, 1)
    }

    /// Estimated link capacity in packets per second.
    pub fn get_bandwidth(&self) -> u32 {
        if self.probe_window.is_empty() {
            return 0;
        }
        filtered_rate(&self.probe_window, PROBE_MODULO)
    }

    pub fn update_rtt(&mut self, sample: Duration) {
        let diff = if sample > self.rtt {
            sample - self.rtt
        } else {
            self.rtt - sample
        };
        self.rtt_var = (3 * self.rtt_var + diff) / 4;
        self.rtt = (7 * self.rtt + sample) / 8;
    }
}

/// Median-filtered rate: intervals farther than 8x from the median are ignored.
fn filtered_rate(window: &VecDeque<Duration>, packets_per_interval: u32) -> u32 {
    let mut values: Vec<_> = window.iter().copied().collect();
    let length = values.len();
    let (_, median, _) = values.select_nth_unstable(length / 2);
    let median = *median;
    let kept: Vec<_> = values
        .into_iter()
        .filter(|x| *x > median / 8 && *x < median * 8)
        .collect();
    let total_duration: Duration = kept.iter().sum();
    if total_duration.is_zero() {
        return 0;
    }
    ((kept.len() as u32 * packets_per_interval) as f64 / total_duration.as_secs_f64()).ceil()
        as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_pair_only_on_markers() {
        let mut flow = UdtFlow::default();
        let start = Instant::now();
        for seq in 0..40u32 {
            flow.on_pkt_arrival(seq, start + Duration::from_millis(seq as u64));
        }
        // markers at 1, 17 and 33
        assert_eq!(flow.probe_history().len(), 2);
        assert_eq!(flow.probe_history()[0], Duration::from_millis(16));
        assert_eq!(flow.arrival_history().len(), HISTORY_WINDOW_SIZE);
        assert!((999..=1001).contains(&flow.get_pkt_rcv_speed()));
        assert!((999..=1001).contains(&flow.get_bandwidth()));
    }

    #[test]
    fn rtt_is_smoothed() {
        let mut flow = UdtFlow::default();
        flow.update_rtt(Duration::from_millis(20));
        assert_eq!(flow.rtt, Duration::from_millis(90));
        assert_eq!(flow.rtt_var, Duration::from_micros(57_500));
    }
}
