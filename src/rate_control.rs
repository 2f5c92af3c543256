use crate::seq_number::SeqNumber;
use std::fmt::Debug;
use tokio::time::Duration;

const INITIAL_WINDOW_SIZE: f64 = 16.0;
const MIN_WINDOW_SIZE: f64 = 1.0;
const INCREASE_FACTOR: f64 = 1.125;
const SLOW_START_PERIOD: Duration = Duration::from_micros(1);

/// Turns protocol feedback into a congestion window and an inter-packet send period.
pub trait CongestionControl: Debug + Send {
    /// An ACK acknowledging everything before `ack` arrived.
    fn on_ack(&mut self, ack: SeqNumber);
    /// A NAK reported the given inclusive ranges as lost.
    fn on_loss(&mut self, losses: &[(SeqNumber, SeqNumber)]);
    /// Outstanding data was not acknowledged in time.
    fn on_timeout(&mut self);
    fn set_rtt(&mut self, rtt: Duration);
    /// Link capacity estimate from packet-pair probing, packets per second.
    fn set_bandwidth(&mut self, pkt_per_sec: u32);
    /// Delivery rate observed by the peer, packets per second.
    fn set_rcv_rate(&mut self, pkt_per_sec: u32);
    fn get_congestion_window_size(&self) -> u32;
    fn get_pkt_send_period(&self) -> Duration;
}

/// Default AIMD policy: slow start until the first loss, then multiplicative
/// increase bounded by the estimated bandwidth-delay product and halving on loss.
#[derive(Debug)]
pub(crate) struct RateControl {
    pkt_send_period: Duration,
    congestion_window_size: f64,
    max_window_size: f64,
    recv_rate: u32,
    bandwidth: u32,
    rtt: Duration,
    rc_interval: Duration,
    slow_start: bool,
    last_ack: Option<SeqNumber>,
}

impl RateControl {
    pub fn new(max_window_size: u32, rc_interval: Duration) -> Self {
        Self {
            pkt_send_period: SLOW_START_PERIOD,
            congestion_window_size: INITIAL_WINDOW_SIZE,
            max_window_size: (max_window_size as f64).max(MIN_WINDOW_SIZE),
            recv_rate: 0,
            bandwidth: 0,
            rtt: Duration::from_millis(100),
            rc_interval,
            slow_start: true,
            last_ack: None,
        }
    }

    fn window_ceiling(&self) -> f64 {
        if self.bandwidth == 0 {
            return self.max_window_size;
        }
        let bdp = self.bandwidth as f64 * (self.rtt + self.rc_interval).as_secs_f64();
        bdp.max(INITIAL_WINDOW_SIZE).min(self.max_window_size)
    }

    fn update_period(&mut self) {
        self.pkt_send_period = self.rtt / self.congestion_window_size.max(MIN_WINDOW_SIZE) as u32;
    }
}

impl CongestionControl for RateControl {
    fn on_ack(&mut self, ack: SeqNumber) {
        let newly_acked = match self.last_ack {
            Some(last) => ack - last,
            None => {
                self.last_ack = Some(ack);
                return;
            }
        };
        if newly_acked <= 0 {
            return;
        }
        self.last_ack = Some(ack);

        if self.slow_start {
            self.congestion_window_size += newly_acked as f64;
            if self.congestion_window_size >= self.max_window_size {
                self.congestion_window_size = self.max_window_size;
                self.slow_start = false;
                self.update_period();
            }
            return;
        }
        self.congestion_window_size =
            (self.congestion_window_size * INCREASE_FACTOR).min(self.window_ceiling());
        self.update_period();
    }

    fn on_loss(&mut self, losses: &[(SeqNumber, SeqNumber)]) {
        if losses.is_empty() {
            return;
        }
        self.slow_start = false;
        self.congestion_window_size = (self.congestion_window_size / 2.0).max(MIN_WINDOW_SIZE);
        self.update_period();
    }

    fn on_timeout(&mut self) {
        if self.slow_start {
            self.slow_start = false;
            if self.recv_rate > 0 {
                self.pkt_send_period = Duration::from_secs_f64(1.0 / self.recv_rate as f64);
            } else {
                self.pkt_send_period =
                    (self.rtt + self.rc_interval).div_f64(self.congestion_window_size);
            }
        }
    }

    fn set_rtt(&mut self, rtt: Duration) {
        if !rtt.is_zero() {
            self.rtt = rtt;
        }
    }

    fn set_bandwidth(&mut self, pkt_per_sec: u32) {
        self.bandwidth = pkt_per_sec;
    }

    fn set_rcv_rate(&mut self, pkt_per_sec: u32) {
        self.recv_rate = pkt_per_sec;
    }

    fn get_congestion_window_size(&self) -> u32 {
        self.congestion_window_size as u32
    }

    fn get_pkt_send_period(&self) -> Duration {
        self.pkt_send_period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control() -> RateControl {
        RateControl::new(8192, Duration::from_millis(10))
    }

    #[test]
    fn starts_at_sixteen_packets() {
        let rc = control();
        assert_eq!(rc.get_congestion_window_size(), 16);
        assert_eq!(rc.get_pkt_send_period(), SLOW_START_PERIOD);
    }

    #[test]
    fn loss_halves_window_down_to_one() {
        let mut rc = control();
        rc.set_rtt(Duration::from_millis(80));
        let loss = [(SeqNumber::from(5), SeqNumber::from(5))];
        rc.on_loss(&loss);
        assert_eq!(rc.get_congestion_window_size(), 8);
        assert_eq!(rc.get_pkt_send_period(), Duration::from_millis(10));
        for _ in 0..10 {
            rc.on_loss(&loss);
        }
        assert_eq!(rc.get_congestion_window_size(), 1);
        assert_eq!(rc.get_pkt_send_period(), Duration::from_millis(80));
    }

    #[test]
    fn ack_grows_window_within_bandwidth() {
        let mut rc = control();
        rc.on_ack(100.into());
        rc.on_ack(110.into());
        assert_eq!(rc.get_congestion_window_size(), 26);
        rc.on_loss(&[(SeqNumber::from(111), SeqNumber::from(111))]);
        rc.set_bandwidth(100);
        rc.set_rtt(Duration::from_millis(190));
        for seq in 120..200 {
            rc.on_ack(seq.into());
        }
        // 100 pkt/s over 200ms
        assert_eq!(rc.get_congestion_window_size(), 20);
        // duplicate ack is ignored
        rc.on_ack(150.into());
        assert_eq!(rc.get_congestion_window_size(), 20);
    }
}
