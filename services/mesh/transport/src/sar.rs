//! Segmentation and reassembly (SAR) configuration and the timers derived
//! from it.

use mesh_wire::address;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// SAR Transmitter and SAR Receiver states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SarConfig {
    /// Segment interval step; interval is `(step + 1) * 10` ms
    pub seg_interval_step: u8,
    /// Retransmissions of segments to a unicast destination
    pub unicast_retrans_count: u8,
    /// Retransmissions to a unicast destination without progress
    pub unicast_retrans_without_progress_count: u8,
    /// Unicast retransmission interval step; `(step + 1) * 25` ms
    pub unicast_retrans_interval_step: u8,
    /// Unicast retransmission interval increment per hop; `(inc + 1) * 25` ms
    pub unicast_retrans_interval_increment: u8,
    /// Retransmissions of segments to a group destination
    pub multicast_retrans_count: u8,
    /// Multicast retransmission interval step; `(step + 1) * 25` ms
    pub multicast_retrans_interval_step: u8,
    /// Segments threshold above which acknowledgments are retransmitted
    pub segments_threshold: u8,
    /// Acknowledgment delay increment
    pub ack_delay_increment: u8,
    /// Discard timeout; `(value + 1) * 5` s
    pub discard_timeout: u8,
    /// Receiver segment interval step; `(step + 1) * 10` ms
    pub receiver_seg_interval_step: u8,
    /// Acknowledgment retransmissions
    pub ack_retrans_count: u8,
}

impl Default for SarConfig {
    fn default() -> Self {
        Self {
            seg_interval_step: 0x05,
            unicast_retrans_count: 0x02,
            unicast_retrans_without_progress_count: 0x02,
            unicast_retrans_interval_step: 0x07,
            unicast_retrans_interval_increment: 0x01,
            multicast_retrans_count: 0x02,
            multicast_retrans_interval_step: 0x09,
            segments_threshold: 0x03,
            ack_delay_increment: 0x01,
            discard_timeout: 0x01,
            receiver_seg_interval_step: 0x05,
            ack_retrans_count: 0x00,
        }
    }
}

impl SarConfig {
    /// Pacing between segments of the first round
    pub fn seg_interval(&self) -> Duration {
        Duration::from_millis((self.seg_interval_step as u64 + 1) * 10)
    }

    /// Retransmission timer for a destination reached with `ttl`
    pub fn retrans_interval(&self, dst: u16, ttl: u8) -> Duration {
        let ms = if address::is_unicast(dst) {
            let base = (self.unicast_retrans_interval_step as u64 + 1) * 25;
            if ttl == 0 {
                base
            } else {
                base + (self.unicast_retrans_interval_increment as u64 + 1) * 25 * (ttl as u64 - 1)
            }
        } else {
            (self.multicast_retrans_interval_step as u64 + 1) * 25
        };
        Duration::from_millis(ms)
    }

    /// Time without new segments after which reassembly is abandoned
    pub fn discard_interval(&self) -> Duration {
        Duration::from_secs((self.discard_timeout as u64 + 1) * 5)
    }

    /// Receiver segment interval
    pub fn rx_interval(&self) -> Duration {
        Duration::from_millis((self.receiver_seg_interval_step as u64 + 1) * 10)
    }

    /// Acknowledgment delay: `min(seg_n + 0.5, adi + 1.5)` receiver intervals
    pub fn ack_timeout(&self, seg_n: u8) -> Duration {
        let halves = std::cmp::min(2 * seg_n as u64 + 1, 2 * self.ack_delay_increment as u64 + 3);
        self.rx_interval() * halves as u32 / 2
    }

    /// Minimum spacing between acknowledgments for an already complete message
    pub fn ack_period(&self) -> Duration {
        self.rx_interval() * (2 * self.ack_delay_increment as u32 + 3) / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timings() {
        let sar = SarConfig::default();
        assert_eq!(sar.seg_interval(), Duration::from_millis(60));
        assert_eq!(sar.discard_interval(), Duration::from_secs(10));
        assert_eq!(sar.rx_interval(), Duration::from_millis(60));
        assert_eq!(sar.ack_period(), Duration::from_millis(150));
    }

    #[test]
    fn test_retrans_interval() {
        let sar = SarConfig::default();
        assert_eq!(sar.retrans_interval(0x0001, 0), Duration::from_millis(200));
        assert_eq!(sar.retrans_interval(0x0001, 1), Duration::from_millis(200));
        assert_eq!(sar.retrans_interval(0x0001, 7), Duration::from_millis(200 + 50 * 6));
        assert_eq!(sar.retrans_interval(0xc000, 7), Duration::from_millis(250));
    }

    #[test]
    fn test_ack_timeout_capped() {
        let sar = SarConfig::default();
        assert_eq!(sar.ack_timeout(0), Duration::from_millis(30));
        assert_eq!(sar.ack_timeout(1), Duration::from_millis(90));
        // adi + 1.5 caps the delay
        assert_eq!(sar.ack_timeout(20), Duration::from_millis(150));
    }
}
