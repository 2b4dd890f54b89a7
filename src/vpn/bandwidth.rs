//! Running transfer counters fed by `>BYTECOUNT:` notifications.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Totals and smoothed per-second rates for the current session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthUsage {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub tx_bytes_per_second: u64,
    pub rx_bytes_per_second: u64,
    #[serde(skip)]
    sampler: RateSampler,
}

#[derive(Debug, Clone)]
struct RateSampler {
    min_window: Duration,
    window_start: Instant,
    window_sent: u64,
    window_received: u64,
}

impl Default for RateSampler {
    fn default() -> Self {
        Self {
            min_window: Duration::from_secs(1),
            window_start: Instant::now(),
            window_sent: 0,
            window_received: 0,
        }
    }
}

impl Default for BandwidthUsage {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl BandwidthUsage {
    /// Rates are only recomputed once at least `min_window` has passed
    /// since the previous computation.
    pub fn new(min_window: Duration) -> Self {
        Self {
            bytes_sent: 0,
            bytes_received: 0,
            tx_bytes_per_second: 0,
            rx_bytes_per_second: 0,
            sampler: RateSampler {
                min_window,
                ..RateSampler::default()
            },
        }
    }

    /// Record new cumulative totals
    pub fn update(&mut self, total_sent: u64, total_received: u64) {
        self.update_at(total_sent, total_received, Instant::now());
    }

    pub(crate) fn update_at(&mut self, total_sent: u64, total_received: u64, now: Instant) {
        // OpenVPN restarts its counters on a soft restart
        if total_sent < self.sampler.window_sent || total_received < self.sampler.window_received {
            self.sampler.window_sent = 0;
            self.sampler.window_received = 0;
            self.sampler.window_start = now;
        }

        self.bytes_sent = total_sent;
        self.bytes_received = total_received;

        let elapsed = now.saturating_duration_since(self.sampler.window_start);
        if elapsed < self.sampler.min_window || elapsed.is_zero() {
            return;
        }

        let secs = elapsed.as_secs_f64();
        self.tx_bytes_per_second = ((total_sent - self.sampler.window_sent) as f64 / secs) as u64;
        self.rx_bytes_per_second = ((total_received - self.sampler.window_received) as f64 / secs) as u64;

        self.sampler.window_start = now;
        self.sampler.window_sent = total_sent;
        self.sampler.window_received = total_received;
    }

    pub fn reset(&mut self) {
        self.reset_at(Instant::now());
    }

    fn reset_at(&mut self, now: Instant) {
        self.bytes_sent = 0;
        self.bytes_received = 0;
        self.tx_bytes_per_second = 0;
        self.rx_bytes_per_second = 0;
        self.sampler.window_start = now;
        self.sampler.window_sent = 0;
        self.sampler.window_received = 0;
    }
}

impl fmt::Display for BandwidthUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "In: {}, Out: {}", self.bytes_received, self.bytes_sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_over_window() {
        let start = Instant::now();
        let mut usage = BandwidthUsage::new(Duration::from_secs(1));
        usage.reset_at(start);

        usage.update_at(2000, 4000, start + Duration::from_secs(2));
        assert_eq!(usage.bytes_sent, 2000);
        assert_eq!(usage.bytes_received, 4000);
        assert_eq!(usage.tx_bytes_per_second, 1000);
        assert_eq!(usage.rx_bytes_per_second, 2000);
    }

    #[test]
    fn test_short_interval_keeps_previous_rate() {
        let start = Instant::now();
        let mut usage = BandwidthUsage::new(Duration::from_secs(1));
        usage.reset_at(start);

        usage.update_at(1000, 1000, start + Duration::from_secs(1));
        assert_eq!(usage.tx_bytes_per_second, 1000);

        // 100ms later: totals move, rate does not
        usage.update_at(9000, 9000, start + Duration::from_millis(1100));
        assert_eq!(usage.bytes_sent, 9000);
        assert_eq!(usage.tx_bytes_per_second, 1000);

        // Window measured from the last computation, not the last update
        usage.update_at(11000, 3000, start + Duration::from_secs(2));
        assert_eq!(usage.tx_bytes_per_second, 10000);
        assert_eq!(usage.rx_bytes_per_second, 2000);
    }

    #[test]
    fn test_counter_restart_does_not_underflow() {
        let start = Instant::now();
        let mut usage = BandwidthUsage::new(Duration::from_secs(1));
        usage.reset_at(start);
        usage.update_at(5000, 5000, start + Duration::from_secs(1));

        usage.update_at(100, 200, start + Duration::from_secs(2));
        assert_eq!(usage.bytes_sent, 100);
        assert_eq!(usage.bytes_received, 200);
    }

    #[test]
    fn test_reset() {
        let mut usage = BandwidthUsage::default();
        usage.update(10, 20);
        usage.reset();
        assert_eq!(usage.bytes_sent, 0);
        assert_eq!(usage.bytes_received, 0);
        assert_eq!(usage.tx_bytes_per_second, 0);
        assert_eq!(usage.to_string(), "In: 0, Out: 0");
    }
}
