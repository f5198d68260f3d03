//! Upload/download accounting with a one-second sliding window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Byte counter for one traffic direction.
///
/// Each logged transfer is kept for the window given to
/// [`TrafficMonitor::new`]; the rate is the sum of the transfers still inside it.
#[derive(Debug, Clone)]
pub struct TrafficMonitor {
    window: Duration,
    samples: VecDeque<(Instant, usize)>,
    in_window: usize,
    total: u64,
}

impl Default for TrafficMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl TrafficMonitor {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            in_window: 0,
            total: 0,
        }
    }

    /// Record `bytes` transferred at `now`.
    pub fn log_bytes(&mut self, bytes: usize, now: Instant) {
        if bytes == 0 {
            return;
        }
        self.expire(now);
        self.samples.push_back((now, bytes));
        self.in_window += bytes;
        self.total += bytes as u64;
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(at, bytes)) = self.samples.front() {
            if now.saturating_duration_since(at) < self.window {
                break;
            }
            self.samples.pop_front();
            self.in_window -= bytes;
        }
    }

    /// Bytes per second over the window ending at `now`.
    pub fn rate(&mut self, now: Instant) -> f64 {
        self.expire(now);
        self.in_window as f64 / self.window.as_secs_f64()
    }

    /// Bytes logged since creation.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Human-readable rate, e.g. `"1.5 KB/s"`.
    pub fn usage(&mut self, now: Instant) -> String {
        format!("{}/s", format_bytes(self.rate(now)))
    }
}

/// Format a byte count with a binary unit suffix.
pub fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_sums_window() {
        let start = Instant::now();
        let mut monitor = TrafficMonitor::default();
        monitor.log_bytes(100, start);
        monitor.log_bytes(300, start + Duration::from_millis(500));

        assert_eq!(monitor.rate(start + Duration::from_millis(900)), 400.0);
        assert_eq!(monitor.total(), 400);
    }

    #[test]
    fn test_old_samples_leave_window() {
        let start = Instant::now();
        let mut monitor = TrafficMonitor::default();
        monitor.log_bytes(100, start);
        monitor.log_bytes(50, start + Duration::from_millis(700));

        assert_eq!(monitor.rate(start + Duration::from_millis(1200)), 50.0);
        assert_eq!(monitor.rate(start + Duration::from_secs(5)), 0.0);
        assert_eq!(monitor.total(), 150, "total survives expiry");
    }

    #[test]
    fn test_zero_byte_transfers_ignored() {
        let mut monitor = TrafficMonitor::default();
        monitor.log_bytes(0, Instant::now());
        assert!(monitor.samples.is_empty());
    }

    #[test]
    fn test_usage_formatting() {
        assert_eq!(format_bytes(512.0), "512 B");
        assert_eq!(format_bytes(1536.0), "1.5 KB");
        assert_eq!(format_bytes(3.0 * 1024.0 * 1024.0), "3.0 MB");

        let now = Instant::now();
        let mut monitor = TrafficMonitor::default();
        monitor.log_bytes(2048, now);
        assert_eq!(monitor.usage(now), "2.0 KB/s");
    }
}
