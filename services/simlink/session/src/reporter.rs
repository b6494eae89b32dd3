//! Periodic throughput reporting.
//!
//! The reporter is advisory: it counts bytes moved by the data plane and, once
//! per interval, logs the achieved rate in kB/s. Nothing in the session's
//! control flow depends on it.

use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Label used for the final report emitted by teardown
pub const SHUTDOWN_LABEL: &str = "shutdown";

/// Transfer direction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Bytes written to the peer
    Sent,
    /// Bytes read from the peer
    Received,
}

/// One emitted report
#[derive(Clone, Debug, PartialEq)]
pub struct ThroughputReport {
    /// Context label (client, server, shutdown)
    pub label: String,
    /// Length of the window the report covers
    pub elapsed: Duration,
    /// Bytes sent in the window
    pub bytes_sent: u64,
    /// Bytes received in the window
    pub bytes_received: u64,
    /// Send rate in kB/s
    pub tx_kbps: f64,
    /// Receive rate in kB/s
    pub rx_kbps: f64,
}

/// Byte counters for the current reporting window
#[derive(Debug)]
pub struct ThroughputReporter {
    interval: Duration,
    bytes_sent: u64,
    bytes_received: u64,
    window_start: Instant,
}

impl ThroughputReporter {
    /// Create a reporter whose window starts now
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            bytes_sent: 0,
            bytes_received: 0,
            window_start: Instant::now(),
        }
    }

    /// Add a successful transfer to the window
    pub fn record(&mut self, direction: Direction, byte_count: usize) {
        let n = byte_count as u64;
        match direction {
            Direction::Sent => self.bytes_sent += n,
            Direction::Received => self.bytes_received += n,
        }
    }

    /// Bytes sent since the last report
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Bytes received since the last report
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Configured interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Emit a report if the interval has elapsed. A zero interval reports on
    /// every call.
    pub fn maybe_report(&mut self, label: &str) -> Option<ThroughputReport> {
        let now = Instant::now();
        if now.duration_since(self.window_start) < self.interval {
            return None;
        }
        Some(self.emit(label, now))
    }

    /// Emit a report regardless of the interval
    pub fn flush(&mut self, label: &str) -> ThroughputReport {
        self.emit(label, Instant::now())
    }

    fn emit(&mut self, label: &str, now: Instant) -> ThroughputReport {
        let elapsed = now.duration_since(self.window_start);
        let report = ThroughputReport {
            label: label.to_string(),
            elapsed,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            tx_kbps: rate_kbps(self.bytes_sent, elapsed),
            rx_kbps: rate_kbps(self.bytes_received, elapsed),
        };

        info!(
            "{} Sim-Time= {:>10} sec, Throughput: TX= {:8.3} kB/s \t RX= {:8.3} kB/s",
            report.label,
            elapsed.as_secs(),
            report.tx_kbps,
            report.rx_kbps
        );

        self.bytes_sent = 0;
        self.bytes_received = 0;
        self.window_start = now;
        report
    }
}

fn rate_kbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 / secs / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_no_report_inside_interval() {
        let mut reporter = ThroughputReporter::new(Duration::from_secs(60));
        assert_eq!(reporter.interval(), Duration::from_secs(60));

        for _ in 0..10 {
            reporter.record(Direction::Sent, 36);
            assert!(reporter.maybe_report("client").is_none());
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        assert_eq!(reporter.bytes_sent(), 360);
        assert_eq!(reporter.bytes_received(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_resets_counters() {
        let mut reporter = ThroughputReporter::new(Duration::from_secs(2));
        reporter.record(Direction::Sent, 4000);
        reporter.record(Direction::Received, 2000);

        tokio::time::advance(Duration::from_secs(2)).await;
        let report = reporter.maybe_report("server").expect("interval elapsed");

        assert_eq!(report.label, "server");
        assert_eq!(report.elapsed, Duration::from_secs(2));
        assert!((report.tx_kbps - 2.0).abs() < 1e-9);
        assert!((report.rx_kbps - 1.0).abs() < 1e-9);
        assert_eq!(reporter.bytes_sent(), 0);
        assert_eq!(reporter.bytes_received(), 0);

        // New window just started
        assert!(reporter.maybe_report("server").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_reports_every_transfer() {
        let mut reporter = ThroughputReporter::new(Duration::ZERO);

        reporter.record(Direction::Received, 36);
        tokio::time::advance(Duration::from_secs(1)).await;
        let report = reporter.maybe_report("client").expect("zero interval always reports");
        assert_eq!(report.bytes_received, 36);
        assert!((report.rx_kbps - 0.036).abs() < 1e-9);
        assert_eq!(reporter.bytes_received(), 0);

        // Same instant as the previous report: still reported, rate guarded to 0
        reporter.record(Direction::Sent, 36);
        let report = reporter.maybe_report("client").expect("zero interval always reports");
        assert_eq!(report.elapsed, Duration::ZERO);
        assert_eq!(report.bytes_sent, 36);
        assert_eq!(report.tx_kbps, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_with_zero_elapsed_has_zero_rate() {
        let mut reporter = ThroughputReporter::new(Duration::from_secs(60));
        reporter.record(Direction::Sent, 36);
        let report = reporter.flush(SHUTDOWN_LABEL);
        assert_eq!(report.elapsed, Duration::ZERO);
        assert_eq!(report.tx_kbps, 0.0);
        assert_eq!(report.bytes_sent, 36);
        assert_eq!(reporter.bytes_sent(), 0);
    }
}
