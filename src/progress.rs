//! Progress estimation (§4.G): a 1-second-sampled download rate plus the
//! cumulative total, exposed through the engine's `progress()` contract.
use std::time::{Duration, Instant};

/// A point-in-time snapshot returned by `DownloadEngine::progress()`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub downloaded: u64,
    pub total: u64,
    pub percent: f64,
    pub speed_bps: u64,
}

/// Tracks cumulative downloaded bytes and estimates a rolling transfer
/// rate from samples taken no more than once per second.
#[derive(Debug)]
pub struct ProgressMeter {
    total: u64,
    downloaded: u64,
    last_sample_at: Instant,
    last_sample_bytes: u64,
    speed_bps: u64,
}

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

impl ProgressMeter {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            downloaded: 0,
            last_sample_at: Instant::now(),
            last_sample_bytes: 0,
            speed_bps: 0,
        }
    }

    /// Records that `bytes` more were downloaded, clamping the running
    /// total at `total`, and refreshes the rate estimate if a full
    /// sampling interval has elapsed.
    pub fn record(&mut self, bytes: u64) {
        self.downloaded = (self.downloaded + bytes).min(self.total);
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample_at);
        if elapsed >= SAMPLE_INTERVAL {
            let delta = self.downloaded.saturating_sub(self.last_sample_bytes);
            self.speed_bps = (delta as f64 / elapsed.as_secs_f64()) as u64;
            self.last_sample_at = now;
            self.last_sample_bytes = self.downloaded;
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let percent = if self.total == 0 {
            100.0
        } else {
            (self.downloaded as f64 / self.total as f64) * 100.0
        };
        ProgressSnapshot {
            downloaded: self.downloaded,
            total: self.total,
            percent,
            speed_bps: self.speed_bps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downloaded_clamps_at_total() {
        let mut meter = ProgressMeter::new(100);
        meter.record(50);
        meter.record(200);
        assert_eq!(meter.snapshot().downloaded, 100);
    }

    #[test]
    fn percent_reflects_progress() {
        let mut meter = ProgressMeter::new(200);
        meter.record(50);
        assert_eq!(meter.snapshot().percent, 25.0);
    }

    #[test]
    fn zero_total_is_fully_complete() {
        let meter = ProgressMeter::new(0);
        assert_eq!(meter.snapshot().percent, 100.0);
    }
}
