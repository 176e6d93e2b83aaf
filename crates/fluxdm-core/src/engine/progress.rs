//! Transfer rate smoothing for progress snapshots

use std::collections::VecDeque;
use tokio::time::Instant;

/// Smoothing factor; lower is steadier
const ALPHA: f64 = 0.15;
/// Samples kept in the sliding window
const WINDOW: usize = 10;

/// Windowed average fed through an exponential moving average
#[derive(Debug)]
pub struct SpeedMeter {
    samples: VecDeque<f64>,
    smoothed: f64,
    last_bytes: u64,
    last_time: Instant,
}

impl SpeedMeter {
    pub fn new(bytes: u64) -> Self {
        Self {
            samples: VecDeque::with_capacity(WINDOW),
            smoothed: 0.0,
            last_bytes: bytes,
            last_time: Instant::now(),
        }
    }

    /// Record the aggregate byte count and return the smoothed rate in bytes/s
    pub fn sample(&mut self, bytes: u64) -> u64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_time).as_secs_f64();
        if elapsed <= 0.0 {
            return self.rate();
        }

        let instant = bytes.saturating_sub(self.last_bytes) as f64 / elapsed;
        self.samples.push_back(instant);
        if self.samples.len() > WINDOW {
            self.samples.pop_front();
        }

        let window_avg = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        self.smoothed = ALPHA * window_avg + (1.0 - ALPHA) * self.smoothed;

        self.last_bytes = bytes;
        self.last_time = now;
        self.rate()
    }

    pub fn rate(&self) -> u64 {
        self.smoothed as u64
    }

    /// Forget history, e.g. after a pause
    pub fn reset(&mut self, bytes: u64) {
        self.samples.clear();
        self.smoothed = 0.0;
        self.last_bytes = bytes;
        self.last_time = Instant::now();
    }
}
