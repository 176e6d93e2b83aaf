//! Token bucket rate limiter for speed control
//!
//! The bucket holds one second worth of budget and is refilled in whole
//! fixed intervals. Credit is exact: the sub-byte part of each refill is
//! carried over, never rounded up. A [`RateGovernor`] layers an optional per-download
//! limiter on top of the global one shared by every worker.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Token bucket limiter, cheap to clone and share between workers
#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<RateLimiterState>>,
    interval: Duration,
}

struct RateLimiterState {
    /// Tokens added per second (the speed limit); `None` when unlimited
    rate: Option<u64>,
    /// Maximum tokens (bytes) in the bucket
    capacity: u64,
    /// Current available tokens
    tokens: u64,
    /// Credit below one byte carried between refills, in nanobytes
    carry: u128,
    /// Start of the current refill interval
    last_refill: Instant,
}

impl RateLimiterState {
    fn configure(&mut self, bytes_per_second: Option<u64>) {
        match bytes_per_second.filter(|l| *l > 0) {
            Some(rate) => {
                if self.rate.is_none() {
                    self.last_refill = Instant::now();
                }
                self.rate = Some(rate);
                self.capacity = rate;
                // Don't let tokens exceed new capacity
                self.tokens = self.tokens.min(rate);
            }
            None => {
                self.rate = None;
                self.capacity = u64::MAX;
                self.tokens = u64::MAX;
                self.carry = 0;
            }
        }
    }

    /// Credit every whole interval elapsed since the last refill
    fn refill(&mut self, interval: Duration) {
        let Some(rate) = self.rate else { return };

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let intervals = (elapsed.as_nanos() / interval.as_nanos().max(1)) as u64;
        if intervals == 0 {
            return;
        }

        let credited = interval.saturating_mul(intervals.min(u32::MAX as u64) as u32);
        let credit = rate as u128 * credited.as_nanos() + self.carry;
        let whole = (credit / NANOS_PER_SEC).min(u64::MAX as u128) as u64;
        self.tokens = self.tokens.saturating_add(whole).min(self.capacity);
        self.carry = if self.tokens == self.capacity {
            0
        } else {
            credit % NANOS_PER_SEC
        };
        self.last_refill += credited;
    }
}

impl RateLimiter {
    /// Create a limiter; `None` or 0 means unlimited
    pub fn new(bytes_per_second: Option<u64>, interval: Duration) -> Self {
        let mut state = RateLimiterState {
            rate: None,
            capacity: u64::MAX,
            tokens: u64::MAX,
            carry: 0,
            last_refill: Instant::now(),
        };
        state.configure(bytes_per_second);
        // Start with full bucket
        state.tokens = state.capacity;

        Self {
            state: Arc::new(Mutex::new(state)),
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Create an unlimited rate limiter (no throttling)
    pub fn unlimited() -> Self {
        Self::new(None, Duration::from_millis(100))
    }

    /// Update the speed limit
    pub async fn set_limit(&self, bytes_per_second: Option<u64>) {
        let mut state = self.state.lock().await;
        state.refill(self.interval);
        state.configure(bytes_per_second);
    }

    pub async fn limit(&self) -> Option<u64> {
        self.state.lock().await.rate
    }

    /// Acquire budget for `bytes`, suspending until it is available.
    /// Requests larger than the bucket are taken in capacity-sized slices.
    pub async fn acquire(&self, bytes: u64) {
        let mut remaining = bytes;

        while remaining > 0 {
            let wait = {
                let mut state = self.state.lock().await;
                if state.rate.is_none() {
                    return;
                }

                state.refill(self.interval);
                let slice = remaining.min(state.capacity);
                if state.tokens >= slice {
                    state.tokens -= slice;
                    remaining -= slice;
                    continue;
                }

                // Wait for the next refill boundary
                (state.last_refill + self.interval).saturating_duration_since(Instant::now())
            };

            // Wait outside the lock so other segments can also check
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

/// Global limiter plus an optional tighter per-download one
#[derive(Clone)]
pub struct RateGovernor {
    global: RateLimiter,
    download: RateLimiter,
}

impl RateGovernor {
    pub fn new(global: RateLimiter, download: RateLimiter) -> Self {
        Self { global, download }
    }

    /// Acquire budget from both buckets, the per-download one first
    pub async fn acquire(&self, bytes: u64) {
        self.download.acquire(bytes).await;
        self.global.acquire(bytes).await;
    }
}
