//! Per-segment retry state: attempt counting and exponential backoff

use fluxdm_types::EngineConfig;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Backoff curve shared by every segment of a download
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Failures a segment may accumulate before it is terminally failed
    pub max_attempts: u32,
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(config: &EngineConfig, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base: Duration::from_millis(config.backoff_base_ms),
            multiplier: config.backoff_multiplier.max(1.0),
            max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay before the retry that follows failure number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.base.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

/// Next-eligible instants of segments waiting out a backoff
#[derive(Debug, Default)]
pub struct RetrySchedule {
    eligible_at: HashMap<u32, Instant>,
}

impl RetrySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `index` until `delay` has elapsed
    pub fn schedule(&mut self, index: u32, delay: Duration) -> Instant {
        let at = Instant::now() + delay;
        self.eligible_at.insert(index, at);
        at
    }

    pub fn is_eligible(&self, index: u32, now: Instant) -> bool {
        self.eligible_at.get(&index).map_or(true, |at| *at <= now)
    }

    /// Earliest instant still in the future, if any
    pub fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        self.eligible_at.values().copied().filter(|at| *at > now).min()
    }

    pub fn clear(&mut self, index: u32) {
        self.eligible_at.remove(&index);
    }
}
