use rand::Rng;
use std::time::Duration;

/// Jittered exponential backoff for one ingestion loop.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_pct: f64,
    /// Consecutive failures tolerated before giving up; zero retries forever.
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter_pct: f64, max_attempts: u32) -> Self {
        let base_delay = base_delay.max(Duration::from_millis(1));
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
            max_attempts,
        }
    }

    /// Whether `attempt` (1-based) exceeds the configured limit.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt > self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2_u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);
        if self.jitter_pct <= 0.0 {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.jitter_pct;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(60), 0.2, 0)
    }
}
