// Retry strategy for transactions that hit transient lock conflicts
// Linear backoff: base, 2 * base, 3 * base, ... with optional jitter

use crate::config::TransactionConfig;
use rand::Rng;
use std::time::Duration;

/// Default number of attempts per transaction
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base backoff in milliseconds
pub const DEFAULT_BASE_BACKOFF_MS: u64 = 100;

/// Retry strategy trait for calculating retry delays
pub trait RetryStrategy: Send + Sync {
    /// Delay to wait after attempt number `attempt` (1-based) failed
    /// Returns None if no attempts remain
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    /// Total number of attempts allowed
    fn max_attempts(&self) -> u32;
}

/// Linear backoff retry strategy with optional jitter
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    /// Total attempts, including the first one (always at least 1)
    max_attempts: u32,
    /// Delay unit multiplied by the attempt number
    base_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0, default: 0.0 = none)
    jitter_factor: f64,
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_BACKOFF_MS,
            jitter_factor: 0.0,
        }
    }
}

impl LinearBackoff {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            jitter_factor: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    pub fn from_config(config: &TransactionConfig) -> Self {
        Self::new(config.max_retries, config.base_backoff_ms).with_jitter(config.jitter_factor)
    }

    /// Linear delay without jitter
    fn calculate_base_delay_ms(&self, attempt: u32) -> u64 {
        self.base_delay_ms.saturating_mul(attempt as u64)
    }

    /// Add random jitter to spread retries of conflicting transactions apart
    fn add_jitter_ms(&self, base_delay_ms: u64) -> u64 {
        if self.jitter_factor == 0.0 {
            return base_delay_ms;
        }

        let jitter_range_ms = (base_delay_ms as f64 * self.jitter_factor) as u64;
        if jitter_range_ms == 0 {
            return base_delay_ms;
        }

        base_delay_ms + rand::thread_rng().gen_range(0..=jitter_range_ms)
    }
}

impl RetryStrategy for LinearBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }

        let delay_ms = self.add_jitter_ms(self.calculate_base_delay_ms(attempt));
        Some(Duration::from_millis(delay_ms))
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
