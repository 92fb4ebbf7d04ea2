use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INTERVAL_MILLIS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const MAX_BACKOFF_MILLIS: u64 = 4 * 60 * 60 * 1_000;
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub interval_millis: u64,
    pub backoff_factor: f64,
    pub max_backoff_millis: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            interval_millis: DEFAULT_INTERVAL_MILLIS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_backoff_millis: MAX_BACKOFF_MILLIS,
        }
    }
}

/// Retry delay after `backoff_count` consecutive failures, with ±50% jitter.
pub fn calculate_backoff_millis(backoff_count: u32, config: BackoffConfig) -> u64 {
    calculate_backoff_with_rng(backoff_count, config, &mut rand::thread_rng())
}

fn calculate_backoff_with_rng<R: Rng + ?Sized>(
    backoff_count: u32,
    config: BackoffConfig,
    rng: &mut R,
) -> u64 {
    let ceiling = config.max_backoff_millis as f64;
    let exponent = backoff_count.min(i32::MAX as u32) as i32;
    // Large counts overflow to infinity; cap before the jitter is applied.
    let base = ((config.interval_millis as f64) * config.backoff_factor.powi(exponent))
        .min(ceiling * 2.0);
    let jitter = RANDOM_FACTOR * base * rng.gen_range(-1.0..=1.0);
    let value = (base + jitter).round().clamp(0.0, ceiling);
    value as u64
}

/// Per-stream retry state. Each failure doubles the base delay until a stream opens again.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempts: u32,
    force_max: bool,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
            force_max: false,
        }
    }

    pub fn config(&self) -> BackoffConfig {
        self.config
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.force_max = false;
    }

    /// The next retry waits the full ceiling.
    pub fn reset_to_max(&mut self) {
        self.force_max = true;
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let millis = if self.force_max {
            self.force_max = false;
            self.config.max_backoff_millis
        } else {
            calculate_backoff_with_rng(self.attempts, self.config, rng)
        };
        self.attempts = self.attempts.saturating_add(1);
        Duration::from_millis(millis)
    }
}
