//! Exponential-backoff schedule for the upstream bridge connection.

use std::time::Duration;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Stateful backoff: each call to [`Backoff::next_wait`] returns the current
/// delay and grows the next one.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        let current = config.initial_delay;
        Self {
            config,
            current,
            attempts: 0,
        }
    }

    pub fn next_wait(&mut self) -> Duration {
        let wait = self.current;
        self.current = next_delay(self.current, &self.config);
        self.attempts += 1;
        wait
    }

    /// Failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.attempts = 0;
    }
}
