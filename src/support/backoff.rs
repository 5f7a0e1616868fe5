//! Exponential reconnect backoff
//!
//! Delay `i` (zero-based) is `initial · 2^i` plus a small positive jitter,
//! never exceeding `max`.

use std::time::Duration;

use rand::Rng;

/// Backoff policy for client reconnects.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Cap applied after doubling and jitter.
    pub max_delay: Duration,
    /// Upper bound of the random jitter as a fraction of the current delay.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            jitter: 0.1,
        }
    }
}

/// Stateful delay sequence; one instance per reconnect episode.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay without jitter for the current attempt.
    pub fn base_delay(&self) -> Duration {
        let factor = 2f64.powi(self.attempt.min(63) as i32);
        let secs = self.config.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(secs.min(self.config.max_delay.as_secs_f64()))
    }

    /// Return the next delay and advance the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        let jitter = if self.config.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.config.jitter)
        } else {
            0.0
        };
        let delay = Duration::from_secs_f64(base.as_secs_f64() * (1.0 + jitter));
        self.attempt = self.attempt.saturating_add(1);
        delay.min(self.config.max_delay)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(initial_ms: u64, max_ms: u64) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            jitter: 0.1,
        }
    }

    #[test]
    fn delays_double_within_bounds() {
        let cfg = config(100, 10_000);
        let mut backoff = Backoff::new(cfg.clone());
        for i in 0..12u32 {
            let d = backoff.next_delay();
            let lower = (cfg.initial_delay * 2u32.pow(i)).min(cfg.max_delay);
            assert!(d >= lower, "attempt {}: {:?} < {:?}", i, d, lower);
            assert!(d <= cfg.max_delay, "attempt {}: {:?} > max", i, d);
        }
    }

    #[test]
    fn never_exceeds_cap() {
        let mut backoff = Backoff::new(config(1_000, 1_500));
        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_millis(1_500));
        }
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut backoff = Backoff::new(BackoffConfig {
            jitter: 0.0,
            ..config(50, 1_000)
        });
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
    }
}
