//! Retry Policy
//!
//! One exponential-backoff policy shared by lease renewal and per-item
//! recovery retries, so both paths back off identically.

use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Exponential backoff with a cap and proportional jitter
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor applied per retry
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound on any single delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fraction of the delay added as random jitter (0.0 - 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Policy with no jitter, for deterministic schedules
    pub fn fixed(max_attempts: u32, base_delay_ms: u64, multiplier: f64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            multiplier,
            max_delay_ms,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `retry` (0-based), capped, without jitter
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(32) as i32);
        let delay_ms = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// Delay before retry number `retry` (0-based), with jitter applied.
    /// The jittered value never exceeds `max_delay_ms`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.base_delay(retry);
        if self.jitter <= 0.0 {
            return delay;
        }

        let jitter_range = (delay.as_millis() as f64 * self.jitter.min(1.0)) as u64;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..=jitter_range)
        } else {
            0
        };
        let capped = (delay.as_millis() as u64 + jitter).min(self.max_delay_ms);
        Duration::from_millis(capped)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    ///
    /// Sleeps `delay_for(n)` between attempts. Returns the last error when
    /// every attempt failed.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> std::result::Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if !self.should_retry(attempt) {
                        return Err(e);
                    }
                    let delay = self.delay_for(attempt - 1);
                    debug!("Attempt {} failed ({}), retrying in {:?}", attempt, e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_calculation() {
        let policy = RetryPolicy::fixed(5, 1000, 2.0, 60_000);

        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(2), Duration::from_secs(4));
        assert_eq!(policy.base_delay(5), Duration::from_secs(32));
        assert_eq!(policy.base_delay(6), Duration::from_secs(60)); // capped
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..RetryPolicy::fixed(5, 100, 2.0, 1000)
        };

        for _ in 0..50 {
            let d = policy.delay_for(1);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(300));
        }
        // Jitter never pushes past the cap
        for _ in 0..50 {
            assert!(policy.delay_for(10) <= Duration::from_millis(1000));
        }
    }

    #[tokio::test]
    async fn test_run_retries_until_success() {
        let policy = RetryPolicy::fixed(3, 1, 2.0, 10);
        let calls = AtomicU32::new(0);

        let result: std::result::Result<u32, String> = policy
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_max_attempts() {
        let policy = RetryPolicy::fixed(2, 1, 2.0, 10);
        let calls = AtomicU32::new(0);

        let result: std::result::Result<(), String> = policy
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("down".to_string()) }
            })
            .await;

        assert_eq!(result, Err("down".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
