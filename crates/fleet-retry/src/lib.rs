//! Retry strategies and backoff for fleet transport adapters.
//!
//! Transport-level failures (connection refused, timeout, broken channel)
//! are retried with backoff inside the adapter layer; remote failures
//! (non-zero exit codes, failed boots) never are. This crate provides the
//! delay calculation and an async executor that encodes that split: the
//! caller classifies each error as retryable or permanent and the executor
//! only sleeps and goes again for the former.
//!
//! # Example
//!
//! ```
//! use fleet_retry::{BackoffConfig, BackoffStrategy, calculate_delay};
//! use std::time::Duration;
//!
//! let config = BackoffConfig {
//!     strategy: BackoffStrategy::Exponential,
//!     max_attempts: 4,
//!     base_delay: Duration::from_millis(250),
//!     max_delay: Duration::from_secs(10),
//!     jitter: 0.0,
//! };
//! assert_eq!(calculate_delay(&config, 1), Duration::from_millis(250));
//! assert_eq!(calculate_delay(&config, 3), Duration::from_secs(1));
//! ```

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Strategy for computing the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// No delay, retry immediately.
    Immediate,
    /// Delay doubles each attempt: base * 2^(attempt-1). The adapter
    /// contract default.
    #[default]
    Exponential,
    /// Delay grows linearly: base * attempt.
    Linear,
    /// Same delay every attempt.
    Constant,
}

/// Backoff configuration for one retry loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor: 0.5 scales each delay by a random value in
    /// [0.5, 1.5]. Zero disables jitter.
    #[serde(default)]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: 0.0,
        }
    }
}

impl BackoffConfig {
    /// The transport adapter default: three attempts, 500 ms doubling,
    /// capped at 30 s, no jitter (tests stay deterministic; the probe loop
    /// adds its own jitter).
    pub fn transport() -> Self {
        Self::default()
    }

    /// A single attempt, no retry. Used for remote (non-transport) calls.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Delay before retry number `attempt` (1-indexed: the delay after the
/// first failure is `calculate_delay(config, 1)`).
pub fn calculate_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let raw = match config.strategy {
        BackoffStrategy::Immediate => Duration::ZERO,
        BackoffStrategy::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        BackoffStrategy::Linear => config.base_delay.saturating_mul(attempt),
        BackoffStrategy::Constant => config.base_delay,
    };

    let capped = raw.min(config.max_delay);

    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Scale a delay by a random factor in [1 - jitter, 1 + jitter].
pub fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
    let millis = (delay.as_millis() as f64 * factor).round().max(0.0) as u64;
    Duration::from_millis(millis)
}

/// Run an async fallible operation, retrying while `is_retryable` approves
/// the error and attempts remain. Sleeps between attempts per the config.
///
/// The operation receives the current attempt number starting at 1.
pub async fn retry_async<T, E, F, Fut, P>(
    config: &BackoffConfig,
    mut is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= config.max_attempts.max(1) || !is_retryable(&err) {
                    return Err(err);
                }
                let delay = calculate_delay(config, attempt);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Synchronous variant for blocking call sites.
pub fn retry_blocking<T, E, F, P>(
    config: &BackoffConfig,
    mut is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    P: FnMut(&E) -> bool,
{
    let mut attempt = 1;
    loop {
        match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= config.max_attempts.max(1) || !is_retryable(&err) {
                    return Err(err);
                }
                std::thread::sleep(calculate_delay(config, attempt));
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(strategy: BackoffStrategy, base_ms: u64, max_ms: u64) -> BackoffConfig {
        BackoffConfig {
            strategy,
            max_attempts: 10,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            jitter: 0.0,
        }
    }

    #[test]
    fn immediate_has_no_delay() {
        let config = no_jitter(BackoffStrategy::Immediate, 1000, 60_000);
        assert_eq!(calculate_delay(&config, 1), Duration::ZERO);
        assert_eq!(calculate_delay(&config, 7), Duration::ZERO);
    }

    #[test]
    fn exponential_doubles_per_attempt() {
        let config = no_jitter(BackoffStrategy::Exponential, 1000, 60_000);
        assert_eq!(calculate_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(calculate_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(calculate_delay(&config, 3), Duration::from_secs(4));
        assert_eq!(calculate_delay(&config, 4), Duration::from_secs(8));
    }

    #[test]
    fn exponential_caps_at_max() {
        let config = no_jitter(BackoffStrategy::Exponential, 10_000, 30_000);
        assert_eq!(calculate_delay(&config, 3), Duration::from_secs(30));
        assert_eq!(calculate_delay(&config, 12), Duration::from_secs(30));
    }

    #[test]
    fn linear_grows_per_attempt() {
        let config = no_jitter(BackoffStrategy::Linear, 1000, 5_000);
        assert_eq!(calculate_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(calculate_delay(&config, 3), Duration::from_secs(3));
        assert_eq!(calculate_delay(&config, 9), Duration::from_secs(5));
    }

    #[test]
    fn constant_never_changes() {
        let config = no_jitter(BackoffStrategy::Constant, 2000, 60_000);
        assert_eq!(calculate_delay(&config, 1), Duration::from_secs(2));
        assert_eq!(calculate_delay(&config, 8), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_in_band() {
        let config = BackoffConfig {
            strategy: BackoffStrategy::Constant,
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            jitter: 0.5,
        };
        for _ in 0..200 {
            let delay = calculate_delay(&config, 1);
            assert!(delay >= Duration::from_millis(5_000));
            assert!(delay <= Duration::from_millis(15_000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_async_recovers_after_transient_failures() {
        let config = BackoffConfig {
            strategy: BackoffStrategy::Exponential,
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: 0.0,
        };
        let calls = AtomicU32::new(0);

        let result: Result<&str, &str> = retry_async(
            &config,
            |_err| true,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err("connection refused")
                    } else {
                        Ok("connected")
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok("connected"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_async_stops_on_permanent_error() {
        let config = BackoffConfig {
            max_attempts: 5,
            ..BackoffConfig::default()
        };
        let calls = AtomicU32::new(0);

        let result: Result<(), &str> = retry_async(
            &config,
            |err: &&str| *err != "auth denied",
            |_attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("auth denied") }
            },
        )
        .await;

        assert_eq!(result, Err("auth denied"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_async_exhausts_attempts() {
        let config = BackoffConfig {
            strategy: BackoffStrategy::Immediate,
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        };
        let calls = AtomicU32::new(0);

        let result: Result<(), &str> = retry_async(
            &config,
            |_err| true,
            |_attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("still down") }
            },
        )
        .await;

        assert_eq!(result, Err("still down"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_blocking_succeeds_first_try() {
        let config = BackoffConfig::none();
        let result: Result<u32, &str> = retry_blocking(&config, |_e| true, |_a| Ok(7));
        assert_eq!(result, Ok(7));
    }

    #[test]
    fn none_config_is_single_attempt() {
        let config = BackoffConfig::none();
        let mut calls = 0;
        let result: Result<(), &str> = retry_blocking(
            &config,
            |_e| true,
            |_a| {
                calls += 1;
                Err("boom")
            },
        );
        assert_eq!(result, Err("boom"));
        assert_eq!(calls, 1);
    }

    proptest::proptest! {
        #[test]
        fn delay_never_exceeds_max(attempt in 1u32..64, base_ms in 0u64..5_000, max_ms in 0u64..60_000) {
            let config = BackoffConfig {
                strategy: BackoffStrategy::Exponential,
                max_attempts: 10,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(max_ms),
                jitter: 0.0,
            };
            proptest::prop_assert!(calculate_delay(&config, attempt) <= config.max_delay);
        }

        #[test]
        fn exponential_is_monotone_until_cap(base_ms in 1u64..1_000) {
            let config = BackoffConfig {
                strategy: BackoffStrategy::Exponential,
                max_attempts: 10,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_secs(3_600),
                jitter: 0.0,
            };
            let mut prev = Duration::ZERO;
            for attempt in 1..12 {
                let delay = calculate_delay(&config, attempt);
                proptest::prop_assert!(delay >= prev);
                prev = delay;
            }
        }
    }
}
