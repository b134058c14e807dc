//! Retry utilities with exponential backoff and jitter.
//!
//! Used by the watch loops that keep the resource cache coherent and by the
//! startup fetch of the cluster registry. Jitter avoids every cluster's watch
//! reconnecting in lockstep after a shared outage.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Stateful exponential backoff
///
/// Each call to [`Backoff::next_delay`] returns a jittered delay and grows the
/// base delay up to `max_delay`. [`Backoff::reset`] starts over after a success.
#[derive(Debug)]
pub struct Backoff {
    config: RetryConfig,
    delay: Duration,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff from the given configuration
    pub fn new(config: RetryConfig) -> Self {
        let delay = config.initial_delay;
        Self {
            config,
            delay,
            attempt: 0,
        }
    }

    /// Number of failures recorded since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether `max_attempts` has been reached
    pub fn exhausted(&self) -> bool {
        self.config.max_attempts > 0 && self.attempt >= self.config.max_attempts
    }

    /// Record a failure and return how long to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;

        // Add jitter: 0.5x to 1.5x of the delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(self.delay.as_secs_f64() * jitter);

        self.delay = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * self.config.backoff_multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );

        jittered
    }

    /// Forget previous failures
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.delay = self.config.initial_delay;
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until success, until `max_attempts` is exhausted, or until
/// `is_permanent` says the error cannot be fixed by retrying.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    is_permanent: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = Backoff::new(config.clone());

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let delay = backoff.next_delay();

                if is_permanent(&e) || backoff.exhausted() {
                    error!(
                        operation = %operation_name,
                        attempt = backoff.attempt(),
                        error = %e,
                        "Operation failed, giving up"
                    );
                    return Err(e);
                }

                warn!(
                    operation = %operation_name,
                    attempt = backoff.attempt(),
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
