//! Retry with exponential backoff for transient provider errors.

use crate::error::ProviderError;
use std::thread;
use std::time::Duration;

/// Backoff configuration for provider calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier applied per subsequent retry
    pub backoff_factor: f64,
    /// Cap on the computed delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Delay before the retry following attempt number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// A config that gives every call exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Run a provider call, retrying transient failures with backoff. Permanent
/// errors return immediately; transient ones retry up to the attempt cap and
/// then surface as-is.
pub fn with_retry<T, F>(config: &RetryConfig, mut operation: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Result<T, ProviderError>,
{
    let mut last_error: Option<ProviderError> = None;

    for attempt in 0..config.max_attempts {
        match operation() {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !e.is_transient() {
                    return Err(e);
                }
                if attempt + 1 >= config.max_attempts {
                    last_error = Some(e);
                    break;
                }
                let delay = config.delay_for_attempt(attempt);
                log::warn!(
                    "attempt {}/{} failed: {e}; retrying in {:.1}s",
                    attempt + 1,
                    config.max_attempts,
                    delay.as_secs_f64()
                );
                thread::sleep(delay);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or(ProviderError::Api {
        message: "retry exhausted".to_string(),
    }))
}
