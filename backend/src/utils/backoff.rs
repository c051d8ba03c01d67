//! Exponential backoff for calls to collaborator services.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::constants::*;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Randomise each delay by ±20%.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: CHAT_RETRY_ATTEMPTS,
            base_delay: Duration::from_millis(CHAT_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(CHAT_RETRY_MAX_DELAY_MS),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no waiting. Handy in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter && !delay.is_zero() {
            let scale = rand::rng().random_range(0.8..=1.2);
            delay.mul_f64(scale).min(self.max_delay)
        } else {
            delay
        }
    }
}

/// Run `op` until it succeeds or the policy is exhausted, returning the last
/// error.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= policy.max_attempts.max(1) => {
                tracing::warn!(attempt, "{} failed, giving up: {}", label, e);
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                tracing::debug!(attempt, ?delay, "{} failed, retrying: {}", label, e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
