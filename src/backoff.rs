//! Backoff and retry helpers.
//!
//! [`Backoff`] computes delays for the runtime's supervisor (between runner
//! respawns) and for [`retry_with_backoff`], which bounds the call loop.

use std::time::Duration;

use tracing::warn;

use crate::config::BackoffConfig;

/// Backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Delay doubles each retry, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay before the first retry.
    pub fn initial_delay(&self) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { initial, .. } => *initial,
        }
    }

    /// Delay following `current`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { max, .. } => std::cmp::min(current.saturating_mul(2), *max),
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_delay();
        for _ in 0..attempt {
            let next = self.next_delay(delay);
            if next == delay {
                break;
            }
            delay = next;
        }
        delay
    }
}

impl From<&BackoffConfig> for Backoff {
    fn from(config: &BackoffConfig) -> Self {
        let initial = Duration::from_millis(config.initial_ms);
        let max = Duration::from_millis(config.max_ms);
        if initial >= max {
            Backoff::Fixed(initial)
        } else {
            Backoff::Exponential { initial, max }
        }
    }
}

/// Retry an operation up to `max_retries` times with backoff.
///
/// Total attempts = 1 + `max_retries`. Errors for which `is_retryable`
/// returns false are returned immediately.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    max_retries: u32,
    backoff: Backoff,
    description: &str,
    mut attempt_fn: F,
    mut is_retryable: R,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
    R: FnMut(&E) -> bool,
{
    let mut delay = backoff.initial_delay();
    let mut attempt = 0;

    loop {
        match attempt_fn().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !is_retryable(&e) || attempt >= max_retries {
                    return Err(e);
                }
                warn!(
                    attempt = attempt + 1,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    description,
                    error = %e,
                    "Attempt failed, retrying with backoff"
                );
                tokio::time::sleep(delay).await;
                delay = backoff.next_delay(delay);
                attempt += 1;
            }
        }
    }
}
