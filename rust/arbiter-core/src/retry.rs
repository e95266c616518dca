// rust/arbiter-core/src/retry.rs

//! Backoff for connection setup.
//!
//! A worker may come up before the scheduler or the sink is listening. The
//! default backoff waits one second between attempts and never gives up;
//! [`RetryConfig::bounded`] grows the delay and stops after a number of
//! retries.

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt; `None` means unlimited.
    pub max_retries: Option<u32>,
    pub initial_delay: Duration,
    /// Cap on a single wait.
    pub max_delay: Duration,
    /// Growth factor per retry; 1.0 keeps the delay fixed.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1))
    }
}

impl RetryConfig {
    /// Unlimited retries, `delay` apart.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            max_retries: None,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
        }
    }

    pub fn bounded(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries: Some(max_retries),
            initial_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Whether failed attempt number `attempt` (0-based) may be retried.
    pub fn allows(&self, attempt: u32) -> bool {
        match self.max_retries {
            Some(limit) => attempt < limit,
            None => true,
        }
    }

    /// How long to wait after failed attempt number `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if !self.allows(attempt) {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Outcome of one attempt.
#[derive(Debug)]
pub enum Attempt<T, E> {
    Done(T),
    /// Worth trying again after a backoff.
    Transient(E),
    /// Give up now.
    Fatal(E),
}

/// Run `attempt` until it is done, fails fatally, or `config` stops allowing
/// retries. The closure receives the 0-based attempt number.
pub async fn retry_async<T, E, F, Fut>(config: &RetryConfig, mut attempt: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
{
    let mut n = 0u32;
    loop {
        let error = match attempt(n).await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fatal(error) => return Err(error),
            Attempt::Transient(error) => error,
        };
        if !config.allows(n) {
            return Err(error);
        }
        tokio::time::sleep(config.backoff(n)).await;
        n = n.saturating_add(1);
    }
}
