use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::engine::LedgerError;

/// Backoff policy for storage writes.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Random extra delay as a fraction of the current backoff (0..1).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        let next = current.as_millis() as f64 * self.backoff_multiplier;
        Duration::from_millis(next.min(self.max_backoff.as_millis() as f64) as u64)
    }

    fn jittered(&self, backoff: Duration) -> Duration {
        let range = (backoff.as_millis() as f64 * self.jitter_factor) as u64;
        let jitter = if range > 0 {
            rand::thread_rng().gen_range(0..range)
        } else {
            0
        };
        backoff.saturating_add(Duration::from_millis(jitter))
    }
}

/// Run `operation` until it succeeds, fails with a non-transient error, or
/// runs out of retries. Business errors come back on the first attempt.
pub async fn with_retry<F, Fut, T>(mut operation: F, config: &RetryConfig) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let mut attempt = 0;
    let mut backoff = config.initial_backoff;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() || attempt >= config.max_retries => return Err(e),
            Err(e) => {
                attempt += 1;
                let delay = config.jittered(backoff);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "storage write failed, retrying");
                tokio::time::sleep(delay).await;
                backoff = config.next_backoff(backoff);
            }
        }
    }
}
