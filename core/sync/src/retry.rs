//! Backoff for replaying a queued mutation against a flaky backend.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use plotsync_common::Result;
use plotsync_storage::MutationEntry;

/// How a queued mutation is retried inside one drain pass.
///
/// Only transient failures are retried. Backoff doubles per retry and
/// starts higher for entries that already burnt attempts in earlier
/// passes, so a backend that keeps flapping is hit less often.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
        }
    }

    /// One call per entry per pass; a transient failure goes straight back
    /// to the drainer.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before in-pass retry `retry` of an entry with `attempts`
    /// earlier transient failures. Capped at `max_delay`, +/- 25% jitter.
    pub fn delay_for(&self, attempts: u32, retry: u32) -> Duration {
        let exponent = attempts.saturating_add(retry).min(16) as i32;
        let base = self.initial_delay.as_millis() as f64 * 2f64.powi(exponent);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let jitter = 0.75 + rand::random::<f64>() * 0.5;
        Duration::from_millis((capped * jitter) as u64)
    }

    /// Send one queued mutation, retrying transient failures.
    pub async fn replay<F, Fut, T>(&self, entry: &MutationEntry, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            match call().await {
                Ok(value) => {
                    if retry > 0 {
                        debug!("Mutation #{} went through after {} retries", entry.seq, retry);
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_transient() || retry >= self.max_retries => return Err(err),
                Err(err) => {
                    let delay = self.delay_for(entry.attempts, retry);
                    retry += 1;
                    warn!(
                        "{} #{} on {} failed ({}), retry {}/{} in {:?}",
                        entry.op, entry.seq, entry.table, err, retry, self.max_retries, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
