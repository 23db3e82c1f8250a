use std::future::Future;

use rand::Rng;
use tokio::time::{sleep, Duration};

use crate::error::{EngineError, EngineResult};

const ENABLE_LOGS: bool = true;

use crate::log_warn;

const MAX_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total tries, including the first one.
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    /// Exponential delay before retry number `retry` (1-based) with up to
    /// 50% random jitter, capped at five seconds.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let base = self.base_delay.saturating_mul(1u32 << exponent);
        let jitter_ms = (base.as_millis() as u64) / 2;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        (base + jitter).min(MAX_DELAY)
    }
}

/// Runs `operation` until it succeeds or the policy is exhausted. The last
/// failure is returned as [`EngineError::TransientStorage`].
pub async fn retry_with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut operation: F,
) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= policy.attempts => {
                return Err(EngineError::TransientStorage(format!(
                    "{label} failed after {attempt} attempts: {err:#}"
                )));
            }
            Err(err) => {
                let delay = policy.delay_for(attempt);
                log_warn!(
                    "{label} failed (attempt {attempt}/{}): {err:#}; retrying in {}ms",
                    policy.attempts,
                    delay.as_millis()
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
