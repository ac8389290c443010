use crate::error::GatewayError;
use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};

/// Exponential-backoff-with-jitter policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Raw backoff for attempt `n` (0-based): `min(initial·factor^n, max_delay)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }

    /// Backoff with ±20% uniform jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt).as_secs_f64();
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        Duration::from_secs_f64(base * jitter)
    }
}

/// Drive `op` up to `max_retries + 1` times under `policy`.
///
/// `op` receives the 0-based attempt number. An error is retried only
/// when `GatewayError::is_retryable` says so; between attempts the
/// driver sleeps the jittered backoff, never past `deadline`. The
/// `on_retry` observer sees each scheduled retry before the sleep.
pub async fn execute<T, F, Fut, O>(
    policy: &RetryPolicy,
    deadline: Option<Instant>,
    mut on_retry: O,
    mut op: F,
) -> Result<T, GatewayError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
    O: FnMut(u32, &GatewayError, Duration),
{
    let mut attempt: u32 = 0;
    loop {
        let result = op(attempt).await;
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if attempt >= policy.max_retries || !err.is_retryable() {
            return Err(err);
        }

        let delay = policy.delay_for(attempt);
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining <= delay {
                return Err(err);
            }
        }

        on_retry(attempt + 1, &err, delay);
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
