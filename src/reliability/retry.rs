use crate::properties::EntityProperties;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Capped exponential backoff: `base^attempts` seconds, never above `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: 2.0,
            max_delay: Duration::from_secs(300),
            jitter: false,
        }
    }
}

impl Backoff {
    pub fn from_properties(props: &EntityProperties) -> Self {
        Self {
            base: props.retry_backoff_base(),
            max_delay: props.max_retry_delay(),
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(64) as i32;
        let seconds = self.base.max(1.0).powi(exponent);
        let max_seconds = self.max_delay.as_secs_f64();
        let capped = if seconds.is_finite() {
            seconds.min(max_seconds)
        } else {
            max_seconds
        };
        let delay = Duration::from_secs_f64(capped);

        if self.jitter {
            self.apply_jitter(delay)
        } else {
            delay
        }
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        let mut rng = rand::rng();
        let jitter_factor = rng.random_range(0.5..1.5);
        let jittered_millis = (delay.as_millis() as f64 * jitter_factor) as u64;
        Duration::from_millis(jittered_millis).min(self.max_delay)
    }
}

/// Outcome of one try inside [`retry_with_backoff`].
pub enum Attempt<T, E> {
    Done(T),
    Retry(E),
    Fail(E),
}

/// Runs `op` until it succeeds, fails permanently, `max_attempts` is reached or
/// `cancel` fires. Between tries it sleeps for `backoff.delay_for(attempt)`.
pub async fn retry_with_backoff<T, E, F, Fut>(
    backoff: Backoff,
    max_attempts: u32,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
{
    let mut attempt = 0;
    loop {
        let error = match op(attempt).await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fail(error) => return Err(error),
            Attempt::Retry(error) => error,
        };

        attempt += 1;
        if attempt >= max_attempts.max(1) {
            return Err(error);
        }

        let delay = backoff.delay_for(attempt);
        tracing::debug!(attempt, ?delay, "Retrying after transient failure");
        tokio::select! {
            _ = cancel.cancelled() => return Err(error),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
