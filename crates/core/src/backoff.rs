use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::CrawlError;

/// Exponential backoff with jitter: `base * factor^attempt`, capped at `max`,
/// multiplied by a random factor in `[1 - jitter, 1 + jitter]`.
///
/// The single retry policy for every external call in the pipeline.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.as_secs_f64() * self.factor.powi(attempt.min(24) as i32);
        let capped = exp.min(self.max.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let r: f64 = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            capped * (1.0 + r)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.clamp(0.0, self.max.as_secs_f64()))
    }

    /// Run `op` up to `attempts` times, sleeping between retryable failures.
    /// Non-retryable errors and the final failure propagate unchanged.
    pub async fn retry<T, F, Fut>(&self, attempts: u32, mut op: F) -> Result<T, CrawlError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CrawlError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.delay(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> Backoff {
        Backoff {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(10),
            jitter: 0.0,
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let b = no_jitter();
        assert_eq!(b.delay(0), Duration::from_millis(100));
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(2), Duration::from_millis(400));
        assert_eq!(b.delay(20), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_in_band() {
        let b = Backoff {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(300),
            jitter: 0.5,
        };
        for attempt in 0..8 {
            let nominal = 1.0 * 2.0f64.powi(attempt);
            let d = b.delay(attempt as u32).as_secs_f64();
            assert!(d >= nominal * 0.5 - 1e-9 && d <= nominal * 1.5 + 1e-9);
        }
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let b = Backoff {
            base: Duration::from_millis(1),
            ..no_jitter()
        };
        let out = b
            .retry(5, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(CrawlError::Network("flaky".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_on_permanent_errors() {
        let calls = AtomicU32::new(0);
        let b = no_jitter();
        let out: Result<(), _> = b
            .retry(5, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CrawlError::InvalidUrl("nope".into())) }
            })
            .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
