//! Bounded retry with linear backoff

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay after the given failed attempt (1-based): `base_delay * attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }

    /// Runs `op` until it succeeds or `max_attempts` is reached, returning the last error.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => return Err(e),
                Err(e) => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {} - retrying in {:?}",
                        label, attempt, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScrapeError;

    #[test]
    fn backoff_grows_with_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(3), Duration::from_millis(1500));
    }

    #[test]
    fn at_least_one_attempt() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let mut calls = 0;

        let value = policy
            .run("flaky", |attempt| {
                calls += 1;
                async move {
                    if attempt < 3 {
                        Err(ScrapeError::Browser("not yet".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn returns_last_error_when_exhausted() {
        let policy = RetryPolicy::new(2, Duration::ZERO);

        let err = policy
            .run("broken", |attempt| async move {
                Err::<(), _>(ScrapeError::Browser(format!("failure {attempt}")))
            })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "browser error: failure 2");
    }
}
