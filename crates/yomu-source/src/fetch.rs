use std::{future::Future, time::Duration};

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use yomu_lib::error::ProviderError;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{error} (after {attempts} attempts)")]
    Provider {
        error: ProviderError,
        attempts: u32,
    },
    #[error("canceled")]
    Canceled,
    #[error("source {0} is not registered")]
    UnknownSource(i64),
}

impl FetchError {
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            FetchError::Provider { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Successful result of a provider call and how many retries it took.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub value: T,
    pub retries: u32,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub rate_limit_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            rate_limit_multiplier: 4,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, `failures` counts the failed attempts so far.
    pub fn backoff(&self, failures: u32, error: &ProviderError) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay);

        match error {
            ProviderError::RateLimited {
                retry_after: Some(retry_after),
            } => *retry_after,
            ProviderError::RateLimited { retry_after: None } => delay
                .saturating_mul(self.rate_limit_multiplier.max(1))
                .min(self.max_delay.saturating_mul(self.rate_limit_multiplier.max(1))),
            _ => delay,
        }
    }

    fn jitter(delay: Duration) -> Duration {
        let max = delay.as_millis() as u64 / 4;
        if max == 0 {
            return delay;
        }

        delay + Duration::from_millis(rand::rng().random_range(0..=max))
    }
}

/// Runs a single provider call with a timeout and bounded retries.
#[derive(Debug, Clone, Default)]
pub struct Fetcher {
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn fetch<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<Fetched<T>, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Canceled);
            }

            attempts += 1;
            let error = match tokio::time::timeout(self.policy.timeout, call()).await {
                Ok(Ok(value)) => {
                    return Ok(Fetched {
                        value,
                        retries: attempts - 1,
                    });
                }
                Ok(Err(e)) => e,
                Err(_) => ProviderError::Unavailable(format!(
                    "timed out after {:?}",
                    self.policy.timeout
                )),
            };

            if !error.is_transient() || attempts >= max_attempts {
                return Err(FetchError::Provider { error, attempts });
            }

            let delay = RetryPolicy::jitter(self.policy.backoff(attempts, &error));
            warn!("attempt {attempts}/{max_attempts} failed: {error}, retrying in {delay:?}");

            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(5),
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            rate_limit_multiplier: 4,
        }
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let policy = policy();
        let error = ProviderError::unavailable("down");

        assert_eq!(policy.backoff(1, &error), Duration::from_millis(100));
        assert_eq!(policy.backoff(2, &error), Duration::from_millis(200));
        assert_eq!(policy.backoff(3, &error), Duration::from_millis(400));
        assert_eq!(policy.backoff(10, &error), Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_rate_limited() {
        let policy = policy();

        assert_eq!(
            policy.backoff(1, &ProviderError::RateLimited { retry_after: None }),
            Duration::from_millis(400)
        );
        assert_eq!(
            policy.backoff(
                1,
                &ProviderError::RateLimited {
                    retry_after: Some(Duration::from_secs(7))
                }
            ),
            Duration::from_secs(7)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_then_succeed() {
        let _ = env_logger::builder().is_test(true).try_init();

        let calls = Arc::new(AtomicU32::new(0));
        let fetcher = Fetcher::new(policy());
        let cancel = CancellationToken::new();

        let res = fetcher
            .fetch(&cancel, || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ProviderError::unavailable("connection reset"))
                    } else {
                        Ok("pages")
                    }
                }
            })
            .await;

        let fetched = res.unwrap();
        assert_eq!(fetched.value, "pages");
        assert_eq!(fetched.retries, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_on_permanent_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let fetcher = Fetcher::new(policy());
        let cancel = CancellationToken::new();

        let res: Result<Fetched<()>, _> = fetcher
            .fetch(&cancel, || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::content_missing("404"))
                }
            })
            .await;

        match res {
            Err(FetchError::Provider { error, attempts }) => {
                assert_eq!(error, ProviderError::content_missing("404"));
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let fetcher = Fetcher::new(policy());
        let cancel = CancellationToken::new();

        let res: Result<Fetched<()>, _> = fetcher
            .fetch(&cancel, || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::RateLimited { retry_after: None })
                }
            })
            .await;

        match res {
            Err(FetchError::Provider { error, attempts }) => {
                assert!(error.is_transient());
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let calls = Arc::new(AtomicU32::new(0));
        let fetcher = Fetcher::new(policy());
        let cancel = CancellationToken::new();

        let res = fetcher
            .fetch(&cancel, || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                    Ok::<_, ProviderError>(42)
                }
            })
            .await;

        let fetched = res.unwrap();
        assert_eq!(fetched.value, 42);
        assert_eq!(fetched.retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let fetcher = Fetcher::new(RetryPolicy {
            base_delay: Duration::from_secs(10),
            ..policy()
        });
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                cancel.cancel();
            })
        };

        let res: Result<Fetched<()>, _> = fetcher
            .fetch(&cancel, || async {
                Err(ProviderError::unavailable("down"))
            })
            .await;

        canceller.await.unwrap();
        assert!(matches!(res, Err(FetchError::Canceled)));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let fetcher = Fetcher::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let res = fetcher
            .fetch(&cancel, || async { Ok::<_, ProviderError>(()) })
            .await;

        assert!(matches!(res, Err(FetchError::Canceled)));
    }
}
