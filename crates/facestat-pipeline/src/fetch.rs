//! Image download with bounded retry.
//!
//! [`ImageFetcher`] is the network seam: the pipeline uses [`HttpFetcher`],
//! tests substitute scripted fakes. [`RetryPolicy`] retries transient failures
//! with capped exponential backoff.

use std::future::Future;
use std::time::Duration;

use facestat_core::ErrorKind;
use rand::Rng;
use thiserror::Error;

const USER_AGENT: &str = concat!("facestat/", env!("CARGO_PKG_VERSION"));

/// Failure fetching or storing one image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("HTTP status {status}")]
    Http { status: u16 },
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("image exceeds size limit of {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("payload is not a recognized image")]
    InvalidImage,
    #[error("image cache storage failed: {0}")]
    Storage(String),
}

impl FetchError {
    /// Whether another attempt might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http { status } => matches!(*status, 408 | 429 | 500..=599),
            FetchError::Timeout | FetchError::Network(_) => true,
            FetchError::TooLarge { .. } | FetchError::InvalidImage | FetchError::Storage(_) => {
                false
            }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Http { .. } => ErrorKind::HttpStatus,
            FetchError::Timeout => ErrorKind::Timeout,
            FetchError::Network(_) => ErrorKind::Network,
            FetchError::TooLarge { .. } => ErrorKind::SizeLimit,
            FetchError::InvalidImage => ErrorKind::InvalidImage,
            FetchError::Storage(_) => ErrorKind::Storage,
        }
    }
}

/// Downloads the raw bytes behind an image URL.
pub trait ImageFetcher: Send + Sync + 'static {
    /// Fetch `url`, failing with [`FetchError::TooLarge`] once the body is
    /// known to exceed `max_bytes`.
    fn fetch(
        &self,
        url: &str,
        max_bytes: u64,
    ) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;
}

/// Real fetcher backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FetchError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, max_bytes: u64) -> Result<Vec<u8>, FetchError> {
        let mut response = self.client.get(url).send().await.map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
            });
        }

        let too_large = FetchError::TooLarge { limit: max_bytes };
        let declared = response.content_length();
        if declared.is_some_and(|len| len > max_bytes) {
            return Err(too_large);
        }

        let mut body = Vec::with_capacity(declared.unwrap_or(0) as usize);
        while let Some(chunk) = response.chunk().await.map_err(classify)? {
            if (body.len() + chunk.len()) as u64 > max_bytes {
                return Err(too_large);
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(err.to_string())
    }
}

/// Capped exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retrying after the `failed_attempts`-th failure,
    /// without jitter.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails terminally, or attempts run out.
    /// Returns the final result and the number of attempts made.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> (Result<T, FetchError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return (Ok(value), attempt),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = with_jitter(self.delay_for(attempt));
                    tracing::debug!(
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "retrying image fetch"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return (Err(err), attempt),
            }
        }
    }
}

/// Add up to 25% random jitter.
fn with_jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 4;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::Http { status: 500 }.is_transient());
        assert!(FetchError::Http { status: 503 }.is_transient());
        assert!(FetchError::Http { status: 429 }.is_transient());
        assert!(FetchError::Http { status: 408 }.is_transient());
        assert!(FetchError::Timeout.is_transient());
        assert!(!FetchError::Http { status: 404 }.is_transient());
        assert!(!FetchError::TooLarge { limit: 10 }.is_transient());
        assert!(!FetchError::InvalidImage.is_transient());
        assert_eq!(FetchError::TooLarge { limit: 1 }.kind(), ErrorKind::SizeLimit);
    }

    #[test]
    fn test_delay_schedule_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(300));
        assert_eq!(policy.delay_for(2), Duration::from_millis(600));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1200));
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let d = with_jitter(Duration::from_millis(400));
            assert!(d >= Duration::from_millis(400) && d <= Duration::from_millis(500));
        }
    }

    #[tokio::test]
    async fn test_run_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let (result, attempts) = fast_policy(3)
            .run(|| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FetchError::Http { status: 500 })
                } else {
                    Ok("image")
                }
            })
            .await;
        assert_eq!(result, Ok("image"));
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_run_stops_on_terminal_error() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let (result, attempts) = fast_policy(5)
            .run(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(FetchError::Http { status: 404 })
            })
            .await;
        assert_eq!(result, Err(FetchError::Http { status: 404 }));
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let (result, attempts) = fast_policy(3)
            .run(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(FetchError::Timeout)
            })
            .await;
        assert_eq!(result, Err(FetchError::Timeout));
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
