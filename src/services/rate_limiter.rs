//! Rate limiting and retry helpers for the external services the pipeline
//! talks to over HTTP: the AcoustID-style lookup and MusicBrainz-style
//! resolution in the fingerprint matcher, and the LLM classifier's
//! chat-completions endpoint. A `governor`-backed token bucket per
//! upstream plus a `backoff`-driven `retry_async` for transient failures,
//! kept separate from the batch scheduler's per-item retry, which retries a
//! whole extractor invocation rather than a single HTTP call.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use tracing::warn;

/// Steady-state rate plus burst allowance for one upstream API.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub requests_per_second: u32,
    pub burst_size: u32,
}

/// A named `governor` token bucket. Callers await `until_ready` before
/// issuing the request it guards.
pub struct ApiRateLimiter {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    name: &'static str,
}

impl ApiRateLimiter {
    pub fn new(name: &'static str, config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN),
        )
        .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        ApiRateLimiter {
            limiter: Arc::new(RateLimiter::direct(quota)),
            name,
        }
    }

    /// AcoustID's documented guideline is roughly 3 requests/second per
    /// client, with short bursts tolerated.
    pub fn for_acoustid() -> Self {
        Self::new(
            "acoustid",
            RateLimitConfig {
                requests_per_second: 3,
                burst_size: 3,
            },
        )
    }

    /// MusicBrainz's API etiquette requires at most 1 request/second per
    /// client with a distinct `User-Agent` (already set on the client in
    /// `fingerprint.rs`).
    pub fn for_musicbrainz() -> Self {
        Self::new(
            "musicbrainz",
            RateLimitConfig {
                requests_per_second: 1,
                burst_size: 1,
            },
        )
    }

    /// Conservative default for the LLM endpoint; no published limit
    /// applies uniformly across providers, so this just keeps a runaway
    /// batch from hammering the endpoint.
    pub fn for_llm() -> Self {
        Self::new(
            "llm",
            RateLimitConfig {
                requests_per_second: 4,
                burst_size: 4,
            },
        )
    }

    pub async fn wait(&self) {
        self.limiter.until_ready().await;
        tracing::trace!(client = %self.name, "rate limit permit acquired");
    }
}

/// Retry shape for one logical HTTP call: a handful of short,
/// exponentially growing waits, bounded by a total elapsed-time ceiling so
/// a stuck upstream can't stall a pipeline item indefinitely.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub max_elapsed_time: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            multiplier: 2.0,
            max_elapsed_time: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    fn to_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            multiplier: self.multiplier,
            max_elapsed_time: Some(self.max_elapsed_time),
            ..Default::default()
        }
    }
}

/// Run `operation` until it succeeds, `config.max_retries` attempts are
/// exhausted, or `backoff` runs out of schedule, whichever comes first.
pub async fn retry_async<T, F, Fut>(operation_name: &str, config: &RetryConfig, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempts = 0;
    let mut backoff = config.to_backoff();

    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempts >= config.max_retries {
                    warn!(operation = %operation_name, attempts, error = %e, "giving up after max retries");
                    return Err(e);
                }
                match backoff.next_backoff() {
                    Some(duration) => {
                        warn!(operation = %operation_name, attempt = attempts, error = %e, retry_in_ms = duration.as_millis() as u64, "retrying after transient failure");
                        tokio::time::sleep(duration).await;
                    }
                    None => return Err(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn retry_config_default_allows_a_few_attempts() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
    }

    #[tokio::test]
    async fn retry_async_stops_once_operation_succeeds() {
        let attempts = AtomicU32::new(0);
        let config = RetryConfig {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            ..RetryConfig::default()
        };

        let result: Result<u32> = retry_async("test-op", &config, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    anyhow::bail!("transient failure");
                }
                Ok(n)
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_async_gives_up_after_max_retries() {
        let attempts = AtomicU32::new(0);
        let config = RetryConfig {
            max_retries: 2,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            ..RetryConfig::default()
        };

        let result: Result<u32> = retry_async("test-op", &config, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move { anyhow::bail!("always fails") }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rate_limiter_permits_burst_then_waits() {
        let limiter = ApiRateLimiter::new(
            "test",
            RateLimitConfig {
                requests_per_second: 1000,
                burst_size: 2,
            },
        );
        limiter.wait().await;
        limiter.wait().await;
    }
}
