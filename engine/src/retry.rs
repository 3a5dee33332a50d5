//! Retry and backoff
//!
//! [`RetryPolicy::execute`] runs an async operation until it succeeds, fails
//! with a non-retryable error, or exhausts its attempts. Cancellation is
//! checked before every attempt and interrupts backoff sleeps. Cancellation
//! and configuration errors are never retried, whatever the predicate says.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{BackoffKind, RetryPolicyConfig};
use crate::error::{EngineError, ErrorKind, Result};
use crate::telemetry::EngineMetrics;

/// Delay curve between attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same delay after every failure
    Fixed(Duration),
    /// `base * attempt`
    Linear(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`, with up to 10% jitter
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Linear(base) => base.saturating_mul(attempt),
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt - 1);
                base.saturating_mul(factor).min(max)
            }
        }
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        match self {
            Backoff::Exponential { .. } if !delay.is_zero() => {
                let jitter = rand::thread_rng().gen_range(0.0..0.1);
                delay.mul_f64(1.0 - jitter)
            }
            _ => delay,
        }
    }
}

type RetryPredicate = Arc<dyn Fn(&EngineError) -> bool + Send + Sync>;

/// Bounded retry policy; stateless and shareable
#[derive(Clone)]
pub struct RetryPolicy {
    name: String,
    max_attempts: u32,
    backoff: Backoff,
    retryable: RetryPredicate,
    metrics: Option<Arc<EngineMetrics>>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(name: &str, max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            name: name.to_string(),
            max_attempts: max_attempts.max(1),
            backoff,
            retryable: Arc::new(EngineError::is_retryable),
            metrics: None,
        }
    }

    /// A policy that makes exactly one attempt
    pub fn no_retry(name: &str) -> Self {
        Self::new(name, 1, Backoff::Fixed(Duration::ZERO))
    }

    pub fn from_config(name: &str, config: &RetryPolicyConfig) -> Self {
        let base = Duration::from_millis(config.base_delay_ms);
        let backoff = match config.backoff {
            BackoffKind::Fixed => Backoff::Fixed(base),
            BackoffKind::Linear => Backoff::Linear(base),
            BackoffKind::Exponential => Backoff::Exponential {
                base,
                max: Duration::from_millis(config.max_delay_ms),
            },
        };
        Self::new(name, config.max_attempts, backoff)
    }

    /// Replace the predicate selecting retryable errors
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&EngineError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    /// Count retries in the agent's service metrics
    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    fn should_retry(&self, error: &EngineError) -> bool {
        match error.kind() {
            ErrorKind::Cancellation | ErrorKind::Configuration => false,
            _ => (self.retryable)(error),
        }
    }

    /// Run `operation` under this policy
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            attempt += 1;
            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if attempt >= self.max_attempts || !self.should_retry(&error) {
                if attempt > 1 {
                    warn!(policy = %self.name, attempts = attempt, "Giving up: {}", error);
                }
                return Err(error);
            }

            let delay = self.backoff.jittered(attempt);
            warn!(
                policy = %self.name,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Retrying after error: {}", error
            );
            if let Some(metrics) = &self.metrics {
                metrics.retry_attempted();
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(policy = %self.name, "Retry backoff interrupted by cancellation");
                    return Err(EngineError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ApiError, ConfigError, WorkloadError};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> EngineError {
        EngineError::Api(ApiError::Unreachable {
            uri: "http://10.0.0.5:4500/heartbeat".into(),
            reason: "connection refused".into(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoked_exactly_max_attempts() {
        let policy = RetryPolicy::new("test", 4, Backoff::Linear(Duration::from_secs(1)));
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .execute(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;

        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new("test", 5, Backoff::Fixed(Duration::from_millis(100)));

        let value = policy
            .execute(&CancellationToken::new(), |attempt| async move {
                if attempt < 3 {
                    Err(transient())
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_configuration_errors_never_retried() {
        let policy = RetryPolicy::new("test", 5, Backoff::Fixed(Duration::ZERO)).with_predicate(|_| true);
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .execute(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::Config(ConfigError::MissingParameter { name: "Port".into() })) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_workload_failure_not_retried_by_default() {
        let policy = RetryPolicy::new("test", 3, Backoff::Fixed(Duration::ZERO));
        let calls = AtomicU32::new(0);

        let _: Result<()> = policy
            .execute(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(EngineError::Workload(WorkloadError::Failed {
                        component: "test".into(),
                        reason: "bad results".into(),
                    }))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let policy = RetryPolicy::new("test", 3, Backoff::Fixed(Duration::ZERO));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .execute(&cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let policy = RetryPolicy::new("test", 3, Backoff::Fixed(Duration::from_secs(3600)));
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let result: Result<()> = policy.execute(&cancel, |_| async { Err(transient()) }).await;

        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_curves() {
        let linear = Backoff::Linear(Duration::from_secs(2));
        assert_eq!(linear.delay(1), Duration::from_secs(2));
        assert_eq!(linear.delay(3), Duration::from_secs(6));

        let exponential = Backoff::Exponential { base: Duration::from_secs(1), max: Duration::from_secs(30) };
        assert_eq!(exponential.delay(1), Duration::from_secs(1));
        assert_eq!(exponential.delay(4), Duration::from_secs(8));
        assert_eq!(exponential.delay(10), Duration::from_secs(30));
    }

    proptest! {
        #[test]
        fn exponential_backoff_is_monotonic_and_capped(base_ms in 1u64..5_000, max_ms in 5_000u64..60_000, attempt in 1u32..64) {
            let backoff = Backoff::Exponential {
                base: Duration::from_millis(base_ms),
                max: Duration::from_millis(max_ms),
            };
            let current = backoff.delay(attempt);
            let next = backoff.delay(attempt + 1);
            prop_assert!(next >= current);
            prop_assert!(next <= Duration::from_millis(max_ms));
        }
    }
}
