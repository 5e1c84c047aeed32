//! Retry with exponential backoff

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryPolicyConfig;
use crate::errors::{Result, ShardManagementError, ShardManagementErrorCode};

/// Decides whether an error is worth retrying.
pub type TransientErrorDetector = Arc<dyn Fn(&ShardManagementError) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    retry_count: u32,
    min_backoff: Duration,
    max_backoff: Duration,
    delta_backoff: Duration,
    detector: TransientErrorDetector,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retry_count", &self.retry_count)
            .field("min_backoff", &self.min_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("delta_backoff", &self.delta_backoff)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryPolicyConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryPolicyConfig) -> Self {
        Self {
            retry_count: config.retry_count,
            min_backoff: config.min_backoff(),
            max_backoff: config.max_backoff(),
            delta_backoff: config.delta_backoff(),
            detector: Arc::new(ShardManagementError::is_transient),
        }
    }

    /// Single attempt, no sleeping.
    pub fn no_retry() -> Self {
        Self::from_config(&RetryPolicyConfig {
            retry_count: 0,
            ..RetryPolicyConfig::default()
        })
    }

    pub fn with_transient_detector(mut self, detector: TransientErrorDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Delay before retry number `attempt` (zero based), with ±20% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.8..=1.2);
        let factor = 2f64.powi(attempt.min(30) as i32 + 1) - 1.0;
        let delta = self.delta_backoff.as_secs_f64() * factor * jitter;
        let delay = self.min_backoff.as_secs_f64() + delta;
        Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64()))
    }

    pub fn is_transient(&self, error: &ShardManagementError) -> bool {
        (self.detector)(error)
    }

    /// Run `f` until it succeeds, fails with a non-transient error, or the
    /// retry budget runs out.
    pub fn execute<T, F>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if self.is_transient(&e) => {
                    if attempt >= self.retry_count {
                        log::error!("{} gave up after {} attempts: {}", operation, attempt + 1, e);
                        return Err(exhausted(operation, attempt + 1, e));
                    }
                    let delay = self.backoff(attempt);
                    log::warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        operation,
                        attempt + 1,
                        self.retry_count + 1,
                        delay,
                        e
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn exhausted(operation: &str, attempts: u32, last: ShardManagementError) -> ShardManagementError {
    let mut err = ShardManagementError::new(
        last.category,
        ShardManagementErrorCode::RetryLimitExceeded,
        format!("{} did not succeed after {} attempts: {}", operation, attempts, last.message),
    );
    err.context = last.context;
    err.source = last.source;
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ShardManagementErrorCategory;
    use crate::store::StoreError;
    use std::cell::Cell;

    fn fast(retries: u32) -> RetryPolicy {
        RetryPolicy::from_config(&RetryPolicyConfig {
            retry_count: retries,
            min_backoff_ms: 0,
            max_backoff_ms: 1,
            delta_backoff_ms: 0,
        })
    }

    fn transient() -> ShardManagementError {
        ShardManagementError::from_store_error(
            ShardManagementErrorCategory::ShardMap,
            "Op",
            StoreError::Transient("deadlock".into()),
        )
    }

    #[test]
    fn test_retries_until_success() {
        let calls = Cell::new(0);
        let value = fast(3)
            .execute("Op", || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(transient())
                } else {
                    Ok(42)
                }
            })
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_exhaustion_reports_retry_limit() {
        let calls = Cell::new(0);
        let err = fast(2)
            .execute("Op", || -> Result<()> {
                calls.set(calls.get() + 1);
                Err(transient())
            })
            .unwrap_err();
        assert_eq!(calls.get(), 3);
        assert_eq!(err.code, ShardManagementErrorCode::RetryLimitExceeded);
        assert!(matches!(err.source, Some(StoreError::Transient(_))));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_non_transient_is_not_retried() {
        let calls = Cell::new(0);
        let err = fast(5)
            .execute("Op", || -> Result<()> {
                calls.set(calls.get() + 1);
                Err(ShardManagementError::new(
                    ShardManagementErrorCategory::ShardMap,
                    ShardManagementErrorCode::ShardHasMappings,
                    "busy",
                ))
            })
            .unwrap_err();
        assert_eq!(calls.get(), 1);
        assert_eq!(err.code, ShardManagementErrorCode::ShardHasMappings);
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let policy = RetryPolicy::default();
        let first = policy.backoff(0);
        assert!(first >= Duration::from_millis(179) && first <= Duration::from_millis(221));
        assert_eq!(policy.backoff(20), Duration::from_secs(30));
    }
}
