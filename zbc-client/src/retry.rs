//! Exponential backoff and deadline-bounded retries.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use zbc_core::{Result, ZbcError};

use crate::config::RetryConfig;

/// Computes retry delays.
///
/// The delay for attempt `n` is `min * factor^n` clamped to `[min, max]`. With
/// jitter enabled the delay is drawn uniformly from `[min, computed]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    factor: f64,
    jitter: bool,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff starting at attempt zero.
    pub fn new(min: Duration, max: Duration, factor: f64, jitter: bool) -> Self {
        Self {
            min,
            max: max.max(min),
            factor: factor.max(1.0),
            jitter,
            attempt: 0,
        }
    }

    /// Creates a backoff from retry configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.initial_backoff(),
            config.max_backoff(),
            config.multiplier(),
            config.jitter(),
        )
    }

    /// Returns the delay for `attempt` without changing state.
    pub fn for_attempt(&self, attempt: u32) -> Duration {
        let min = self.min.as_secs_f64();
        let max = self.max.as_secs_f64();
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let computed = (min * self.factor.powi(exponent)).clamp(min, max);

        let secs = if self.jitter && computed > min {
            rand::thread_rng().gen_range(min..=computed)
        } else {
            computed
        };
        Duration::from_secs_f64(secs)
    }

    /// Returns the delay for the current attempt and advances to the next.
    pub fn duration(&mut self) -> Duration {
        let delay = self.for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Returns to attempt zero.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Returns the current attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Backoff parameters plus the time budget for one operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: Backoff,
    deadline: Duration,
}

impl RetryPolicy {
    /// Creates a policy.
    pub fn new(backoff: Backoff, deadline: Duration) -> Self {
        let mut backoff = backoff;
        backoff.reset();
        Self { backoff, deadline }
    }

    /// Creates a policy from retry configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(Backoff::from_config(config), config.deadline())
    }

    /// Returns the time budget for one operation.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Returns a fresh backoff for one operation.
    pub fn backoff(&self) -> Backoff {
        self.backoff.clone()
    }

    /// Runs `op` until it succeeds, fails terminally, or the deadline passes.
    ///
    /// `op` receives the zero-based attempt number. Each call starts with a
    /// fresh backoff.
    pub async fn retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut backoff = self.backoff();

        loop {
            let attempt = backoff.attempt();
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_terminal() => return Err(err),
                Err(err) => err,
            };

            let elapsed = started.elapsed();
            if elapsed >= self.deadline {
                tracing::warn!(
                    attempts = attempt + 1,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %err,
                    "retry deadline reached"
                );
                return Err(ZbcError::RetryDeadlineReached {
                    attempts: attempt + 1,
                    elapsed,
                    last_error: Box::new(err),
                });
            }

            let delay = backoff.duration();
            tracing::debug!(
                attempt,
                delay_us = delay.as_micros() as u64,
                error = %err,
                "operation failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Runs `op` under `policy`. See [`RetryPolicy::retry`].
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    policy.retry(op).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter() -> Backoff {
        Backoff::new(
            Duration::from_millis(1),
            Duration::from_millis(100),
            2.0,
            false,
        )
    }

    #[test]
    fn test_exponential_growth_is_clamped() {
        let backoff = no_jitter();
        assert_eq!(backoff.for_attempt(0), Duration::from_millis(1));
        assert_eq!(backoff.for_attempt(1), Duration::from_millis(2));
        assert_eq!(backoff.for_attempt(3), Duration::from_millis(8));
        assert_eq!(backoff.for_attempt(7), Duration::from_millis(100));
        assert_eq!(backoff.for_attempt(u32::MAX), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = Backoff::new(
            Duration::from_millis(1),
            Duration::from_millis(100),
            2.0,
            true,
        );
        for attempt in 0..12 {
            let ceiling = no_jitter().for_attempt(attempt);
            for _ in 0..50 {
                let delay = backoff.for_attempt(attempt);
                assert!(delay >= Duration::from_millis(1));
                assert!(delay <= ceiling);
            }
        }
    }

    #[test]
    fn test_duration_advances_and_reset() {
        let mut backoff = no_jitter();
        assert_eq!(backoff.duration(), Duration::from_millis(1));
        assert_eq!(backoff.duration(), Duration::from_millis(2));
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.duration(), Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let policy = RetryPolicy::new(no_jitter(), Duration::from_secs(10));
        let calls = Arc::new(AtomicU32::new(0));

        let result = with_retry(&policy, |_| {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ZbcError::Timeout("no answer".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_window() {
        let deadline = Duration::from_millis(50);
        let policy = RetryPolicy::new(no_jitter(), deadline);
        let started = Instant::now();

        let err = policy
            .retry(|_| async { Err::<(), _>(ZbcError::NoBrokersFound) })
            .await
            .unwrap_err();

        let elapsed = started.elapsed();
        assert!(elapsed >= deadline);
        assert!(elapsed <= deadline + Duration::from_millis(100));
        match err {
            ZbcError::RetryDeadlineReached {
                attempts,
                last_error,
                ..
            } => {
                assert!(attempts > 1);
                assert!(matches!(*last_error, ZbcError::NoBrokersFound));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_is_not_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let err = policy
            .retry(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ZbcError::Rejected("CREATE_REJECTED".into())) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ZbcError::Rejected(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_call_starts_with_fresh_backoff() {
        let policy = RetryPolicy::new(no_jitter(), Duration::from_secs(10));

        for _ in 0..2 {
            let attempts = Arc::new(std::sync::Mutex::new(Vec::new()));
            let seen = Arc::clone(&attempts);
            let _ = policy
                .retry(move |attempt| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.lock().unwrap().push(attempt);
                        if attempt < 2 {
                            Err(ZbcError::Timeout("t".into()))
                        } else {
                            Ok(())
                        }
                    }
                })
                .await;
            assert_eq!(*attempts.lock().unwrap(), vec![0, 1, 2]);
        }
    }
}
