//! Bounded retry with an overall deadline.
//!
//! The remote service indexes writes asynchronously, so a read right after a
//! write may 404 and a versioned update may race another writer. Every such
//! call goes through [`RetryCoordinator::run`], which keeps re-invoking the
//! operation while it reports [`Attempt::Retryable`] and gives up with
//! [`Error::Timeout`] once the deadline has elapsed.

use crate::error::{Error, Result};
use crate::remote::RemoteError;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Outcome of a single attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt<T> {
    /// The operation succeeded
    Success(T),
    /// Not converged yet; the reason ends up in the timeout error
    Retryable(String),
    /// Give up immediately
    Fatal(RemoteError),
}

/// What is being retried, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    /// Operation, e.g. "read", "delete"
    pub action: String,
    /// Natural key of the resource, e.g. "user jane@example.com"
    pub key: String,
}

impl Subject {
    pub fn new(action: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.key)
    }
}

/// Configuration for a retry loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Overall time budget, measured from the first attempt
    pub deadline: Duration,
    /// Delay after the first retryable attempt
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Optional cap on the number of attempts
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::read_after_write()
    }
}

impl RetryConfig {
    /// Window for a read that must observe a just-issued create or update.
    pub fn read_after_write() -> Self {
        Self {
            deadline: Duration::from_secs(30),
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(10),
            max_attempts: None,
        }
    }

    /// Versioned writes: a bounded number of quick re-fetch-and-write cycles.
    pub fn versioned_write() -> Self {
        Self {
            deadline: Duration::from_secs(60),
            base_delay: Duration::from_millis(500),
            backoff_factor: 1.5,
            max_delay: Duration::from_secs(5),
            max_attempts: Some(10),
        }
    }

    /// Long window for a delete to show up as a tombstone.
    pub fn tombstone() -> Self {
        Self {
            deadline: Duration::from_secs(180),
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(10),
            max_attempts: None,
        }
    }

    /// Short window for the tombstone search that follows a create conflict.
    pub fn restore_search() -> Self {
        Self {
            deadline: Duration::from_secs(15),
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(5),
            max_attempts: None,
        }
    }

    /// A single attempt.
    pub fn no_retry() -> Self {
        Self {
            deadline: Duration::ZERO,
            max_attempts: Some(1),
            ..Self::read_after_write()
        }
    }

    /// Replace the deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Replace base and maximum delay.
    #[must_use]
    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Replace the attempt cap.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Which remote failures count as "not converged yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// NotFound right after a create or update is index lag
    ReadAfterWrite,
    /// VersionMismatch means re-fetch the version and write again
    VersionedWrite,
    /// NotFound while searching for a tombstone means it is not visible yet
    AwaitTombstone,
    /// Every failure is fatal
    Strict,
}

impl RetryPolicy {
    /// Whether `err` is retryable under this policy.
    pub fn is_retryable(&self, err: &RemoteError) -> bool {
        match self {
            Self::ReadAfterWrite | Self::AwaitTombstone => err.is_not_found(),
            Self::VersionedWrite => err.is_version_mismatch(),
            Self::Strict => false,
        }
    }

    /// Turn the result of a remote call into an attempt outcome.
    pub fn classify<T>(&self, result: std::result::Result<T, RemoteError>) -> Attempt<T> {
        match result {
            Ok(value) => Attempt::Success(value),
            Err(err) if self.is_retryable(&err) => Attempt::Retryable(err.to_string()),
            Err(err) => Attempt::Fatal(err),
        }
    }
}

/// Callback trait for retry progress notifications.
pub trait RetryCallback: Send + Sync {
    /// Called before sleeping ahead of the next attempt.
    ///
    /// # Arguments
    /// * `subject` - What is being retried
    /// * `attempt` - Attempt that just failed (1-indexed)
    /// * `reason` - Why the attempt was not accepted
    /// * `delay` - Time until the next attempt
    fn on_retry(&self, subject: &Subject, attempt: u32, reason: &str, delay: Duration);
}

/// No-op callback that does nothing.
pub struct NoCallback;

impl RetryCallback for NoCallback {
    fn on_retry(&self, _subject: &Subject, _attempt: u32, _reason: &str, _delay: Duration) {}
}

/// Callback that reports retries through the `log` facade.
pub struct LogCallback;

impl RetryCallback for LogCallback {
    fn on_retry(&self, subject: &Subject, attempt: u32, reason: &str, delay: Duration) {
        log::debug!(
            "{subject}: attempt {attempt} not accepted ({reason}), retrying in {}ms",
            delay.as_millis()
        );
    }
}

/// Runs operations until they succeed, fail fatally, or run out of time.
#[derive(Clone)]
pub struct RetryCoordinator {
    config: RetryConfig,
    callback: Arc<dyn RetryCallback>,
}

impl fmt::Debug for RetryCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetryCoordinator {
    /// Create a coordinator that logs retries.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            callback: Arc::new(LogCallback),
        }
    }

    /// Replace the retry callback.
    #[must_use]
    pub fn with_callback(mut self, callback: Arc<dyn RetryCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// Copy of this coordinator with another deadline.
    #[must_use]
    pub fn with_deadline(&self, deadline: Duration) -> Self {
        Self {
            config: self.config.clone().with_deadline(deadline),
            callback: Arc::clone(&self.callback),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Invoke `operation` until it returns `Success` or `Fatal`, or the
    /// deadline (or attempt cap) is reached.
    ///
    /// A `Fatal` outcome returns at once, without sleeping. Sleeps are clipped
    /// to the remaining budget, so the loop never waits past the deadline.
    pub fn run<T, F>(&self, subject: &Subject, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Attempt<T>,
    {
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let reason = match operation() {
                Attempt::Success(value) => {
                    if attempts > 1 {
                        log::debug!("{subject}: converged after {attempts} attempts");
                    }
                    return Ok(value);
                }
                Attempt::Fatal(err) => {
                    return Err(Error::api(&subject.action, &subject.key, err));
                }
                Attempt::Retryable(reason) => reason,
            };

            let elapsed = started.elapsed();
            let out_of_attempts = self.config.max_attempts.is_some_and(|max| attempts >= max);
            if elapsed >= self.config.deadline || out_of_attempts {
                log::warn!("{subject}: giving up after {attempts} attempts: {reason}");
                return Err(Error::Timeout {
                    action: subject.action.clone(),
                    key: subject.key.clone(),
                    waited: elapsed,
                    attempts,
                    last_reason: reason,
                });
            }

            let remaining = self.config.deadline - elapsed;
            let delay = self.config.delay_for_attempt(attempts - 1).min(remaining);
            self.callback.on_retry(subject, attempts, &reason, delay);
            thread::sleep(delay);
        }
    }

    /// Run a plain remote call, classifying its failures with `policy`.
    pub fn run_remote<T, F>(&self, subject: &Subject, policy: RetryPolicy, mut call: F) -> Result<T>
    where
        F: FnMut() -> std::result::Result<T, RemoteError>,
    {
        self.run(subject, || policy.classify(call()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::Mutex;

    fn fast(deadline_ms: u64) -> RetryConfig {
        RetryConfig::read_after_write()
            .with_deadline(Duration::from_millis(deadline_ms))
            .with_delays(Duration::from_millis(1), Duration::from_millis(2))
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(u32, String)>>);

    impl RetryCallback for Recorder {
        fn on_retry(&self, _subject: &Subject, attempt: u32, reason: &str, _delay: Duration) {
            self.0
                .lock()
                .unwrap()
                .push((attempt, reason.to_string()));
        }
    }

    #[test]
    fn test_success_first_try() {
        let coordinator = RetryCoordinator::new(RetryConfig::no_retry());
        let result = coordinator.run(&Subject::new("read", "skill x"), || Attempt::Success(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_retryable_then_success() {
        let coordinator = RetryCoordinator::new(fast(1_000));
        let calls = Rc::new(Cell::new(0));
        let calls_clone = calls.clone();

        let result = coordinator.run(&Subject::new("read", "user a"), move || {
            calls_clone.set(calls_clone.get() + 1);
            if calls_clone.get() < 3 {
                Attempt::Retryable("not indexed".to_string())
            } else {
                Attempt::Success("u-1")
            }
        });

        assert_eq!(result.unwrap(), "u-1");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_always_retryable_terminates_with_last_reason() {
        let coordinator = RetryCoordinator::new(fast(20));
        let calls = Rc::new(Cell::new(0));
        let calls_clone = calls.clone();

        let started = Instant::now();
        let result: Result<()> = coordinator.run(&Subject::new("read", "team t"), move || {
            calls_clone.set(calls_clone.get() + 1);
            Attempt::Retryable(format!("still missing #{}", calls_clone.get()))
        });

        assert!(started.elapsed() < Duration::from_secs(2));
        match result {
            Err(Error::Timeout {
                key,
                attempts,
                last_reason,
                ..
            }) => {
                assert_eq!(key, "team t");
                assert_eq!(attempts, calls.get());
                assert_eq!(last_reason, format!("still missing #{}", calls.get()));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_fatal_short_circuits_without_sleeping() {
        let config = RetryConfig::read_after_write()
            .with_delays(Duration::from_secs(5), Duration::from_secs(5));
        let recorder = Arc::new(Recorder::default());
        let coordinator = RetryCoordinator::new(config).with_callback(recorder.clone());

        let started = Instant::now();
        let result: Result<()> = coordinator.run(&Subject::new("create", "user a"), || {
            Attempt::Fatal(RemoteError::from_status(400, Some("bad.request"), "invalid email"))
        });

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(recorder.0.lock().unwrap().is_empty());
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Api { ref action, .. } if action == "create"));
    }

    #[test]
    fn test_attempt_cap() {
        let config = fast(10_000).with_max_attempts(Some(3));
        let recorder = Arc::new(Recorder::default());
        let coordinator = RetryCoordinator::new(config).with_callback(recorder.clone());

        let result: Result<()> = coordinator.run(&Subject::new("patch", "user a"), || {
            Attempt::Retryable("version mismatch".to_string())
        });

        assert!(matches!(result, Err(Error::Timeout { attempts: 3, .. })));
        let retries = recorder.0.lock().unwrap();
        assert_eq!(retries.len(), 2);
        assert_eq!(retries[0].0, 1);
    }

    #[test]
    fn test_policy_classification() {
        let not_found: std::result::Result<(), _> = Err(RemoteError::not_found("u-1"));
        assert!(matches!(
            RetryPolicy::ReadAfterWrite.classify(not_found.clone()),
            Attempt::Retryable(_)
        ));
        assert!(matches!(
            RetryPolicy::VersionedWrite.classify(not_found.clone()),
            Attempt::Fatal(_)
        ));
        assert!(matches!(
            RetryPolicy::Strict.classify(not_found),
            Attempt::Fatal(_)
        ));

        let stale: std::result::Result<(), _> = Err(RemoteError::VersionMismatch {
            message: "stale".to_string(),
        });
        assert!(matches!(
            RetryPolicy::VersionedWrite.classify(stale),
            Attempt::Retryable(_)
        ));
        assert_eq!(RetryPolicy::Strict.classify(Ok::<_, RemoteError>(7)), Attempt::Success(7));
    }

    #[test]
    fn test_run_remote() {
        let coordinator = RetryCoordinator::new(fast(1_000));
        let calls = Rc::new(Cell::new(0));
        let calls_clone = calls.clone();

        let result = coordinator.run_remote(
            &Subject::new("read", "grammar g"),
            RetryPolicy::ReadAfterWrite,
            move || {
                calls_clone.set(calls_clone.get() + 1);
                if calls_clone.get() == 1 {
                    Err(RemoteError::not_found("g"))
                } else {
                    Ok("g-1")
                }
            },
        );

        assert_eq!(result.unwrap(), "g-1");
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig::read_after_write();
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(10));
    }
}
