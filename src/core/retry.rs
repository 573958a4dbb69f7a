/*!
 * Retry logic with exponential backoff
 *
 * A file transfer is retried from byte 0 on transient failures. The policy is
 * an explicit state machine:
 *
 * ```text
 * Attempting(n) --ok--------------------------> Succeeded
 * Attempting(n) --transient, n < max----------> Backoff(n, delay) --> Attempting(n + 1)
 * Attempting(n) --transient, n == max---------> PermanentlyFailed (RetriesExhausted)
 * Attempting(n) --permanent / fatal / cancel--> PermanentlyFailed
 * ```
 *
 * Delays go through a [`Sleeper`], so tests observe them without waiting.
 */

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use super::cancel::CancellationToken;
use crate::config::TransferConfig;
use crate::error::{FailureClass, FreightError, Result};

/// Where the policy is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Running attempt `attempt` (1-based)
    Attempting { attempt: u32 },
    /// Attempt `attempt` failed transiently; wait `delay` before the next one
    Backoff { attempt: u32, delay: Duration },
    Succeeded,
    PermanentlyFailed,
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryState::Succeeded | RetryState::PermanentlyFailed)
    }
}

/// One finished attempt, handed to the observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    pub attempt: u32,
    /// State the policy moved to after this attempt
    pub next: RetryState,
    pub error: Option<String>,
}

impl AttemptReport {
    pub fn succeeded(&self) -> bool {
        self.next == RetryState::Succeeded
    }

    /// Delay before the next attempt, if one is scheduled
    pub fn next_delay(&self) -> Option<Duration> {
        match self.next {
            RetryState::Backoff { delay, .. } => Some(delay),
            _ => None,
        }
    }
}

/// Result of running an operation under the policy
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    /// Attempts actually started
    pub attempts: u32,
    /// Transient failures absorbed or exhausted
    pub retry_count: u32,
}

/// Delay provider
pub trait Sleeper: Send + Sync {
    fn sleep(&self, delay: Duration);
}

/// Blocks the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        thread::sleep(delay);
    }
}

/// Records requested delays and returns immediately
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, delay: Duration) {
        self.delays
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(delay);
    }
}

/// Bounded retries with capped exponential backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::MAX,
            jitter: false,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Add up to 10% random jitter to each delay
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay())
            .with_max_delay(config.max_delay())
            .with_jitter(config.backoff_jitter)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after failed attempt `attempt`: base × 2^(attempt − 1), capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let delay = 2u32
            .checked_pow(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(self.max_delay);
        delay.min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let spread = u64::try_from(delay.as_millis() / 10).unwrap_or(u64::MAX);
        if !self.jitter || spread == 0 {
            return delay;
        }
        let extra = rand::rng().random_range(0..=spread);
        delay
            .saturating_add(Duration::from_millis(extra))
            .min(self.max_delay)
    }

    /// Transition taken when attempt `attempt` fails with `err`
    pub fn next_state(&self, attempt: u32, err: &FreightError) -> RetryState {
        match err.class() {
            FailureClass::Transient if attempt < self.max_attempts => RetryState::Backoff {
                attempt,
                delay: self.jittered(self.delay_for(attempt)),
            },
            _ => RetryState::PermanentlyFailed,
        }
    }

    /// Run `operation` until it succeeds or the policy gives up
    ///
    /// `operation` receives the 1-based attempt number. `observer` is called
    /// once per attempt that was started.
    pub fn execute<T, F, O>(
        &self,
        sleeper: &dyn Sleeper,
        cancel: Option<&CancellationToken>,
        mut observer: O,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Result<T>,
        O: FnMut(&AttemptReport),
    {
        let mut attempt = 1;
        let mut retry_count = 0;

        loop {
            if cancel.is_some_and(|token| token.is_cancelled()) {
                debug!(attempt, "Cancelled before attempt");
                return RetryOutcome {
                    result: Err(FreightError::Cancelled),
                    attempts: attempt - 1,
                    retry_count,
                };
            }

            debug!(state = ?RetryState::Attempting { attempt }, "Starting attempt");
            let err = match operation(attempt) {
                Ok(value) => {
                    observer(&AttemptReport {
                        attempt,
                        next: RetryState::Succeeded,
                        error: None,
                    });
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        retry_count,
                    };
                }
                Err(err) => err,
            };

            let next = self.next_state(attempt, &err);
            if err.is_transient() {
                retry_count += 1;
            }
            observer(&AttemptReport {
                attempt,
                next,
                error: Some(err.to_string()),
            });

            match next {
                RetryState::Backoff { delay, .. } => {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    sleeper.sleep(delay);
                    attempt += 1;
                }
                _ => {
                    let err = if err.is_transient() {
                        warn!(attempt, error = %err, "Retries exhausted");
                        FreightError::RetriesExhausted {
                            attempts: attempt,
                            last_error: Box::new(err),
                        }
                    } else {
                        debug!(attempt, category = %err.category(), "Non-retryable failure");
                        err
                    };
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt,
                        retry_count,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn timeout() -> FreightError {
        FreightError::Io(io::Error::new(io::ErrorKind::TimedOut, "timed out"))
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(100))
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = policy(10).with_max_delay(Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(64), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_saturates_at_huge_delays() {
        let policy = RetryPolicy::new(3, Duration::MAX).with_jitter(true);
        let state = policy.next_state(1, &timeout());
        assert_eq!(
            state,
            RetryState::Backoff {
                attempt: 1,
                delay: Duration::MAX
            }
        );

        let jittered = policy
            .clone()
            .with_max_delay(Duration::from_secs(5))
            .next_state(2, &timeout());
        assert_eq!(
            jittered,
            RetryState::Backoff {
                attempt: 2,
                delay: Duration::from_secs(5)
            }
        );
    }

    #[test]
    fn test_fails_twice_then_succeeds() {
        let sleeper = RecordingSleeper::new();
        let mut reports = Vec::new();
        let outcome = policy(3).execute(
            &sleeper,
            None,
            |report| reports.push(report.clone()),
            |attempt| if attempt < 3 { Err(timeout()) } else { Ok(attempt) },
        );

        assert_eq!(outcome.result.unwrap(), 3);
        assert_eq!(outcome.retry_count, 2);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert_eq!(reports.len(), 3);
        assert!(!reports[0].succeeded());
        assert_eq!(reports[1].next_delay(), Some(Duration::from_millis(200)));
        assert!(reports[2].succeeded());
    }

    #[test]
    fn test_all_transient_exhausts() {
        let sleeper = RecordingSleeper::new();
        let outcome: RetryOutcome<()> =
            policy(4).execute(&sleeper, None, |_| {}, |_| Err(timeout()));

        assert_eq!(outcome.retry_count, 4);
        assert_eq!(outcome.attempts, 4);
        assert_eq!(sleeper.delays().len(), 3);
        match outcome.result {
            Err(FreightError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }

    #[test]
    fn test_permanent_failure_aborts_immediately() {
        let sleeper = RecordingSleeper::new();
        let mut calls = 0;
        let outcome: RetryOutcome<()> = policy(5).execute(
            &sleeper,
            None,
            |_| {},
            |_| {
                calls += 1;
                Err(FreightError::Io(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "denied",
                )))
            },
        );

        assert_eq!(calls, 1);
        assert_eq!(outcome.retry_count, 0);
        assert!(sleeper.delays().is_empty());
        assert!(matches!(outcome.result, Err(FreightError::Io(_))));
    }

    #[test]
    fn test_cancel_stops_before_next_attempt() {
        let sleeper = RecordingSleeper::new();
        let token = CancellationToken::new();
        let outcome: RetryOutcome<()> = policy(5).execute(
            &sleeper,
            Some(&token),
            |_| {},
            |_| {
                token.cancel();
                Err(timeout())
            },
        );

        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.result, Err(FreightError::Cancelled)));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let policy = policy(5).with_jitter(true);
        for _ in 0..50 {
            match policy.next_state(2, &timeout()) {
                RetryState::Backoff { delay, .. } => {
                    assert!(delay >= Duration::from_millis(200));
                    assert!(delay <= Duration::from_millis(220));
                }
                other => panic!("unexpected state {:?}", other),
            }
        }
    }

    #[test]
    fn test_next_state_on_last_attempt() {
        assert_eq!(
            policy(2).next_state(2, &timeout()),
            RetryState::PermanentlyFailed
        );
        assert!(RetryState::PermanentlyFailed.is_terminal());
        assert!(!RetryState::Attempting { attempt: 1 }.is_terminal());
    }
}
