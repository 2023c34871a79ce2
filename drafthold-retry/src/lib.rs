//! Retry state machine and backoff schedule for Drafthold save attempts
//!
//! The retry policy is modelled as an explicit state machine so that the
//! decision of *whether* and *when* to try again is testable without the
//! I/O call it wraps:
//!
//! ```text
//! Attempting(n) ──ok──────────────▶ Success
//!      │
//!      └─transient failure─▶ Backoff(n+1) ──resume──▶ Attempting(n+1)
//!      │                        (no attempts left) ──▶ Exhausted
//!      └─permanent failure─────────────────────────▶ Exhausted
//! ```
//!
//! Delays follow `min(base * 2^attempt, cap)` where `attempt` is the
//! zero-based index of the attempt that just failed.

use backoff::backoff::Backoff;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default number of retries after the first attempt
pub const DEFAULT_RETRIES: u32 = 3;

/// Default delay before the second attempt
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Default upper bound on any single delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(10_000);

/// Errors raised when building a policy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("base delay must be non-zero")]
    ZeroBaseDelay,
    #[error("max delay {max:?} is shorter than base delay {base:?}")]
    MaxBelowBase { base: Duration, max: Duration },
}

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Retry budget plus exponential delay schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Policy with the default schedule and the given retry budget
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// Policy with a custom delay schedule
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Result<Self, PolicyError> {
        if base_delay.is_zero() {
            return Err(PolicyError::ZeroBaseDelay);
        }
        if max_delay < base_delay {
            return Err(PolicyError::MaxBelowBase {
                base: base_delay,
                max: max_delay,
            });
        }
        Ok(Self {
            max_retries,
            base_delay,
            max_delay,
        })
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total number of attempts this policy allows (`retries + 1`)
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait after the zero-based `attempt` failed
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Upper bound on the total time spent sleeping between attempts
    pub fn total_delay(&self) -> Duration {
        (0..self.max_retries).map(|i| self.delay_for(i)).sum()
    }

    /// Backoff schedule for this policy, usable with the `backoff` crate
    pub fn schedule(&self) -> ScheduleBackoff {
        ScheduleBackoff {
            policy: *self,
            next_attempt: 0,
        }
    }

    /// Start a fresh state machine driven by this policy
    pub fn start(&self, operation: &'static str) -> RetryMachine {
        RetryMachine {
            operation,
            schedule: self.schedule(),
            state: RetryState::Attempting(0),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_retries(DEFAULT_RETRIES)
    }
}

/// Deterministic exponential schedule (no jitter) capped by the policy
///
/// Yields `retries` delays and then `None`, so it can be handed to
/// `backoff::future::retry` directly.
#[derive(Debug, Clone)]
pub struct ScheduleBackoff {
    policy: RetryPolicy,
    next_attempt: u32,
}

impl Backoff for ScheduleBackoff {
    fn reset(&mut self) {
        self.next_attempt = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.next_attempt >= self.policy.max_retries {
            return None;
        }
        let delay = self.policy.delay_for(self.next_attempt);
        self.next_attempt += 1;
        Some(delay)
    }
}

/// State of a retried operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Attempt `n` (zero-based) is about to run or running
    Attempting(u32),
    /// Waiting `delay` before attempt `next`
    Backoff { next: u32, delay: Duration },
    /// Finished successfully after `attempts` attempts
    Success { attempts: u32 },
    /// Gave up after `attempts` attempts
    Exhausted { attempts: u32 },
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success { .. } | Self::Exhausted { .. })
    }
}

/// How a single attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Transient,
    Permanent,
}

impl AttemptOutcome {
    /// Classify a result using the error's own transience
    pub fn of<T, E: RetryableError>(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::Succeeded,
            Err(e) if e.is_transient() => Self::Transient,
            Err(_) => Self::Permanent,
        }
    }
}

/// Stepper over [`RetryState`] for one operation
#[derive(Debug, Clone)]
pub struct RetryMachine {
    operation: &'static str,
    schedule: ScheduleBackoff,
    state: RetryState,
}

impl RetryMachine {
    pub fn state(&self) -> RetryState {
        self.state
    }

    /// Number of attempts recorded so far
    pub fn attempts(&self) -> u32 {
        match self.state {
            RetryState::Attempting(n) => n,
            RetryState::Backoff { next, .. } => next,
            RetryState::Success { attempts } | RetryState::Exhausted { attempts } => attempts,
        }
    }

    /// Record the outcome of the current attempt and move to the next state
    ///
    /// Calling this outside `Attempting` leaves the state unchanged.
    pub fn record(&mut self, outcome: AttemptOutcome) -> RetryState {
        let RetryState::Attempting(n) = self.state else {
            return self.state;
        };
        let attempts = n + 1;

        self.state = match outcome {
            AttemptOutcome::Succeeded => {
                if attempts > 1 {
                    debug!(operation = self.operation, attempts, "operation succeeded after retry");
                }
                RetryState::Success { attempts }
            }
            AttemptOutcome::Permanent => {
                warn!(operation = self.operation, attempt = n, "permanent failure, not retrying");
                RetryState::Exhausted { attempts }
            }
            AttemptOutcome::Transient => match self.schedule.next_backoff() {
                Some(delay) => {
                    debug!(
                        operation = self.operation,
                        attempt = n,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, backing off"
                    );
                    RetryState::Backoff {
                        next: attempts,
                        delay,
                    }
                }
                None => {
                    warn!(operation = self.operation, attempts, "retry budget exhausted");
                    RetryState::Exhausted { attempts }
                }
            },
        };
        self.state
    }

    /// Leave `Backoff` once the delay has elapsed
    pub fn resume(&mut self) -> RetryState {
        if let RetryState::Backoff { next, .. } = self.state {
            self.state = RetryState::Attempting(next);
        }
        self.state
    }
}
