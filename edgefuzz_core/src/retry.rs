//! Bounded exponential backoff for collaborator calls.

use crate::cancel::CancelToken;
use crate::config::RetrySettings;
use rand::Rng;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            max_attempts: settings.max_attempts.max(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based): the doubled base, capped,
    /// with jitter drawn from its upper half.
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.initial_backoff.as_millis() as u64;
        let exp = base
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(32))
            .min(self.max_backoff.as_millis() as u64);
        let jitter = if exp == 0 {
            0
        } else {
            rng.random_range(0..=exp / 2)
        };
        Duration::from_millis(exp - exp / 2 + jitter)
    }
}

/// Wall-clock allowance shared by every collaborator call in one round.
#[derive(Debug, Clone, Copy)]
pub struct RoundBudget {
    deadline: Instant,
}

impl RoundBudget {
    pub fn new(budget: Duration) -> Self {
        Self {
            deadline: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_zero()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    AttemptsExhausted,
    BudgetExhausted,
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::AttemptsExhausted => f.write_str("attempt limit reached"),
            StopReason::BudgetExhausted => f.write_str("round time budget exhausted"),
            StopReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Error, Debug)]
#[error("gave up after {attempts} attempt(s), {reason}: {last}")]
pub struct RetryExhausted<E: fmt::Debug + fmt::Display> {
    pub attempts: u32,
    pub reason: StopReason,
    pub last: E,
}

/// Runs `op` until it succeeds or the policy, the budget or cancellation stops it.
///
/// `op` receives the 1-based attempt number.
pub fn retry<T, E, R, F>(
    policy: &RetryPolicy,
    budget: &RoundBudget,
    rng: &mut R,
    cancel: &CancelToken,
    what: &str,
    mut op: F,
) -> Result<T, RetryExhausted<E>>
where
    E: fmt::Debug + fmt::Display,
    R: Rng + ?Sized,
    F: FnMut(u32) -> Result<T, E>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let error = match op(attempt) {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        tracing::warn!(what, attempt, error = %error, "Collaborator call failed");

        let stop = |reason| RetryExhausted {
            attempts: attempt,
            reason,
            last: error,
        };
        if attempt >= policy.max_attempts {
            return Err(stop(StopReason::AttemptsExhausted));
        }
        let delay = policy.delay_for(attempt, rng);
        if budget.remaining() <= delay {
            return Err(stop(StopReason::BudgetExhausted));
        }
        tracing::debug!(what, delay_ms = delay.as_millis() as u64, "Backing off");
        if !cancel.sleep(delay) {
            return Err(stop(StopReason::Cancelled));
        }
    }
}
