//! Retry policy and the per-node retry execution wrapper.

mod failure_signature;

pub use failure_signature::{normalize_error, FailureTracker};

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;

use crate::cancel::CancelToken;
use crate::outcome::Outcome;

/// Error returned by a handler's `execute`, or synthesized from a caught panic.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Exponential (or linear, with `factor=1`) backoff schedule.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Backoff {
    /// Delay before the (0-indexed) `attempt`th retry: `min(initial * factor^attempt, max)`.
    /// With jitter, the actual sleep is drawn uniformly from `[0, base_delay]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_millis = self.initial_delay.as_millis() as f64 * self.factor.powi(attempt as i32);
        let capped = base_millis.min(self.max_delay.as_millis() as f64);
        let base = Duration::from_millis(capped.max(0.0) as u64);
        if self.jitter {
            let millis = base.as_millis() as u64;
            let drawn = if millis == 0 { 0 } else { rand::thread_rng().gen_range(0..=millis) };
            Duration::from_millis(drawn)
        } else {
            base
        }
    }
}

/// `{max_attempts, backoff, should_retry_fn}` — attempts = retries + 1.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub should_retry: Option<Arc<dyn Fn(&HandlerError) -> bool + Send + Sync>>,
}

impl RetryPolicy {
    fn should_retry(&self, error: &HandlerError) -> bool {
        match &self.should_retry {
            Some(f) => f(error),
            None => true,
        }
    }

    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff { initial_delay: Duration::from_millis(200), factor: 2.0, max_delay: Duration::from_secs(60), jitter: false },
            should_retry: None,
        }
    }

    pub fn standard() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff { initial_delay: Duration::from_millis(200), factor: 2.0, max_delay: Duration::from_secs(60), jitter: true },
            should_retry: None,
        }
    }

    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff { initial_delay: Duration::from_millis(500), factor: 2.0, max_delay: Duration::from_secs(60), jitter: true },
            should_retry: None,
        }
    }

    pub fn linear() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff { initial_delay: Duration::from_millis(500), factor: 1.0, max_delay: Duration::from_secs(60), jitter: false },
            should_retry: None,
        }
    }

    pub fn patient() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff { initial_delay: Duration::from_millis(2000), factor: 3.0, max_delay: Duration::from_secs(60), jitter: true },
            should_retry: None,
        }
    }

    /// Resolves a preset policy by name, falling back to `standard` for an
    /// unrecognized name.
    pub fn by_name(name: &str) -> Self {
        match name {
            "none" => Self::none(),
            "aggressive" => Self::aggressive(),
            "linear" => Self::linear(),
            "patient" => Self::patient(),
            _ => Self::standard(),
        }
    }

    /// Builds a policy from a resolved attempts budget (`max_retries` attribute
    /// → graph default → engine default) layered over the standard backoff.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::standard()
        }
    }
}

/// Runs `attempt` up to `policy.max_attempts` times, retrying on handler
/// error or a `retry`-status outcome, sleeping (cancellably) between
/// attempts. Panics inside `attempt` are caught and converted to a fail
/// outcome carrying the panic message. Returns a synthetic fail outcome (or
/// partial_success when `allow_partial` is set) once the budget is exhausted,
/// alongside the number of attempts actually made (for checkpoint/retry-count
/// bookkeeping upstream).
pub async fn execute_with_retry<F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    allow_partial: bool,
    mut attempt: F,
) -> (Outcome, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Outcome, HandlerError>> + Send,
{
    let mut last_error: Option<HandlerError> = None;
    let mut attempts_made = 0;

    for n in 0..policy.max_attempts {
        attempts_made = n + 1;
        if cancel.is_cancelled() {
            return (Outcome::fail("cancelled"), attempts_made);
        }

        let result = AssertUnwindSafe(attempt(n)).catch_unwind().await;
        let outcome_result = match result {
            Ok(inner) => inner,
            Err(panic) => {
                let message = panic_message(&panic);
                Err(HandlerError::new(format!("handler panicked: {message}")))
            }
        };

        match outcome_result {
            Ok(outcome) if outcome.status() == crate::outcome::Status::Retry => {
                last_error = outcome.failure_reason.clone().map(HandlerError::new);
            }
            Ok(outcome) => return (outcome, attempts_made),
            Err(err) => {
                let retry_allowed = policy.should_retry(&err);
                last_error = Some(err);
                if !retry_allowed {
                    break;
                }
            }
        }

        let attempts_left = policy.max_attempts.saturating_sub(n + 1);
        if attempts_left == 0 {
            break;
        }
        let delay = policy.backoff.delay_for_attempt(n);
        if crate::cancel::cancellable_sleep(delay, cancel).await.is_err() {
            return (Outcome::fail("cancelled"), attempts_made);
        }
    }

    let reason = last_error.map(|e| e.0).unwrap_or_else(|| "retry budget exhausted".to_string());
    let outcome = if allow_partial {
        Outcome::partial_success(reason)
    } else {
        Outcome::fail(reason)
    };
    (outcome, attempts_made)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
