//! # Reconnection Policy
//!
//! Purpose: Decide how long to wait before the next connection attempt and
//! when to give up for good.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: `RetryStrategy` is pluggable; closures implement
//!    it directly, `ExponentialBackoff` is the default.
//! 2. **Hard Budget**: The connect timeout caps cumulative retry time; the
//!    last delay is clamped to exactly fill what remains.
//! 3. **Pure Planning**: `plan_retry` has no side effects so the boundary
//!    rules are unit-testable without timers or sockets.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::BackoffConfig;
use crate::error::BrokenReason;

/// Inputs handed to a retry strategy.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// 1-based attempt number of the upcoming reconnect.
    pub attempt: u32,
    /// Sum of all delays already waited since the last ready connection.
    pub total_retry_time: Duration,
    /// Number of successful transport connects so far.
    pub times_connected: u32,
    /// Error that caused the disconnect, if any.
    pub error: Option<String>,
}

/// Outcome of a retry strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then reconnect.
    RetryAfter(Duration),
    /// Stop reconnecting; the client becomes terminally broken.
    Abort(Option<String>),
}

/// Pluggable reconnection strategy.
pub trait RetryStrategy: Send + Sync + 'static {
    fn next_delay(&self, ctx: &RetryContext) -> RetryDecision;
}

impl<F> RetryStrategy for F
where
    F: Fn(&RetryContext) -> RetryDecision + Send + Sync + 'static,
{
    fn next_delay(&self, ctx: &RetryContext) -> RetryDecision {
        self(ctx)
    }
}

/// `delay = min(base * factor^(attempt - 1), max)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, factor: f64, max: Duration) -> Self {
        ExponentialBackoff { base, factor, max }
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, ctx: &RetryContext) -> RetryDecision {
        let exponent = ctx.attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = (self.base.as_millis() as f64 * self.factor.max(1.0).powi(exponent)).round();
        let delay = if scaled.is_finite() && scaled < self.max.as_millis() as f64 {
            Duration::from_millis(scaled as u64)
        } else {
            self.max
        };
        RetryDecision::RetryAfter(delay)
    }
}

/// Shared handle to a retry strategy.
#[derive(Clone)]
pub struct RetryPolicy(Arc<dyn RetryStrategy>);

impl RetryPolicy {
    pub fn new(strategy: impl RetryStrategy) -> Self {
        RetryPolicy(Arc::new(strategy))
    }

    pub(crate) fn backoff(config: &BackoffConfig) -> Self {
        RetryPolicy::new(ExponentialBackoff::new(
            config.base_delay,
            config.factor,
            config.max_delay,
        ))
    }

    pub(crate) fn strategy(&self) -> &dyn RetryStrategy {
        self.0.as_ref()
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RetryPolicy(..)")
    }
}

/// Retry bookkeeping for one outage.
///
/// Reset only when the connection becomes ready; the total retry time never
/// decreases in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
    pub total_retry_time: Duration,
    pub delay: Duration,
    pub last_error: Option<String>,
}

impl Default for RetryState {
    fn default() -> Self {
        RetryState {
            attempt: 1,
            total_retry_time: Duration::ZERO,
            delay: Duration::ZERO,
            last_error: None,
        }
    }
}

impl RetryState {
    pub fn reset(&mut self) {
        *self = RetryState::default();
    }

    /// Records that the planned delay has elapsed and an attempt is starting.
    pub fn begin_attempt(&mut self) {
        self.total_retry_time += self.delay;
        self.attempt += 1;
    }

    /// Marks the whole budget as spent (used when a connect attempt times out).
    pub fn exhaust(&mut self, budget: Duration) {
        self.total_retry_time = self.total_retry_time.max(budget);
    }

    /// Remaining connect budget.
    pub fn remaining(&self, budget: Duration) -> Duration {
        budget.saturating_sub(self.total_retry_time)
    }
}

/// What the connection manager should do after a disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPlan {
    /// Schedule a reconnect after this delay.
    Retry(Duration),
    /// Give up and fail everything with `ConnectionBroken`.
    Broken(BrokenReason),
}

/// Plans the next reconnect.
///
/// **Logic**:
/// 1. Ask the strategy; an abort is terminal.
/// 2. If the cumulative retry time already reached `budget`, give up without
///    scheduling a timer.
/// 3. Clamp the delay so `total + delay` never exceeds `budget`.
pub fn plan_retry(
    strategy: &dyn RetryStrategy,
    state: &RetryState,
    budget: Duration,
    times_connected: u32,
) -> RetryPlan {
    let ctx = RetryContext {
        attempt: state.attempt,
        total_retry_time: state.total_retry_time,
        times_connected,
        error: state.last_error.clone(),
    };
    let delay = match strategy.next_delay(&ctx) {
        RetryDecision::RetryAfter(delay) => delay,
        RetryDecision::Abort(reason) => return RetryPlan::Broken(BrokenReason::RetryAborted(reason)),
    };

    if state.total_retry_time >= budget {
        return RetryPlan::Broken(BrokenReason::TimeoutExceeded);
    }
    RetryPlan::Retry(delay.min(state.remaining(budget)))
}
