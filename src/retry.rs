//! Fixed-interval retry for fallible, idempotent operations.
//!
//! Every network call the launcher makes goes through [`retry`]. Two presets
//! cover the callers: [`RetryPolicy::UNBOUNDED`] for readiness polling, where
//! the broker may be migrating for an arbitrary amount of time, and
//! [`RetryPolicy::BOUNDED`] for calls where persistent failure means something
//! is actually wrong (for example a rejected auth token).

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

/// Bounds and pacing for one [`retry`] invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Give up once this much wall-clock time has passed since the first attempt.
    pub max_elapsed: Option<Duration>,
    /// Give up once this many attempts have been made.
    pub max_attempts: Option<u32>,
    /// Sleep between a failed attempt and the next one. Must be non-zero.
    pub interval: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

    /// Retry forever.
    pub const UNBOUNDED: Self = Self {
        max_elapsed: None,
        max_attempts: None,
        interval: Self::DEFAULT_INTERVAL,
    };

    /// Retry for at most 60s or 100 attempts, whichever comes first.
    pub const BOUNDED: Self = Self {
        max_elapsed: Some(Duration::from_secs(60)),
        max_attempts: Some(100),
        interval: Self::DEFAULT_INTERVAL,
    };

    /// Same bounds, different pacing.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub const fn is_bounded(&self) -> bool {
        self.max_elapsed.is_some() || self.max_attempts.is_some()
    }

    fn exceeded(&self, started: Instant, attempt: u32) -> Option<Bound> {
        if let Some(max) = self.max_elapsed
            && started.elapsed() > max
        {
            return Some(Bound::MaxElapsed(max));
        }
        if let Some(max) = self.max_attempts
            && attempt > max
        {
            return Some(Bound::MaxAttempts(max));
        }
        None
    }
}

/// Which limit a bounded retry ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    MaxElapsed(Duration),
    MaxAttempts(u32),
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxElapsed(d) => write!(f, "max retry time {d:?}"),
            Self::MaxAttempts(n) => write!(f, "max retry attempts {n}"),
        }
    }
}

/// A bounded retry gave up.
#[derive(Debug, thiserror::Error)]
#[error("gave up retrying operation `{operation}` on reaching {bound}, last error: {last_error:#}")]
pub struct RetryError {
    pub operation: String,
    pub bound: Bound,
    #[source]
    pub last_error: anyhow::Error,
}

/// Run `op` until it succeeds or `policy` runs out.
///
/// Bounds are checked before each attempt, so an attempt already in flight
/// always completes. With [`RetryPolicy::UNBOUNDED`] this only returns `Ok`.
pub fn retry<T, F>(operation: &str, policy: RetryPolicy, mut op: F) -> Result<T, RetryError>
where
    F: FnMut() -> anyhow::Result<T>,
{
    debug_assert!(!policy.interval.is_zero(), "retry interval must be non-zero");

    let started = Instant::now();
    let mut attempt: u32 = 1;
    let mut last_error: Option<anyhow::Error> = None;

    loop {
        if let Some(bound) = policy.exceeded(started, attempt) {
            return Err(RetryError {
                operation: operation.to_string(),
                bound,
                last_error: last_error
                    .unwrap_or_else(|| anyhow::anyhow!("operation was never attempted")),
            });
        }

        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::debug!(attempt, operation, error = %format!("{e:#}"), "attempt failed");
                last_error = Some(e);
            }
        }

        attempt = attempt.saturating_add(1);
        thread::sleep(policy.interval);
    }
}
