//! Retry policy for the blocking channel wrappers.
//!
//! Blocking `send`/`recv` busy-poll the non-blocking operations. The default
//! policy spins forever; bounded and deadline policies turn a dead peer into a
//! `Timeout` error, and a [`CancelToken`] aborts the wait from another thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{CollectiveError, CollectiveResult};

/// Deadline checks read the clock once per this many attempts.
const CLOCK_CHECK_INTERVAL: u64 = 64;

/// Shared flag that aborts blocking operations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Limit {
    #[default]
    Unbounded,
    Attempts(u64),
    Deadline(Duration),
}

/// How long a blocking operation keeps retrying a transient failure.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    limit: Limit,
    yield_every: u64,
    cancel: Option<CancelToken>,
}

impl RetryPolicy {
    /// Spin until success.
    pub fn spin() -> Self {
        Self::default()
    }

    /// Give up after `max_attempts` failed attempts.
    pub fn bounded(max_attempts: u64) -> Self {
        Self {
            limit: Limit::Attempts(max_attempts.max(1)),
            ..Self::default()
        }
    }

    /// Give up once `budget` has elapsed since the first attempt.
    pub fn deadline(budget: Duration) -> Self {
        Self {
            limit: Limit::Deadline(budget),
            ..Self::default()
        }
    }

    /// Yield the thread every `n` failed attempts (0 disables yielding).
    pub fn with_yield_every(mut self, n: u64) -> Self {
        self.yield_every = n;
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn max_attempts(&self) -> Option<u64> {
        match self.limit {
            Limit::Attempts(n) => Some(n),
            _ => None,
        }
    }

    pub fn deadline_budget(&self) -> Option<Duration> {
        match self.limit {
            Limit::Deadline(d) => Some(d),
            _ => None,
        }
    }

    pub fn cancel_token(&self) -> Option<&CancelToken> {
        self.cancel.as_ref()
    }

    /// Run `op` until it succeeds, fails permanently, or the policy gives up.
    ///
    /// Only `QueueFull`/`QueueEmpty` are retried; every other error is
    /// returned immediately.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> CollectiveResult<T>
    where
        F: FnMut() -> CollectiveResult<T>,
    {
        let started = match self.limit {
            Limit::Deadline(_) => Some(Instant::now()),
            _ => None,
        };
        let mut attempts: u64 = 0;

        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() => {}
                Err(e) => return Err(e),
            }
            attempts += 1;

            if let Some(token) = &self.cancel {
                if token.is_cancelled() {
                    return Err(CollectiveError::Cancelled(format!(
                        "{} after {} attempts",
                        what, attempts
                    )));
                }
            }

            match self.limit {
                Limit::Unbounded => {}
                Limit::Attempts(max) => {
                    if attempts >= max {
                        return Err(CollectiveError::Timeout(format!(
                            "{} gave up after {} attempts",
                            what, attempts
                        )));
                    }
                }
                Limit::Deadline(budget) => {
                    if attempts % CLOCK_CHECK_INTERVAL == 0 {
                        if let Some(start) = started {
                            if start.elapsed() >= budget {
                                return Err(CollectiveError::Timeout(format!(
                                    "{} exceeded {:?}",
                                    what, budget
                                )));
                            }
                        }
                    }
                }
            }

            if self.yield_every != 0 && attempts % self.yield_every == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }
}
