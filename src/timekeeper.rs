//! Self-imposed execution budget.
//!
//! A [`Timekeeper`] is created at the start of a unit of work with a time
//! budget that is deliberately shorter than whatever hard limit the host puts
//! on a request. Work loops call [`Timekeeper::ping`] (or iterate through
//! [`Timekeeper::iterate`]) and stop cleanly once the budget is spent, leaving
//! enough headroom to persist progress and schedule a continuation.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Signal that the time budget of a [`Timekeeper`] has been spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("time budget of {budget:?} exceeded after {elapsed:?}")]
pub struct DeadlineExceeded {
    pub budget: Duration,
    pub elapsed: Duration,
}

/// Source of "now" for a [`Timekeeper`].
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to. Clones share the same time line.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap();
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock().unwrap()
    }
}

/// Deadline guard for a single invocation.
#[derive(Clone)]
pub struct Timekeeper {
    budget: Duration,
    started_at: Instant,
    clock: Arc<dyn Clock>,
}

impl Timekeeper {
    /// Starts a guard on the system clock.
    pub fn new(budget: Duration) -> Self {
        Self::with_clock(budget, Arc::new(SystemClock))
    }

    /// Starts a guard reading time from `clock`; the start instant is taken now.
    pub fn with_clock(budget: Duration, clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now();
        Self {
            budget,
            started_at,
            clock,
        }
    }

    pub fn from_millis(budget_ms: u64) -> Self {
        Self::new(Duration::from_millis(budget_ms))
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.started_at)
    }

    /// Returns the remaining budget, or [`DeadlineExceeded`] once it is spent.
    pub fn ping(&self) -> Result<Duration, DeadlineExceeded> {
        let elapsed = self.elapsed();
        if elapsed >= self.budget {
            return Err(DeadlineExceeded {
                budget: self.budget,
                elapsed,
            });
        }
        Ok(self.budget - elapsed)
    }

    pub fn is_exhausted(&self) -> bool {
        self.ping().is_err()
    }

    /// Wraps `items` so that the budget is checked before each element is
    /// handed out. Yields `(remaining, item)`; the first time the budget is
    /// found spent it yields the error once and then ends.
    pub fn iterate<I>(&self, items: I) -> Iterate<'_, I::IntoIter>
    where
        I: IntoIterator,
    {
        Iterate {
            timekeeper: self,
            inner: items.into_iter(),
            tripped: false,
        }
    }
}

impl std::fmt::Debug for Timekeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timekeeper")
            .field("budget", &self.budget)
            .field("elapsed", &self.elapsed())
            .finish()
    }
}

/// Iterator returned by [`Timekeeper::iterate`].
pub struct Iterate<'a, I> {
    timekeeper: &'a Timekeeper,
    inner: I,
    tripped: bool,
}

impl<I: Iterator> Iterator for Iterate<'_, I> {
    type Item = Result<(Duration, I::Item), DeadlineExceeded>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.tripped {
            return None;
        }
        // An exhausted sequence ends cleanly even when the budget is gone.
        let item = self.inner.next()?;
        match self.timekeeper.ping() {
            Ok(remaining) => Some(Ok((remaining, item))),
            Err(e) => {
                self.tripped = true;
                Some(Err(e))
            }
        }
    }
}
