//! Monotonic time sources for the session wall-clock budget.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Elapsed-time source injected into the scheduler, so tests can substitute
/// a manually driven clock.
pub trait Clock {
    /// Time elapsed since the session started.
    fn elapsed(&self) -> Duration;
}

/// Wall clock backed by `std::time::Instant`.
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Manually driven clock. Clones share the same underlying time, so a test
/// can keep one handle and hand another to the scheduler.
#[derive(Clone, Default)]
pub struct ManualClock {
    elapsed: Rc<Cell<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.elapsed.set(self.elapsed.get() + by);
    }

    pub fn set(&self, elapsed: Duration) {
        self.elapsed.set(elapsed);
    }
}

impl Clock for ManualClock {
    fn elapsed(&self) -> Duration {
        self.elapsed.get()
    }
}
