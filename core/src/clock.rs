//! Timestamp source for envelope construction.
//!
//! Every envelope is stamped exactly once, when it is built. The timestamp is
//! what last-writer-wins convergence compares, so all envelopes sharing a
//! routing key must be stamped by clocks that agree on ordering.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

/// Microseconds on the hub clock. Totally ordered.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn as_micros(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// Monotonic timestamp source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock based source that never repeats a reading.
///
/// Two readings inside the same microsecond would tie, and a tie is rejected
/// by every initialized topic. A reading that is not ahead of the previous one
/// is bumped to `previous + 1`.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        let wall = chrono::Utc::now().timestamp_micros();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = if wall > prev { wall } else { prev + 1 };
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Timestamp(next),
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Settable clock for tests and simulations.
///
/// Returns the current reading without advancing unless `auto_step` is set.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
    auto_step: i64,
}

impl ManualClock {
    /// A clock frozen at `start`.
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
            auto_step: 0,
        }
    }

    /// A clock that advances by `step` after every reading.
    pub fn stepping(start: i64, step: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
            auto_step: step,
        }
    }

    pub fn set(&self, micros: i64) {
        self.now.store(micros, Ordering::SeqCst);
    }

    pub fn advance(&self, micros: i64) {
        self.now.fetch_add(micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.now.fetch_add(self.auto_step, Ordering::SeqCst))
    }
}
