//! A single timer: an expiration instant, an optional repeat interval, and
//! a monotonically assigned sequence number used to break ties when two
//! timers share the same expiration.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use crate::callbacks::TimerCallback;

static NEXT_SEQUENCE: AtomicI64 = AtomicI64::new(1);

pub struct Timer {
    callback: TimerCallback,
    expiration: Instant,
    interval: Duration,
    repeating: bool,
    sequence: i64,
}

impl Timer {
    pub fn new(callback: TimerCallback, expiration: Instant, interval: Duration) -> Timer {
        Timer {
            callback,
            expiration,
            repeating: !interval.is_zero(),
            interval,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn run(&self) {
        (self.callback)();
    }

    pub fn expiration(&self) -> Instant {
        self.expiration
    }

    pub fn repeating(&self) -> bool {
        self.repeating
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// Advance `expiration` by one interval from `now`. Only meaningful
    /// when `repeating()`.
    pub fn restart(&mut self, now: Instant) {
        if self.repeating {
            self.expiration = now + self.interval;
        }
    }
}

/// Opaque handle returned by `TimerQueue::add_timer`, usable only with the
/// queue that created it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerId {
    pub(crate) sequence: i64,
}

impl TimerId {
    pub(crate) fn new(sequence: i64) -> TimerId {
        TimerId { sequence }
    }
}
