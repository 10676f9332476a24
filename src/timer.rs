//! # Timer Scheduler Module
//!
//! Deadline-ordered timers for the driver loop. The scheduler answers two
//! questions each iteration: how long may the readiness wait block before
//! the next deadline, and which timers have expired and must run now.
//!
//! Three timer kinds exist: the duration limit (fires once and sets the
//! session's `done` flag), the end of the warm-up window (fires once), and
//! the periodic interval report (re-arms itself with its period).

use std::time::{Duration, Instant};
use tracing::trace;

/// What a fired timer means to the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    /// The wall-clock duration limit elapsed.
    DurationExpired,
    /// The warm-up (omitting) window is over.
    OmitOver,
    /// A periodic interval report is due.
    IntervalReport,
}

#[derive(Debug)]
struct Timer {
    deadline: Instant,
    kind: TimerKind,
    /// Re-arm period for periodic timers.
    period: Option<Duration>,
}

/// Deadline-ordered timer collection.
///
/// The set is tiny (at most three pending timers), so a plain vector with a
/// linear scan is used rather than a heap.
#[derive(Debug, Default)]
pub struct TimerScheduler {
    timers: Vec<Timer>,
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot timer.
    pub fn schedule(&mut self, kind: TimerKind, deadline: Instant) {
        self.timers.push(Timer {
            deadline,
            kind,
            period: None,
        });
    }

    /// Arm a periodic timer; after each firing it re-arms `period` later.
    pub fn schedule_periodic(&mut self, kind: TimerKind, first: Instant, period: Duration) {
        self.timers.push(Timer {
            deadline: first,
            kind,
            period: Some(period),
        });
    }

    /// Time until the nearest deadline, `None` if no timer is pending.
    ///
    /// Returns a zero duration for overdue timers so the readiness wait does
    /// not block past them.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.timers
            .iter()
            .map(|t| t.deadline.saturating_duration_since(now))
            .min()
    }

    /// Run all timers whose deadline has passed, in deadline order.
    ///
    /// Expired one-shot timers are removed; periodic timers are re-armed. A
    /// periodic timer that fell several periods behind fires once and skips
    /// ahead past `now` rather than firing in a burst.
    pub fn run_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut fired = Vec::new();

        // Collect in deadline order so e.g. an interval report due before
        // the duration limit is emitted first.
        self.timers.sort_by_key(|t| t.deadline);

        let mut idx = 0;
        while idx < self.timers.len() {
            if self.timers[idx].deadline > now {
                idx += 1;
                continue;
            }
            let kind = self.timers[idx].kind;
            trace!("timer fired: {:?}", kind);
            fired.push(kind);
            match self.timers[idx].period {
                Some(period) => {
                    let timer = &mut self.timers[idx];
                    while timer.deadline <= now {
                        timer.deadline += period;
                    }
                    idx += 1;
                }
                None => {
                    self.timers.remove(idx);
                }
            }
        }

        fired
    }

    /// Drop every pending timer.
    pub fn clear(&mut self) {
        self.timers.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}
