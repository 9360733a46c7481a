//! Software timers.
//!
//! Timers occupy the same circular run-list as tasks. When the scheduler
//! visits a due timer it runs the callback inline on its own stack, rearms a
//! periodic timer by `start += delay; delay = period` (so periods do not
//! drift), and wakes every task blocked on the timer's own wait queue.
//! Callbacks therefore must be short and never block; they may use the
//! non-blocking half of the API (`give`, posting signals, arming timers).

use crate::sync::Arc;
use crate::time::Deadline;
use crate::wait::WaitQueue;

/// Stable handle for a timer slot in the kernel arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub(crate) u32);

/// Timer callback, invoked inline by the scheduler with the kernel unlocked.
pub type TimerCallbackFn = Arc<dyn Fn() + Send + Sync + 'static>;

/// Configuration for creating a timer.
///
/// A timer created without `after` starts disarmed; arm it later with
/// `Kernel::arm_timer`. Capture primitives or recorder handles in the
/// callback, not `Kernel` clones (the callback lives inside the kernel).
pub struct TimerConfig {
    pub(crate) name: &'static str,
    pub(crate) callback: TimerCallbackFn,
    pub(crate) delay: Option<u32>,
    pub(crate) period: Option<u32>,
}

impl TimerConfig {
    pub fn new(name: &'static str, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            name,
            callback: Arc::new(callback),
            delay: None,
            period: None,
        }
    }

    /// Arms the timer at creation, firing `ticks` after the kernel creates it.
    pub fn after(mut self, ticks: u32) -> Self {
        self.delay = Some(ticks);
        self
    }

    /// Makes the timer periodic with the given interval.
    pub fn every(mut self, ticks: u32) -> Self {
        self.period = Some(ticks);
        self
    }
}

/// Kernel-side timer control block, stored in the arena.
pub(crate) struct TimerCb {
    pub(crate) name: &'static str,
    pub(crate) callback: TimerCallbackFn,
    /// `None` while disarmed (including a one-shot that has fired).
    pub(crate) deadline: Option<Deadline>,
    pub(crate) period: Option<u32>,
    /// Waiters blocked until the next fire.
    pub(crate) queue: WaitQueue,
}

impl TimerCb {
    pub(crate) fn armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Post-fire bookkeeping: periodic timers advance their start by the
    /// delay just consumed, one-shots disarm.
    pub(crate) fn rearm_after_fire(&mut self) {
        match (self.deadline.take(), self.period) {
            (Some(old), Some(period)) => {
                self.deadline = Some(Deadline::new(old.expiry(), period));
            }
            _ => {
                self.deadline = None;
            }
        }
    }
}
