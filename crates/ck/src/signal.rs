//! Asynchronous signal delivery.
//!
//! One task posts a signal to another and the target handles it even while
//! sleeping or blocked, without hardware preemption. Delivery is an explicit
//! per-task state machine: posting to a suspended task saves its remaining
//! deadline and marks the slot `Staged`; the scheduler checks that mark ahead
//! of the due-ness test, drains the pending set in ascending signal-number
//! order (kernel unlocked around every handler call), restores the deadline
//! and takes a full pass again. Delivery therefore costs one extra scheduling
//! pass and is only observed at the target's own turn.
//!
//! Posting to the currently running task runs the handlers synchronously on
//! the caller's stack; there is nothing to stage into.

use crate::kernel::{KernelError, KernelInner, KernelState};
use crate::sync::{Arc, MutexGuard};
use crate::task::{SignalHandlerFn, TaskId, TaskState};
use crate::time::Deadline;

/// Number of signal slots per task.
pub const SIGNAL_COUNT: u8 = 32;

/// Per-task delivery state.
#[derive(Clone)]
pub(crate) enum Delivery {
    Idle,
    /// Delivery pending at the task's next turn; `saved` holds the deadline
    /// the task gets back once the handlers have run.
    Staged { saved: Option<Deadline> },
    /// Handlers are running right now.
    Delivering,
}

/// Pending bitset, optional handler and delivery state for one task.
pub(crate) struct SignalSlot {
    pub(crate) pending: u32,
    pub(crate) handler: Option<SignalHandlerFn>,
    pub(crate) delivery: Delivery,
}

impl SignalSlot {
    pub(crate) fn new(handler: Option<SignalHandlerFn>) -> Self {
        Self {
            pending: 0,
            handler,
            delivery: Delivery::Idle,
        }
    }

    pub(crate) fn is_staged(&self) -> bool {
        matches!(self.delivery, Delivery::Staged { .. })
    }
}

impl KernelInner {
    pub(crate) fn post_signal_inner(&self, target: TaskId, num: u8) -> Result<(), KernelError> {
        if num >= SIGNAL_COUNT {
            return Err(KernelError::InvalidSignal(num));
        }
        let mut state = self.state.lock();
        {
            let t = state
                .try_task_mut(target)
                .ok_or(KernelError::TaskNotFound(target))?;
            if t.state == TaskState::Stopped {
                return Err(KernelError::TaskStopped(target));
            }
            t.signals.pending |= 1u32 << num;
            if t.signals.handler.is_none() {
                // No handler: the bit stays pending for `take_signals`.
                return Ok(());
            }
            match t.signals.delivery {
                Delivery::Staged { .. } | Delivery::Delivering => {
                    // Delivery already underway; the new bit joins the drain.
                    return Ok(());
                }
                Delivery::Idle => {}
            }
        }

        if state.running == Some(target) {
            // Posting to self: run the handlers right now.
            state.task_mut(target).signals.delivery = Delivery::Delivering;
            let mut state = self.drain_signals(state, target);
            state.task_mut(target).signals.delivery = Delivery::Idle;
            return Ok(());
        }

        let t = state.task_mut(target);
        let saved = t.deadline.take();
        t.signals.delivery = Delivery::Staged { saved };
        log::trace!("signal {} staged for task '{}'", num, t.name);
        Ok(())
    }

    /// Scheduler-side trampoline: runs the staged handlers, restores the
    /// saved deadline (unless something woke the task meanwhile) and leaves
    /// the slot idle. The caller takes a full scheduling pass afterwards.
    pub(crate) fn deliver_staged<'a>(
        &'a self,
        mut state: MutexGuard<'a, KernelState>,
        id: TaskId,
    ) -> MutexGuard<'a, KernelState> {
        let saved = {
            let t = state.task_mut(id);
            match std::mem::replace(&mut t.signals.delivery, Delivery::Delivering) {
                Delivery::Staged { saved } => saved,
                other => {
                    t.signals.delivery = other;
                    return state;
                }
            }
        };

        let mut state = self.drain_signals(state, id);

        let t = state.task_mut(id);
        t.signals.delivery = Delivery::Idle;
        if t.state == TaskState::TimedWait && t.deadline.is_none() {
            // Still suspended: give back the remaining delay so the original
            // wait times out when it always would have.
            t.deadline = saved;
        }
        state
    }

    /// Runs the handler once per pending bit, lowest signal number first,
    /// with the kernel unlocked around each call. Handlers may post further
    /// signals (including to the task being delivered); those bits simply
    /// join the drain.
    fn drain_signals<'a>(
        &'a self,
        mut state: MutexGuard<'a, KernelState>,
        id: TaskId,
    ) -> MutexGuard<'a, KernelState> {
        loop {
            let (num, handler) = {
                let t = state.task_mut(id);
                if t.signals.pending == 0 {
                    break;
                }
                let num = t.signals.pending.trailing_zeros() as u8;
                t.signals.pending &= !(1u32 << num);
                match &t.signals.handler {
                    Some(h) => (num, Arc::clone(h)),
                    None => break,
                }
            };
            drop(state);
            handler(num);
            state = self.state.lock();
            if state.task(id).state == TaskState::Stopped {
                break;
            }
        }
        state
    }

    pub(crate) fn pending_signals(&self, id: TaskId) -> u32 {
        self.state.lock().task(id).signals.pending
    }

    pub(crate) fn take_signals(&self, id: TaskId) -> u32 {
        let mut state = self.state.lock();
        std::mem::take(&mut state.task_mut(id).signals.pending)
    }
}
