//! The generic blocking/wakeup protocol.
//!
//! Every synchronization primitive speaks the same vocabulary: append the
//! current task to a FIFO wait queue, suspend it with one of three timeout
//! anchors, and wake members later with a result code. Queue membership is
//! expressed through the arena: a queue is a head index, each waiting task
//! carries a `guard` back-reference to its queue and a `q_next` link to the
//! next waiter.
//!
//! Timeouts have no machinery of their own. A blocked task's deadline is
//! checked by the exact same due-ness test the scheduler applies to timers
//! during its run-list walk; when the deadline matures first, the scheduler
//! synthesizes the `Timeout` result itself. Sleeping, blocking with timeout
//! and timer firing are one mechanism.

use crate::kernel::{KernelInner, KernelState};
use crate::task::{TaskContext, TaskId, TaskState};
use crate::time::{ticks_until, Deadline, Timeout};

/// Handle for one FIFO wait queue, embedded in every synchronization
/// primitive. Handles are only meaningful for the kernel that created them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitQueue(pub(crate) u32);

/// Result delivered to a blocked task by whoever wakes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WakeCode {
    /// The awaited condition held.
    Success,
    /// The deadline passed first.
    Timeout,
    /// The primitive was reset while the task waited.
    Stopped,
}

/// What a blocking call observes after resumption: the wake code plus the
/// wait-queue payload word, which wakers may rewrite before waking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOutcome {
    pub code: WakeCode,
    pub data: u64,
}

/// Timeout anchoring for the three wait flavors.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Anchor {
    /// Relative to now.
    For(Timeout),
    /// Relative to the task's previous deadline (drift-free periodic re-arm).
    Next(u32),
    /// Absolute tick.
    Until(u32),
}

impl KernelState {
    pub(crate) fn new_queue(&mut self) -> WaitQueue {
        self.queues.push(None);
        WaitQueue(self.queues.len() as u32 - 1)
    }

    fn queue_slot(&self, queue: WaitQueue) -> usize {
        let slot = queue.0 as usize;
        assert!(
            slot < self.queues.len(),
            "wait queue {:?} does not belong to this kernel",
            queue
        );
        slot
    }

    /// FIFO append: O(n) scan to the tail so arrival order is preserved.
    pub(crate) fn append_waiter(&mut self, queue: WaitQueue, id: TaskId) {
        let slot = self.queue_slot(queue);
        debug_assert!(
            self.task(id).guard.is_none(),
            "task {:?} is already waiting on a queue",
            id
        );
        {
            let t = self.task_mut(id);
            t.guard = Some(queue);
            t.q_next = None;
        }
        match self.queues[slot] {
            None => self.queues[slot] = Some(id),
            Some(head) => {
                let mut tail = head;
                while let Some(next) = self.task(tail).q_next {
                    tail = next;
                }
                self.task_mut(tail).q_next = Some(id);
            }
        }
    }

    /// Search-and-unlink of one member. Returns false if the task was not in
    /// the queue (it may have been woken concurrently with the caller's
    /// decision to remove it).
    pub(crate) fn detach_waiter(&mut self, queue: WaitQueue, id: TaskId) -> bool {
        let slot = self.queue_slot(queue);
        let Some(head) = self.queues[slot] else {
            return false;
        };
        if head == id {
            self.queues[slot] = self.task(id).q_next;
        } else {
            let mut cur = head;
            loop {
                match self.task(cur).q_next {
                    Some(next) if next == id => {
                        self.task_mut(cur).q_next = self.task(id).q_next;
                        break;
                    }
                    Some(next) => cur = next,
                    None => return false,
                }
            }
        }
        let t = self.task_mut(id);
        t.guard = None;
        t.q_next = None;
        true
    }

    pub(crate) fn queue_members(&self, queue: WaitQueue) -> Vec<TaskId> {
        let slot = self.queue_slot(queue);
        let mut members = Vec::new();
        let mut cur = self.queues[slot];
        while let Some(id) = cur {
            members.push(id);
            cur = self.task(id).q_next;
        }
        members
    }

    /// Makes a task runnable with the given result, detaching it from its
    /// wait queue first if it is in one.
    pub(crate) fn wake_task(&mut self, id: TaskId, code: WakeCode) {
        if let Some(queue) = self.task(id).guard {
            self.detach_waiter(queue, id);
        }
        let t = self.task_mut(id);
        t.state = TaskState::Ready;
        t.deadline = None;
        t.wake_code = code;
        log::trace!("task '{}' woken with {:?}", t.name, code);
    }

    /// Pops and wakes the queue head.
    pub(crate) fn wake_one(&mut self, queue: WaitQueue, code: WakeCode) -> Option<TaskId> {
        let slot = self.queue_slot(queue);
        let head = self.queues[slot]?;
        self.wake_task(head, code);
        Some(head)
    }

    /// Drains up to `n` members in FIFO order with the same code.
    pub(crate) fn wake_n(&mut self, queue: WaitQueue, code: WakeCode, n: usize) -> usize {
        let mut woken = 0;
        while woken < n {
            if self.wake_one(queue, code).is_none() {
                break;
            }
            woken += 1;
        }
        woken
    }

    /// Wakes one specific member, wherever it sits in the queue.
    pub(crate) fn wake_specific(&mut self, queue: WaitQueue, id: TaskId, code: WakeCode) -> bool {
        self.queue_slot(queue);
        if self.task(id).guard != Some(queue) {
            return false;
        }
        self.wake_task(id, code);
        true
    }

    /// Walks the queue in FIFO order handing each member's payload word to
    /// `decide`; members for which it returns true are woken with `code`.
    /// Payload rewrites are kept either way, which lets a waker record
    /// partial progress (flag groups) or deliver a result mask.
    pub(crate) fn wake_filter(
        &mut self,
        queue: WaitQueue,
        code: WakeCode,
        decide: &mut dyn FnMut(&mut u64) -> bool,
    ) -> usize {
        let members = self.queue_members(queue);
        let mut woken = 0;
        for id in members {
            if self.task(id).guard != Some(queue) {
                continue;
            }
            let mut data = self.task(id).wait_data;
            let wake = decide(&mut data);
            self.task_mut(id).wait_data = data;
            if wake {
                self.wake_task(id, code);
                woken += 1;
            }
        }
        woken
    }
}

impl KernelInner {
    /// First half of a suspension: computes the deadline, records the wait
    /// state and appends to the queue. Returns `Some` for the degenerate
    /// cases that must not block (zero timeout, deadline already past).
    ///
    /// The park itself lives on `TaskContext`, which holds the handshake
    /// endpoints: a parked task must not keep a strong kernel reference.
    pub(crate) fn block_prepare(
        &self,
        ctx: &TaskContext,
        anchor: Anchor,
        queue: Option<WaitQueue>,
        data: u64,
    ) -> Option<WaitOutcome> {
        let mut state = self.state.lock();
        let id = ctx.id();
        debug_assert_eq!(
            state.running,
            Some(id),
            "blocking call from outside the running task"
        );
        let now = state.tick;

        let deadline = match anchor {
            Anchor::For(Timeout::Immediate) => {
                return Some(WaitOutcome {
                    code: WakeCode::Timeout,
                    data,
                })
            }
            Anchor::For(Timeout::Ticks(n)) => Some(Deadline::new(now, n)),
            Anchor::For(Timeout::Forever) => None,
            Anchor::Next(n) => {
                let base = state
                    .task(id)
                    .last_deadline
                    .map(|d| d.expiry())
                    .unwrap_or(now);
                Some(Deadline::new(base, n))
            }
            Anchor::Until(at) => {
                let remaining = ticks_until(now, at);
                if remaining == 0 {
                    return Some(WaitOutcome {
                        code: WakeCode::Timeout,
                        data,
                    });
                }
                Some(Deadline::new(now, remaining))
            }
        };

        {
            let t = state.task_mut(id);
            t.deadline = deadline;
            if let Some(d) = deadline {
                t.last_deadline = Some(d);
            }
            t.state = TaskState::TimedWait;
            t.wake_code = WakeCode::Timeout;
            t.wait_data = data;
        }
        if let Some(q) = queue {
            state.append_waiter(q, id);
        }
        None
    }

    /// Second half of a suspension: what the waker (or the scheduler's
    /// timeout synthesis) left behind.
    pub(crate) fn block_collect(&self, id: TaskId) -> WaitOutcome {
        let state = self.state.lock();
        let t = state.task(id);
        WaitOutcome {
            code: t.wake_code,
            data: t.wait_data,
        }
    }

    pub(crate) fn is_running(&self, id: TaskId) -> bool {
        self.state.lock().running == Some(id)
    }
}
