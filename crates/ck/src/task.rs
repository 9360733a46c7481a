//! Task identity, configuration and the in-task API surface.
//!
//! Tasks are created inactive from a [`TaskConfig`], activated into the
//! run-list by the kernel, and permanently removed when stopped; bringing the
//! same work back means creating a new task. Entry procedures receive a
//! [`TaskContext`], which is the only way to reach the blocking half of the
//! kernel API (sleeping, waiting on queues, yielding, exiting).

use crate::continuation::{unwind_task, Continuation, Gate, Switchboard};
use crate::kernel::{Kernel, KernelInner};
use crate::signal::SignalSlot;
use crate::sync::{Arc, Weak};
use crate::time::{Deadline, Tick, Timeout};
use crate::wait::{Anchor, WaitOutcome, WaitQueue, WakeCode};

/// Stable handle for a task slot in the kernel arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) u32);

/// Task execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TaskState {
    /// Not schedulable: created but never activated, or permanently removed.
    Stopped,
    /// Runnable at its next run-list turn.
    Ready,
    /// Sleeping or blocked, possibly with a deadline.
    TimedWait,
}

/// What the trampoline does when an entry procedure returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OnReturn {
    /// Invoke the entry procedure again (the default: tasks run forever).
    Restart,
    /// Treat the return as an implicit stop.
    Stop,
}

/// Task entry procedure, re-invoked by the trampoline per [`OnReturn`].
pub type EntryFn = Box<dyn FnMut(&TaskContext) + Send + 'static>;

/// Per-task signal handler, called once per delivered signal number.
pub type SignalHandlerFn = Arc<dyn Fn(u8) + Send + Sync + 'static>;

/// Configuration for creating a task.
pub struct TaskConfig {
    pub(crate) name: &'static str,
    pub(crate) stack_size: Option<usize>,
    pub(crate) on_return: OnReturn,
    pub(crate) entry: EntryFn,
    pub(crate) signal_handler: Option<SignalHandlerFn>,
}

impl TaskConfig {
    pub fn new(name: &'static str, entry: impl FnMut(&TaskContext) + Send + 'static) -> Self {
        Self {
            name,
            stack_size: None,
            on_return: OnReturn::Restart,
            entry: Box::new(entry),
            signal_handler: None,
        }
    }

    /// Sets the stack size for the task's continuation. Defaults to the
    /// kernel-wide value from `KernelConfig`.
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Sets what happens when the entry procedure returns.
    pub fn on_return(mut self, policy: OnReturn) -> Self {
        self.on_return = policy;
        self
    }

    /// Registers a signal handler. Without one, posted signals accumulate in
    /// the pending set until consumed with [`TaskContext::take_signals`].
    ///
    /// Handlers run with the kernel unlocked and must not block. Capture
    /// primitives or recorder handles, not `Kernel` clones: the handler is
    /// stored inside the kernel and a strong back-reference would leak it.
    pub fn with_signal_handler(mut self, handler: impl Fn(u8) + Send + Sync + 'static) -> Self {
        self.signal_handler = Some(Arc::new(handler));
        self
    }
}

/// Kernel-side task control block, stored in the arena.
pub(crate) struct TaskCb {
    pub(crate) name: &'static str,
    pub(crate) state: TaskState,
    pub(crate) deadline: Option<Deadline>,
    /// Anchor for `*_next` waits: the most recent finite deadline.
    pub(crate) last_deadline: Option<Deadline>,
    /// Back-reference to the wait queue currently holding the task, if any.
    pub(crate) guard: Option<WaitQueue>,
    /// Intrusive link to the next waiter in that queue.
    pub(crate) q_next: Option<TaskId>,
    /// Result delivered by whoever wakes the task.
    pub(crate) wake_code: WakeCode,
    /// Primitive-specific payload carried through the wait queue.
    pub(crate) wait_data: u64,
    pub(crate) on_return: OnReturn,
    pub(crate) stack_size: Option<usize>,
    /// Present until activation moves it into the task thread.
    pub(crate) entry: Option<EntryFn>,
    pub(crate) signals: SignalSlot,
    /// Present from activation until the kernel is dropped.
    pub(crate) cont: Option<Arc<dyn Continuation>>,
}

impl TaskCb {
    pub(crate) fn new(config: TaskConfig) -> Self {
        Self {
            name: config.name,
            state: TaskState::Stopped,
            deadline: None,
            last_deadline: None,
            guard: None,
            q_next: None,
            wake_code: WakeCode::Success,
            wait_data: 0,
            on_return: config.on_return,
            stack_size: config.stack_size,
            entry: Some(config.entry),
            signals: SignalSlot::new(config.signal_handler),
            cont: None,
        }
    }
}

/// The API surface available to code running inside a task.
///
/// A context is only ever handed to the task's own entry procedure and is
/// bound to the thread backing that task; it is deliberately not `Clone`.
pub struct TaskContext {
    kernel: Weak<KernelInner>,
    id: TaskId,
    gate: Arc<Gate>,
    board: Arc<Switchboard>,
}

impl TaskContext {
    pub(crate) fn new(
        kernel: Weak<KernelInner>,
        id: TaskId,
        gate: Arc<Gate>,
        board: Arc<Switchboard>,
    ) -> Self {
        Self {
            kernel,
            id,
            gate,
            board,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// A kernel handle for use from task code (spawning, posting signals,
    /// arming timers). Do not store it across blocking calls in long-lived
    /// captures; primitives keep weak references for exactly that reason.
    pub fn kernel(&self) -> Kernel {
        Kernel::from_inner(self.inner())
    }

    /// Current kernel tick.
    pub fn now(&self) -> Tick {
        self.inner().now()
    }

    /// Suspends the task for `ticks`. Zero yields the remainder of the
    /// current turn without suspending.
    pub fn sleep_for(&self, ticks: u32) {
        if ticks == 0 {
            self.yield_now();
            return;
        }
        self.block(Anchor::For(Timeout::Ticks(ticks)), None, 0);
    }

    /// Suspends the task until `ticks` past its previous deadline, the
    /// drift-free anchor for periodic work. Falls back to "from now" when no
    /// previous deadline exists.
    pub fn sleep_next(&self, ticks: u32) {
        self.block(Anchor::Next(ticks), None, 0);
    }

    /// Suspends the task until the absolute tick `deadline`. Returns
    /// immediately if the deadline already passed.
    pub fn sleep_until(&self, deadline: Tick) {
        self.block(Anchor::Until(deadline), None, 0);
    }

    /// Gives up the remainder of the current turn; the task stays ready and
    /// runs again at its next run-list visit.
    pub fn yield_now(&self) {
        let _running = self.inner().is_running(self.id);
        debug_assert!(_running, "yield from outside the running task");
        self.park();
    }

    /// Stops the calling task permanently. Unwinds the task thread; drop
    /// guards on the task's stack run as usual.
    pub fn exit(&self) -> ! {
        unwind_task()
    }

    /// Blocks on `queue` with a relative timeout. `data` is carried in the
    /// wait-queue entry and handed back (possibly rewritten by the waker) in
    /// the outcome.
    pub fn block_for(&self, queue: WaitQueue, timeout: impl Into<Timeout>, data: u64) -> WaitOutcome {
        self.block(Anchor::For(timeout.into()), Some(queue), data)
    }

    /// Blocks on `queue` for `ticks` past the task's previous deadline.
    pub fn block_next(&self, queue: WaitQueue, ticks: u32, data: u64) -> WaitOutcome {
        self.block(Anchor::Next(ticks), Some(queue), data)
    }

    /// Blocks on `queue` until the absolute tick `deadline`; an already-past
    /// deadline degrades to a non-blocking try.
    pub fn block_until(&self, queue: WaitQueue, deadline: Tick, data: u64) -> WaitOutcome {
        self.block(Anchor::Until(deadline), Some(queue), data)
    }

    /// Blocks until `timer` next fires.
    pub fn wait_timer(&self, timer: crate::timer::TimerId, timeout: impl Into<Timeout>) -> WakeCode {
        let queue = self.inner().timer_queue(timer);
        self.block(Anchor::For(timeout.into()), Some(queue), 0).code
    }

    /// Signal bits posted to this task and not yet consumed by a handler.
    pub fn pending_signals(&self) -> u32 {
        self.inner().pending_signals(self.id)
    }

    /// Consumes and returns the pending signal set. The non-blocking
    /// counterpart to a registered handler.
    pub fn take_signals(&self) -> u32 {
        self.inner().take_signals(self.id)
    }

    /// Suspension choreography. The kernel is upgraded only briefly on each
    /// side of the park, so a blocked task never keeps the kernel alive.
    fn block(&self, anchor: Anchor, queue: Option<WaitQueue>, data: u64) -> WaitOutcome {
        if let Some(out) = self.inner().block_prepare(self, anchor, queue, data) {
            return out;
        }
        self.park();
        self.inner().block_collect(self.id)
    }

    /// Hands control to the scheduler and waits for the next grant.
    fn park(&self) {
        self.board.sched.signal();
        self.gate.baton.wait();
        if self.gate.killed() {
            unwind_task();
        }
    }

    pub(crate) fn inner(&self) -> Arc<KernelInner> {
        self.kernel
            .upgrade()
            .expect("kernel dropped while one of its tasks was running")
    }

    pub(crate) fn kernel_weak(&self) -> &Weak<KernelInner> {
        &self.kernel
    }
}
