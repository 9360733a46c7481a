//! Saved-execution-point abstraction and its hosted provider.
//!
//! A [`Continuation`] is an opaque point of execution the scheduler can hand
//! control to and get control back from. The portable kernel never inspects
//! it; it only needs `resume` (run until the task yields) and `terminate`
//! (reclaim whatever backs it).
//!
//! The hosted provider backs every activated task with a dedicated OS thread
//! that is parked except while it holds the single execution baton. The
//! scheduler thread and the task threads pass that baton back and forth, so
//! exactly one logical thread of control ever runs kernel or task code. A
//! task's configured stack size becomes the backing thread's stack size, and
//! the host's guard pages stand in for the original stack-sentinel scan.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crate::kernel::KernelInner;
use crate::sync::{Arc, Condvar, Mutex, Weak};
use crate::task::{EntryFn, OnReturn, TaskContext, TaskId};

/// One saved execution point, resumable by the scheduler.
///
/// Implementations must guarantee that `resume` returns only once the
/// continuation has yielded control back, and that `terminate` is idempotent
/// and releases any backing resources.
pub trait Continuation: Send + Sync {
    /// Transfers control to the continuation; returns when it yields.
    fn resume(&self);

    /// Tears the continuation down without resuming the code it suspended.
    fn terminate(&self);
}

/// A one-slot handshake: `signal` deposits the baton, `wait` consumes it.
pub(crate) struct Baton {
    flag: Mutex<bool>,
    cv: Condvar,
}

impl Baton {
    pub(crate) fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn signal(&self) {
        let mut granted = self.flag.lock();
        *granted = true;
        self.cv.notify_one();
    }

    pub(crate) fn wait(&self) {
        let mut granted = self.flag.lock();
        while !*granted {
            self.cv.wait(&mut granted);
        }
        *granted = false;
    }
}

/// Kernel-wide handshake endpoints.
///
/// `sched` is signalled by whichever task yields control back; `idle` lets an
/// externally paced kernel sleep until `tick()` or another state change.
pub(crate) struct Switchboard {
    pub(crate) sched: Baton,
    pub(crate) idle: Condvar,
}

impl Switchboard {
    pub(crate) fn new() -> Self {
        Self {
            sched: Baton::new(),
            idle: Condvar::new(),
        }
    }
}

/// Per-task grant gate. `kill` asks the parked thread to unwind instead of
/// returning into user code.
pub(crate) struct Gate {
    pub(crate) baton: Baton,
    pub(crate) kill: AtomicBool,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            baton: Baton::new(),
            kill: AtomicBool::new(false),
        }
    }

    pub(crate) fn killed(&self) -> bool {
        self.kill.load(Ordering::SeqCst)
    }
}

/// Panic payload used to unwind a task thread out of user code. Caught by the
/// trampoline, never observed by callers.
pub(crate) struct KillToken;

/// Unwinds the current task thread. Used by `TaskContext::exit` and by the
/// teardown path when a parked thread is terminated. `resume_unwind` skips
/// the panic hook: this is control flow, not a programmer error.
pub(crate) fn unwind_task() -> ! {
    panic::resume_unwind(Box::new(KillToken))
}

/// Hosted continuation: a parked OS thread plus its grant gate.
pub(crate) struct ThreadContinuation {
    gate: Arc<Gate>,
    board: Arc<Switchboard>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadContinuation {
    pub(crate) fn new(gate: Arc<Gate>, board: Arc<Switchboard>, join: JoinHandle<()>) -> Self {
        Self {
            gate,
            board,
            join: Mutex::new(Some(join)),
        }
    }
}

impl Continuation for ThreadContinuation {
    fn resume(&self) {
        self.gate.baton.signal();
        self.board.sched.wait();
    }

    fn terminate(&self) {
        self.gate.kill.store(true, Ordering::SeqCst);
        self.gate.baton.signal();
        if let Some(handle) = self.join.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Body of every task thread: park until the first grant, then run the entry
/// trampoline. The trampoline re-invokes the entry procedure according to the
/// task's on-return policy, so entry code never needs its own outer loop.
pub(crate) fn task_thread_main(
    kernel: Weak<KernelInner>,
    id: TaskId,
    gate: Arc<Gate>,
    board: Arc<Switchboard>,
    mut entry: EntryFn,
    on_return: OnReturn,
) {
    gate.baton.wait();
    if gate.killed() {
        return;
    }

    let ctx = TaskContext::new(kernel, id, Arc::clone(&gate), Arc::clone(&board));
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| loop {
        entry(&ctx);
        match on_return {
            OnReturn::Restart => continue,
            OnReturn::Stop => break,
        }
    }));

    match outcome {
        Ok(()) => {}
        Err(payload) => {
            if payload.downcast_ref::<KillToken>().is_some() {
                if gate.killed() {
                    // Teardown: the kernel is going away, leave quietly.
                    return;
                }
                // Voluntary exit; fall through to the stop path.
            } else {
                log::error!("task {:?} panicked, stopping it", id);
            }
        }
    }

    if let Some(inner) = ctx.kernel_weak().upgrade() {
        inner.finalize_task(id);
    }
    board.sched.signal();
}
