//! Mutual exclusion with ownership handoff.

use ck::{Kernel, KernelWeak, TaskContext, TaskId, Tick, Timeout, WaitQueue, WakeCode};
use parking_lot::Mutex as Lock;
use std::sync::Arc;

use crate::{code_err, upgrade, SyncError, SyncResult};

struct Inner {
    owner: Option<TaskId>,
}

/// Mutex owned by at most one task at a time.
///
/// Acquisition is not recursive: a second take by the owner fails with
/// [`SyncError::AlreadyOwned`], distinguishing "already mine" from "held by
/// someone else" ([`SyncError::WouldBlock`]). Releasing transfers ownership
/// directly to the first waiter, so the lock is never observably free while
/// tasks are queued and FIFO fairness holds.
#[derive(Clone)]
pub struct Mutex {
    kernel: KernelWeak,
    queue: WaitQueue,
    inner: Arc<Lock<Inner>>,
}

impl Mutex {
    pub fn new(kernel: &Kernel) -> Self {
        Self {
            kernel: kernel.downgrade(),
            queue: kernel.new_wait_queue(),
            inner: Arc::new(Lock::new(Inner { owner: None })),
        }
    }

    /// Non-blocking take.
    pub fn try_take(&self, ctx: &TaskContext) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        match inner.owner {
            None => {
                inner.owner = Some(ctx.id());
                Ok(())
            }
            Some(owner) if owner == ctx.id() => Err(SyncError::AlreadyOwned),
            Some(_) => Err(SyncError::WouldBlock),
        }
    }

    /// Takes the mutex, blocking for at most `timeout` ticks. On success the
    /// calling task owns the mutex, whether it was free or handed over.
    pub fn wait_for(&self, ctx: &TaskContext, timeout: impl Into<Timeout>) -> SyncResult<()> {
        let timeout = timeout.into();
        match self.try_take(ctx) {
            Ok(()) => return Ok(()),
            Err(SyncError::WouldBlock) => {}
            Err(e) => return Err(e),
        }
        if timeout == Timeout::Immediate {
            return Err(SyncError::Timeout);
        }
        let out = ctx.block_for(self.queue, timeout, 0);
        match out.code {
            WakeCode::Success => {
                debug_assert_eq!(self.owner(), Some(ctx.id()), "handoff must set ownership");
                Ok(())
            }
            code => Err(code_err(code)),
        }
    }

    /// Takes the mutex, blocking until the absolute tick `deadline`.
    pub fn wait_until(&self, ctx: &TaskContext, deadline: Tick) -> SyncResult<()> {
        match self.try_take(ctx) {
            Ok(()) => return Ok(()),
            Err(SyncError::WouldBlock) => {}
            Err(e) => return Err(e),
        }
        let out = ctx.block_until(self.queue, deadline, 0);
        match out.code {
            WakeCode::Success => Ok(()),
            code => Err(code_err(code)),
        }
    }

    /// Releases the mutex. Ownership passes to the first waiter if there is
    /// one; a release by a non-owner fails and changes nothing.
    pub fn give(&self, ctx: &TaskContext) -> SyncResult<()> {
        let kernel = upgrade(&self.kernel)?;
        let mut inner = self.inner.lock();
        if inner.owner != Some(ctx.id()) {
            return Err(SyncError::NotOwner);
        }
        inner.owner = kernel.wake_one(self.queue, WakeCode::Success);
        Ok(())
    }

    pub fn owner(&self) -> Option<TaskId> {
        self.inner.lock().owner
    }

    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }

    /// Clears ownership and drains the wait queue with `Stopped`; the mutex
    /// comes out fresh.
    pub fn reset(&self) -> SyncResult<usize> {
        let kernel = upgrade(&self.kernel)?;
        self.inner.lock().owner = None;
        let drained = kernel.reset_queue(self.queue);
        if drained > 0 {
            log::debug!("mutex reset, {drained} waiter(s) stopped");
        }
        Ok(drained)
    }
}
