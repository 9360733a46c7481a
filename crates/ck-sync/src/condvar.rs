//! Condition variable.

use ck::{Kernel, KernelWeak, TaskContext, Timeout, WaitQueue, WakeCode};

use crate::{code_err, upgrade, Mutex, SyncError, SyncResult};

/// Condition variable: release a mutex, block, re-acquire on wakeup.
///
/// There is no state beyond the wait queue. The release and the enqueue are
/// atomic with respect to other tasks (nothing else runs between them in the
/// cooperative model), so a notification sent after `wait` began cannot be
/// missed. If the caller does not own the mutex the wait fails with
/// [`SyncError::NotOwner`] without ever blocking.
#[derive(Clone)]
pub struct CondVar {
    kernel: KernelWeak,
    queue: WaitQueue,
}

impl CondVar {
    pub fn new(kernel: &Kernel) -> Self {
        Self {
            kernel: kernel.downgrade(),
            queue: kernel.new_wait_queue(),
        }
    }

    /// Releases `mutex`, blocks until notified or the timeout matures, then
    /// re-acquires `mutex` before returning. On `Timeout` or `Stopped` the
    /// mutex has still been re-acquired.
    pub fn wait(
        &self,
        ctx: &TaskContext,
        mutex: &Mutex,
        timeout: impl Into<Timeout>,
    ) -> SyncResult<()> {
        mutex.give(ctx)?;
        let out = ctx.block_for(self.queue, timeout, 0);
        mutex.wait_for(ctx, Timeout::Forever)?;
        match out.code {
            WakeCode::Success => Ok(()),
            code => Err(code_err(code)),
        }
    }

    /// Wakes the first waiter. Returns whether anyone was waiting.
    pub fn notify_one(&self) -> SyncResult<bool> {
        let kernel = upgrade(&self.kernel)?;
        Ok(kernel
            .wake_one(self.queue, WakeCode::Success)
            .is_some())
    }

    /// Wakes every waiter in FIFO order; returns how many.
    pub fn notify_all(&self) -> SyncResult<usize> {
        let kernel = upgrade(&self.kernel)?;
        Ok(kernel.wake_all(self.queue, WakeCode::Success))
    }

    /// Drains the wait queue with `Stopped`.
    pub fn reset(&self) -> SyncResult<usize> {
        let kernel = upgrade(&self.kernel)?;
        let drained = kernel.reset_queue(self.queue);
        if drained > 0 {
            log::debug!("condvar reset, {drained} waiter(s) stopped");
        }
        Ok(drained)
    }
}
