//! Counting semaphore.

use ck::{Kernel, KernelWeak, TaskContext, Tick, Timeout, WaitQueue, WakeCode};
use parking_lot::Mutex as Lock;
use std::sync::Arc;

use crate::{code_err, upgrade, SyncError, SyncResult};

struct Inner {
    count: u32,
    limit: u32,
}

/// Counting semaphore with an upper limit and FIFO-fair blocking.
///
/// `give` with waiters present transfers the unit directly to the queue
/// head, so the count can never be observed above the limit or below zero
/// and a later `try_take` cannot steal a unit from an earlier waiter.
///
/// # Example
///
/// ```no_run
/// use ck::{Kernel, TaskConfig};
/// use ck_sync::Semaphore;
///
/// let kernel = Kernel::builder().build().unwrap();
/// let items = Semaphore::new(&kernel, 0, 8);
/// let taker = items.clone();
/// kernel.spawn(TaskConfig::new("consumer", move |ctx| {
///     taker.wait_for(ctx, 100u32).unwrap();
///     // consume one item
/// })).unwrap();
/// ```
#[derive(Clone)]
pub struct Semaphore {
    kernel: KernelWeak,
    queue: WaitQueue,
    inner: Arc<Lock<Inner>>,
}

impl Semaphore {
    /// Creates a semaphore with an initial count and an upper limit.
    pub fn new(kernel: &Kernel, initial: u32, limit: u32) -> Self {
        debug_assert!(initial <= limit, "initial count exceeds the limit");
        Self {
            kernel: kernel.downgrade(),
            queue: kernel.new_wait_queue(),
            inner: Arc::new(Lock::new(Inner {
                count: initial,
                limit,
            })),
        }
    }

    /// Creates a binary semaphore (limit 1, initially empty).
    pub fn binary(kernel: &Kernel) -> Self {
        Self::new(kernel, 0, 1)
    }

    /// Non-blocking take: decrements the count if it is positive.
    pub fn try_take(&self) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        if inner.count > 0 {
            inner.count -= 1;
            Ok(())
        } else {
            Err(SyncError::WouldBlock)
        }
    }

    /// Takes a unit, blocking for at most `timeout` ticks.
    pub fn wait_for(&self, ctx: &TaskContext, timeout: impl Into<Timeout>) -> SyncResult<()> {
        let timeout = timeout.into();
        match self.try_take() {
            Ok(()) => return Ok(()),
            Err(SyncError::WouldBlock) => {}
            Err(e) => return Err(e),
        }
        if timeout == Timeout::Immediate {
            return Err(SyncError::Timeout);
        }
        let out = ctx.block_for(self.queue, timeout, 0);
        match out.code {
            WakeCode::Success => Ok(()),
            code => Err(code_err(code)),
        }
    }

    /// Takes a unit, blocking until the absolute tick `deadline`.
    pub fn wait_until(&self, ctx: &TaskContext, deadline: Tick) -> SyncResult<()> {
        match self.try_take() {
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

    /// Releases one unit: hands it to the first waiter, or increments the
    /// count. Fails with `Overflow` at the limit.
    pub fn give(&self) -> SyncResult<()> {
        let kernel = upgrade(&self.kernel)?;
        let mut inner = self.inner.lock();
        if kernel.wake_one(self.queue, WakeCode::Success).is_some() {
            return Ok(());
        }
        if inner.count >= inner.limit {
            return Err(SyncError::Overflow);
        }
        inner.count += 1;
        Ok(())
    }

    /// Current count.
    pub fn count(&self) -> u32 {
        self.inner.lock().count
    }

    /// Configured upper limit.
    pub fn limit(&self) -> u32 {
        self.inner.lock().limit
    }

    /// Drains the wait queue, waking every blocked task with `Stopped`. The
    /// count is left as is and the semaphore stays usable.
    pub fn reset(&self) -> SyncResult<usize> {
        let kernel = upgrade(&self.kernel)?;
        let drained = kernel.reset_queue(self.queue);
        if drained > 0 {
            log::debug!("semaphore reset, {drained} waiter(s) stopped");
        }
        Ok(drained)
    }
}
