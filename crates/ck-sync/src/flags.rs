//! Flag group: a pending bitmask tasks can wait on.
//!
//! A request names a mask of bits plus a mode: **any** (one counted bit
//! suffices; the matched bits are consumed and returned) or **all** (every
//! requested bit must be counted; the whole request is consumed). By default
//! bits already pending in the group count immediately, so a request can
//! succeed without blocking. A **fresh** request ignores them: only 0→1
//! edges that happen after the request is registered count, so a bit that
//! stays set must be cleared and set again to satisfy a fresh waiter.
//!
//! Consumption for blocked waiters is incremental: each `give` matches
//! arriving bits against the waiters' remaining requirements in FIFO order
//! and consumes what it delivers, an all-mode waiter banking partial
//! progress in its wait-queue entry until the remainder reaches zero.

use ck::{Kernel, KernelWeak, TaskContext, Tick, Timeout, WaitQueue, WakeCode};
use parking_lot::Mutex as Lock;
use std::sync::Arc;

use crate::{code_err, upgrade, SyncError, SyncResult};

/// Flag mask type.
pub type FlagBits = u32;

const BITS_MASK: u64 = FlagBits::MAX as u64;
const MODE_ALL: u64 = 1 << 32;
const MODE_FRESH: u64 = 1 << 33;

fn pack(remaining: FlagBits, all: bool, fresh: bool) -> u64 {
    let mut data = remaining as u64;
    if all {
        data |= MODE_ALL;
    }
    if fresh {
        data |= MODE_FRESH;
    }
    data
}

fn unpack(data: u64) -> (FlagBits, bool, bool) {
    (
        (data & BITS_MASK) as FlagBits,
        data & MODE_ALL != 0,
        data & MODE_FRESH != 0,
    )
}

/// One wait request: a mask and its satisfaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagRequest {
    pub(crate) bits: FlagBits,
    pub(crate) all: bool,
    pub(crate) fresh: bool,
}

impl FlagRequest {
    /// Satisfied once at least one requested bit is counted.
    pub fn any(bits: FlagBits) -> Self {
        Self {
            bits,
            all: false,
            fresh: false,
        }
    }

    /// Satisfied only when every requested bit has been counted.
    pub fn all(bits: FlagBits) -> Self {
        Self {
            bits,
            all: true,
            fresh: false,
        }
    }

    /// Ignore bits already pending at registration; only bits set afterwards
    /// count.
    pub fn fresh(mut self) -> Self {
        self.fresh = true;
        self
    }
}

struct Inner {
    pending: FlagBits,
}

/// Group of event flags with any/all and fresh-only wait modes.
#[derive(Clone)]
pub struct FlagGroup {
    kernel: KernelWeak,
    queue: WaitQueue,
    inner: Arc<Lock<Inner>>,
}

impl FlagGroup {
    pub fn new(kernel: &Kernel) -> Self {
        Self {
            kernel: kernel.downgrade(),
            queue: kernel.new_wait_queue(),
            inner: Arc::new(Lock::new(Inner { pending: 0 })),
        }
    }

    /// Non-blocking claim against the current pending mask. Returns `None`
    /// if not satisfied; a failed claim consumes nothing.
    fn try_claim(inner: &mut Inner, req: FlagRequest) -> Option<FlagBits> {
        let counted = if req.fresh {
            0
        } else {
            inner.pending & req.bits
        };
        if req.all {
            if counted == req.bits {
                inner.pending &= !req.bits;
                Some(req.bits)
            } else {
                None
            }
        } else if counted != 0 {
            inner.pending &= !counted;
            Some(counted)
        } else {
            None
        }
    }

    /// Non-blocking wait: succeeds only if the request is satisfiable right
    /// now.
    pub fn try_take(&self, req: FlagRequest) -> SyncResult<FlagBits> {
        if req.bits == 0 {
            return Err(SyncError::InvalidOperation);
        }
        let mut inner = self.inner.lock();
        Self::try_claim(&mut inner, req).ok_or(SyncError::WouldBlock)
    }

    /// Waits for the request with a relative timeout. Returns the matched
    /// bits: the whole request in all mode, the consumed subset in any mode.
    pub fn wait_for(
        &self,
        ctx: &TaskContext,
        req: FlagRequest,
        timeout: impl Into<Timeout>,
    ) -> SyncResult<FlagBits> {
        let timeout = timeout.into();
        let payload = match self.register(req, timeout == Timeout::Immediate)? {
            Ok(matched) => return Ok(matched),
            Err(payload) => payload,
        };
        let out = ctx.block_for(self.queue, timeout, payload);
        self.conclude(req, out)
    }

    /// Waits for the request until the absolute tick `deadline`.
    pub fn wait_until(
        &self,
        ctx: &TaskContext,
        req: FlagRequest,
        deadline: Tick,
    ) -> SyncResult<FlagBits> {
        let already_past = ck::time::ticks_until(ctx.now(), deadline) == 0;
        let payload = match self.register(req, already_past)? {
            Ok(matched) => return Ok(matched),
            Err(payload) => payload,
        };
        let out = ctx.block_until(self.queue, deadline, payload);
        self.conclude(req, out)
    }

    /// First half of a wait: try to claim, and if that fails (and blocking
    /// is allowed) bank the partial progress of an all-mode request and
    /// build the wait-queue payload.
    fn register(
        &self,
        req: FlagRequest,
        try_only: bool,
    ) -> SyncResult<Result<FlagBits, u64>> {
        if req.bits == 0 {
            return Err(SyncError::InvalidOperation);
        }
        let mut inner = self.inner.lock();
        if let Some(matched) = Self::try_claim(&mut inner, req) {
            return Ok(Ok(matched));
        }
        if try_only {
            return Err(SyncError::Timeout);
        }
        let payload = if req.all && !req.fresh {
            let banked = inner.pending & req.bits;
            inner.pending &= !banked;
            pack(req.bits & !banked, true, false)
        } else {
            pack(req.bits, req.all, req.fresh)
        };
        Ok(Err(payload))
    }

    fn conclude(&self, req: FlagRequest, out: ck::WaitOutcome) -> SyncResult<FlagBits> {
        match out.code {
            WakeCode::Success => {
                if req.all {
                    Ok(req.bits)
                } else {
                    Ok((out.data & BITS_MASK) as FlagBits)
                }
            }
            code => Err(code_err(code)),
        }
    }

    /// Sets bits in the group and scans the wait queue in FIFO order, waking
    /// every waiter whose request becomes satisfied. Returns the number of
    /// tasks woken.
    pub fn give(&self, bits: FlagBits) -> SyncResult<usize> {
        if bits == 0 {
            return Err(SyncError::InvalidOperation);
        }
        let kernel = upgrade(&self.kernel)?;
        let mut inner = self.inner.lock();
        // Bits making a 0->1 edge right now; only these count for fresh
        // waiters, no matter how often an already-set bit is re-given.
        let mut fresh_avail = bits & !inner.pending;
        inner.pending |= bits;
        let pending = &mut inner.pending;
        let woken = kernel.wake_filter(self.queue, WakeCode::Success, |data| {
            let (remaining, all, fresh_only) = unpack(*data);
            let pool = if fresh_only { fresh_avail } else { *pending };
            let matched = pool & remaining;
            if matched == 0 {
                return false;
            }
            *pending &= !matched;
            fresh_avail &= !matched;
            if all {
                let rest = remaining & !matched;
                if rest == 0 {
                    true
                } else {
                    *data = pack(rest, true, fresh_only);
                    false
                }
            } else {
                *data = matched as u64;
                true
            }
        });
        Ok(woken)
    }

    /// Clears bits without waking anyone. Required to re-arm a fresh-mode
    /// wait on a bit that stayed set.
    pub fn clear(&self, bits: FlagBits) {
        self.inner.lock().pending &= !bits;
    }

    /// Bits currently pending in the group.
    pub fn pending(&self) -> FlagBits {
        self.inner.lock().pending
    }

    /// Drains the wait queue, waking every blocked task with `Stopped`. The
    /// pending mask is left as is.
    pub fn reset(&self) -> SyncResult<usize> {
        let kernel = upgrade(&self.kernel)?;
        let drained = kernel.reset_queue(self.queue);
        if drained > 0 {
            log::debug!("flag group reset, {drained} waiter(s) stopped");
        }
        Ok(drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck::Kernel;

    #[test]
    fn any_consumes_only_matched_bits() {
        let kernel = Kernel::builder().build().unwrap();
        let flags = FlagGroup::new(&kernel);
        flags.give(0b0111).unwrap();

        assert_eq!(flags.try_take(FlagRequest::any(0b0101)), Ok(0b0101));
        assert_eq!(flags.pending(), 0b0010);
    }

    #[test]
    fn all_requires_every_bit_simultaneously() {
        let kernel = Kernel::builder().build().unwrap();
        let flags = FlagGroup::new(&kernel);
        flags.give(0b001).unwrap();

        assert_eq!(
            flags.try_take(FlagRequest::all(0b011)),
            Err(SyncError::WouldBlock)
        );
        // A failed try consumes nothing.
        assert_eq!(flags.pending(), 0b001);

        flags.give(0b010).unwrap();
        assert_eq!(flags.try_take(FlagRequest::all(0b011)), Ok(0b011));
        assert_eq!(flags.pending(), 0);
    }

    #[test]
    fn fresh_requests_ignore_already_pending_bits() {
        let kernel = Kernel::builder().build().unwrap();
        let flags = FlagGroup::new(&kernel);
        flags.give(0b1).unwrap();

        assert_eq!(
            flags.try_take(FlagRequest::any(0b1).fresh()),
            Err(SyncError::WouldBlock)
        );
        // The stale bit is still there for a default-mode request.
        assert_eq!(flags.try_take(FlagRequest::any(0b1)), Ok(0b1));
    }

    #[test]
    fn empty_masks_are_rejected() {
        let kernel = Kernel::builder().build().unwrap();
        let flags = FlagGroup::new(&kernel);
        assert_eq!(
            flags.try_take(FlagRequest::any(0)),
            Err(SyncError::InvalidOperation)
        );
        assert_eq!(flags.give(0), Err(SyncError::InvalidOperation));
    }

    #[test]
    fn clear_removes_bits_silently() {
        let kernel = Kernel::builder().build().unwrap();
        let flags = FlagGroup::new(&kernel);
        flags.give(0b110).unwrap();
        flags.clear(0b100);
        assert_eq!(flags.pending(), 0b010);
    }
}
