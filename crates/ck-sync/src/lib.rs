//! # ck-sync
//!
//! Blocking synchronization primitives for the `ck` cooperative kernel:
//! mutex, counting/binary semaphore, flag group and condition variable.
//! Every primitive is a thin policy over the kernel's wait-queue protocol
//! and exposes the same three-operation shape: a non-blocking `try_take`,
//! a blocking `wait_for`/`wait_until` with the shared timeout policy, and a
//! non-blocking `give`.
//!
//! Primitives are caller-allocated, cheap to clone (the clones share state)
//! and hold the kernel weakly, so capturing one inside a task closure or a
//! handler cannot keep the kernel alive. `reset` drains a primitive's wait
//! queue, waking every blocked task with [`SyncError::Stopped`], without
//! invalidating the primitive itself.

use thiserror::Error;

mod condvar;
mod flags;
mod mutex;
mod semaphore;

pub use condvar::CondVar;
pub use flags::{FlagBits, FlagGroup, FlagRequest};
pub use mutex::Mutex;
pub use semaphore::Semaphore;

/// Error taxonomy shared by all primitives.
///
/// Blocking operations report `Timeout` and `Stopped`; everything else is an
/// operation-specific precondition failure that never changes primitive
/// state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// The deadline passed before the condition held.
    #[error("operation timed out")]
    Timeout,
    /// The primitive was reset while the task waited on it.
    #[error("primitive was reset while waiting")]
    Stopped,
    /// A non-blocking try found the resource unavailable.
    #[error("resource is not available")]
    WouldBlock,
    /// The calling task already owns the mutex (no recursive acquisition).
    #[error("mutex is already held by the calling task")]
    AlreadyOwned,
    /// The calling task does not own the mutex.
    #[error("caller does not own the mutex")]
    NotOwner,
    /// A semaphore give would exceed the configured limit.
    #[error("count is at its limit")]
    Overflow,
    /// Malformed request (for example an empty flag mask).
    #[error("malformed request")]
    InvalidOperation,
    /// The kernel behind this primitive no longer exists.
    #[error("kernel no longer exists")]
    Defunct,
}

pub type SyncResult<T> = Result<T, SyncError>;

pub(crate) fn upgrade(weak: &ck::KernelWeak) -> SyncResult<ck::Kernel> {
    weak.upgrade().ok_or(SyncError::Defunct)
}

/// Maps a wake code delivered through the wait-queue protocol onto the error
/// taxonomy.
pub(crate) fn code_err(code: ck::WakeCode) -> SyncError {
    match code {
        ck::WakeCode::Success => unreachable!("success is not an error"),
        ck::WakeCode::Timeout => SyncError::Timeout,
        ck::WakeCode::Stopped => SyncError::Stopped,
    }
}
