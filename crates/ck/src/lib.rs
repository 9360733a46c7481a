//! # ck
//!
//! A cooperative real-time kernel for a single address space: one circular
//! run-list interleaves user tasks and software timers, tasks block and
//! resume through a uniform wait-queue protocol, and a signal-injection
//! mechanism lets one task interrupt another's sleep without hardware
//! preemption. The hosted continuation provider backs each task with a
//! parked OS thread, so exactly one logical thread of control ever executes
//! kernel or task code.
//!
//! ## Module Overview
//! - [`time`]         – Tick arithmetic, due-ness test, timeout policies.
//! - [`continuation`] – Saved-execution-point seam and the hosted provider.
//! - [`task`]         – Task lifecycle, configuration, in-task API surface.
//! - [`timer`]        – Software timers sharing the run-list with tasks.
//! - [`wait`]         – The generic FIFO blocking/wakeup protocol.
//! - [`signal`]       – Asynchronous cross-task signal delivery.
//! - [`kernel`]       – The owning kernel facade and scheduler loop.
//!
//! Synchronization primitives (mutex, semaphore, flag group, condition
//! variable) live in the companion `ck-sync` crate and consume only the
//! wait-queue protocol exposed here.

pub mod continuation;
pub mod kernel;
mod sched;
pub mod signal;
mod sync;
pub mod task;
pub mod time;
pub mod timer;
pub mod wait;

pub use continuation::Continuation;
pub use kernel::{Kernel, KernelBuilder, KernelConfig, KernelConfigBuilder, KernelError, KernelWeak};
pub use task::{OnReturn, TaskConfig, TaskContext, TaskId, TaskState};
pub use time::{Deadline, Tick, Timeout};
pub use timer::{TimerConfig, TimerId};
pub use wait::{WaitOutcome, WaitQueue, WakeCode};

#[cfg(test)]
mod tests;
