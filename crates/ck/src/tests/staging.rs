//! White-box tests for the signal-delivery state machine. Posting and
//! staging are observable without driving the scheduler loop; end-to-end
//! delivery ordering lives in the integration tests.

use crate::kernel::{Kernel, KernelError};
use crate::signal::Delivery;
use crate::task::{TaskConfig, TaskState};
use crate::time::Deadline;

#[test]
fn post_without_handler_pends_the_bit() {
    let kernel = Kernel::builder().build().unwrap();
    let id = kernel
        .spawn(TaskConfig::new("plain", |_ctx| {}))
        .unwrap();

    kernel.post_signal(id, 3).unwrap();
    kernel.post_signal(id, 3).unwrap();
    kernel.post_signal(id, 7).unwrap();

    let state = kernel.inner.state.lock();
    let t = state.task(id);
    assert_eq!(t.signals.pending, (1 << 3) | (1 << 7));
    assert!(matches!(t.signals.delivery, Delivery::Idle));
}

#[test]
fn post_with_handler_stages_delivery_and_parks_the_deadline() {
    let kernel = Kernel::builder().build().unwrap();
    let id = kernel
        .spawn(TaskConfig::new("handled", |_ctx| {}).with_signal_handler(|_num| {}))
        .unwrap();

    // Simulate a sleeping task.
    {
        let mut state = kernel.inner.state.lock();
        let t = state.task_mut(id);
        t.state = TaskState::TimedWait;
        t.deadline = Some(Deadline::new(0, 10));
    }

    kernel.post_signal(id, 5).unwrap();

    {
        let state = kernel.inner.state.lock();
        let t = state.task(id);
        assert_eq!(t.signals.pending, 1 << 5);
        assert!(t.deadline.is_none(), "staging must park the deadline");
        match t.signals.delivery {
            Delivery::Staged { saved } => assert_eq!(saved, Some(Deadline::new(0, 10))),
            _ => panic!("delivery should be staged"),
        }
    }

    // A second post must not re-stage (the saved deadline stays intact).
    kernel.post_signal(id, 1).unwrap();
    let state = kernel.inner.state.lock();
    let t = state.task(id);
    assert_eq!(t.signals.pending, (1 << 5) | (1 << 1));
    match t.signals.delivery {
        Delivery::Staged { saved } => assert_eq!(saved, Some(Deadline::new(0, 10))),
        _ => panic!("delivery should still be staged"),
    }
}

#[test]
fn post_rejects_bad_arguments() {
    let kernel = Kernel::builder().build().unwrap();
    let id = kernel
        .spawn(TaskConfig::new("target", |_ctx| {}))
        .unwrap();

    assert!(matches!(
        kernel.post_signal(id, 32),
        Err(KernelError::InvalidSignal(32))
    ));

    let inactive = kernel.create_task(TaskConfig::new("inactive", |_ctx| {}));
    assert!(matches!(
        kernel.post_signal(inactive, 0),
        Err(KernelError::TaskStopped(_))
    ));
}

#[test]
fn stopping_a_task_clears_any_staged_delivery() {
    let kernel = Kernel::builder().build().unwrap();
    let id = kernel
        .spawn(TaskConfig::new("victim", |_ctx| {}).with_signal_handler(|_num| {}))
        .unwrap();

    {
        let mut state = kernel.inner.state.lock();
        let t = state.task_mut(id);
        t.state = TaskState::TimedWait;
    }
    kernel.post_signal(id, 0).unwrap();
    kernel.stop(id).unwrap();

    let state = kernel.inner.state.lock();
    let t = state.task(id);
    assert_eq!(t.state, TaskState::Stopped);
    assert!(matches!(t.signals.delivery, Delivery::Idle));
    assert!(!state.nodes[id.0 as usize].linked);
}
