//! White-box tests for the run-list arena, the wait-queue links and the
//! one-pass selection algorithm. These drive `KernelState` directly; the
//! full engine is exercised by the integration tests.

use crate::kernel::KernelState;
use crate::sched::{schedule_pass, NodeBody, Pass};
use crate::task::{TaskCb, TaskConfig, TaskId, TaskState};
use crate::time::Deadline;
use crate::timer::{TimerCb, TimerConfig, TimerId};
use crate::wait::WakeCode;

fn ready_task(state: &mut KernelState, name: &'static str) -> TaskId {
    let config = TaskConfig::new(name, |_ctx| {});
    let idx = state.push_node(NodeBody::Task(TaskCb::new(config)));
    let id = TaskId(idx);
    state.task_mut(id).state = TaskState::Ready;
    state.link_node(idx);
    state.live_tasks += 1;
    id
}

fn idle_timer(state: &mut KernelState, name: &'static str) -> TimerId {
    let config = TimerConfig::new(name, || {});
    let queue = state.new_queue();
    let idx = state.push_node(NodeBody::Timer(TimerCb {
        name: config.name,
        callback: config.callback,
        deadline: None,
        period: None,
        queue,
    }));
    state.link_node(idx);
    TimerId(idx)
}

#[test]
fn pass_rotates_through_ready_tasks_in_activation_order() {
    let mut state = KernelState::new();
    let a = ready_task(&mut state, "a");
    let b = ready_task(&mut state, "b");
    let c = ready_task(&mut state, "c");

    for expected in [a, b, c, a, b] {
        match schedule_pass(&mut state) {
            Pass::Run(id) => assert_eq!(id, expected),
            _ => panic!("expected a task to be scheduled"),
        }
    }
}

#[test]
fn pass_skips_waiting_tasks_and_idles() {
    let mut state = KernelState::new();
    let a = ready_task(&mut state, "a");
    state.task_mut(a).state = TaskState::TimedWait;
    state.task_mut(a).deadline = None; // blocked forever

    assert!(matches!(schedule_pass(&mut state), Pass::Idle));
}

#[test]
fn pass_halts_once_no_live_task_remains() {
    let mut state = KernelState::new();
    assert!(matches!(schedule_pass(&mut state), Pass::Halt));
}

#[test]
fn matured_deadline_becomes_a_synthesized_timeout() {
    let mut state = KernelState::new();
    let a = ready_task(&mut state, "a");
    let q = state.new_queue();
    state.task_mut(a).state = TaskState::TimedWait;
    state.task_mut(a).deadline = Some(Deadline::new(0, 3));
    state.append_waiter(q, a);

    state.tick = 2;
    assert!(matches!(schedule_pass(&mut state), Pass::Idle));

    state.tick = 3;
    match schedule_pass(&mut state) {
        Pass::Run(id) => assert_eq!(id, a),
        _ => panic!("expected the timed-out task to run"),
    }
    let t = state.task(a);
    assert_eq!(t.state, TaskState::Ready);
    assert_eq!(t.wake_code, WakeCode::Timeout);
    assert!(t.guard.is_none(), "timeout must unlink the waiter");
}

#[test]
fn due_timer_wins_over_idle() {
    let mut state = KernelState::new();
    let a = ready_task(&mut state, "a");
    state.task_mut(a).state = TaskState::TimedWait; // keep a live task around
    let timer = idle_timer(&mut state, "t");
    state.timer_mut(timer).deadline = Some(Deadline::new(0, 2));

    state.tick = 1;
    assert!(matches!(schedule_pass(&mut state), Pass::Idle));
    state.tick = 2;
    assert!(matches!(schedule_pass(&mut state), Pass::FireTimer(id) if id == timer));
}

#[test]
fn unlink_moves_the_cursor_off_the_removed_node() {
    let mut state = KernelState::new();
    let a = ready_task(&mut state, "a");
    let b = ready_task(&mut state, "b");

    // Park the cursor on `a`, then remove it.
    match schedule_pass(&mut state) {
        Pass::Run(id) => assert_eq!(id, a),
        _ => panic!(),
    }
    state.task_mut(a).state = TaskState::Stopped;
    state.unlink_node(a.0);
    state.live_tasks -= 1;

    match schedule_pass(&mut state) {
        Pass::Run(id) => assert_eq!(id, b),
        _ => panic!("expected the survivor to be scheduled"),
    }
}

#[test]
fn wait_queue_preserves_fifo_order() {
    let mut state = KernelState::new();
    let a = ready_task(&mut state, "a");
    let b = ready_task(&mut state, "b");
    let c = ready_task(&mut state, "c");
    let q = state.new_queue();
    for id in [a, b, c] {
        state.task_mut(id).state = TaskState::TimedWait;
        state.append_waiter(q, id);
    }

    assert_eq!(state.queue_members(q), vec![a, b, c]);
    assert_eq!(state.wake_one(q, WakeCode::Success), Some(a));
    assert_eq!(state.wake_one(q, WakeCode::Success), Some(b));
    assert_eq!(state.wake_one(q, WakeCode::Success), Some(c));
    assert_eq!(state.wake_one(q, WakeCode::Success), None);
}

#[test]
fn wake_specific_unlinks_a_middle_waiter() {
    let mut state = KernelState::new();
    let a = ready_task(&mut state, "a");
    let b = ready_task(&mut state, "b");
    let c = ready_task(&mut state, "c");
    let q = state.new_queue();
    for id in [a, b, c] {
        state.task_mut(id).state = TaskState::TimedWait;
        state.append_waiter(q, id);
    }

    assert!(state.wake_specific(q, b, WakeCode::Success));
    assert_eq!(state.queue_members(q), vec![a, c]);
    assert_eq!(state.task(b).guard, None);
    // Not in the queue any more: a second wake is a no-op.
    assert!(!state.wake_specific(q, b, WakeCode::Success));
}

#[test]
fn wake_filter_rewrites_payloads_and_wakes_matches() {
    let mut state = KernelState::new();
    let a = ready_task(&mut state, "a");
    let b = ready_task(&mut state, "b");
    let q = state.new_queue();
    for (id, data) in [(a, 1u64), (b, 2u64)] {
        state.task_mut(id).state = TaskState::TimedWait;
        state.task_mut(id).wait_data = data;
        state.append_waiter(q, id);
    }

    // Wake only the waiter carrying payload 2, doubling the other's payload.
    let woken = state.wake_filter(q, WakeCode::Success, &mut |data| {
        if *data == 2 {
            true
        } else {
            *data *= 2;
            false
        }
    });
    assert_eq!(woken, 1);
    assert_eq!(state.task(b).state, TaskState::Ready);
    assert_eq!(state.task(a).state, TaskState::TimedWait);
    assert_eq!(state.task(a).wait_data, 2, "payload rewrite must stick");
    assert_eq!(state.queue_members(q), vec![a]);
}

#[test]
fn reset_drains_every_waiter_with_stopped() {
    let mut state = KernelState::new();
    let a = ready_task(&mut state, "a");
    let b = ready_task(&mut state, "b");
    let q = state.new_queue();
    for id in [a, b] {
        state.task_mut(id).state = TaskState::TimedWait;
        state.append_waiter(q, id);
    }

    assert_eq!(state.wake_n(q, WakeCode::Stopped, usize::MAX), 2);
    for id in [a, b] {
        assert_eq!(state.task(id).wake_code, WakeCode::Stopped);
        assert_eq!(state.task(id).state, TaskState::Ready);
    }
    assert_eq!(state.queue_members(q), Vec::<TaskId>::new());
}
