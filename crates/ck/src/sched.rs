//! The circular run-list and the one-pass scheduling algorithm.
//!
//! Tasks and timers share a single circular list of arena nodes; the main
//! sentinel node is always linked, so the list is never empty and a full
//! revolution is observable (the pass reaches the sentinel). One pass
//! advances the cursor exactly one link and keeps walking until it finds
//! something to do: a staged signal delivery, a due timer, a due or ready
//! task, or the sentinel with nothing runnable (idle).

use crate::kernel::KernelState;
use crate::task::{TaskCb, TaskId, TaskState};
use crate::timer::{TimerCb, TimerId};
use crate::wait::WakeCode;

pub(crate) type NodeIndex = u32;

/// Arena index of the main sentinel.
pub(crate) const MAIN_NODE: NodeIndex = 0;

/// One run-list node. `prev`/`next` are only meaningful while `linked`.
pub(crate) struct Node {
    pub(crate) prev: NodeIndex,
    pub(crate) next: NodeIndex,
    pub(crate) linked: bool,
    pub(crate) body: NodeBody,
}

/// Tagged node body: the sentinel, a task, or a software timer.
pub(crate) enum NodeBody {
    Main,
    Task(TaskCb),
    Timer(TimerCb),
}

/// What one scheduling pass decided.
pub(crate) enum Pass {
    /// Resume this task's continuation.
    Run(TaskId),
    /// Fire this timer inline and take another pass.
    FireTimer(TimerId),
    /// Run this task's staged signal delivery and take another pass.
    Deliver(TaskId),
    /// Nothing runnable this revolution.
    Idle,
    /// Shutdown requested or no live task remains.
    Halt,
}

enum Visit {
    Skip,
    Idle,
    Halt,
    Run(TaskId),
    TimeoutRun(TaskId),
    Fire(TimerId),
    Deliver(TaskId),
}

impl KernelState {
    pub(crate) fn push_node(&mut self, body: NodeBody) -> NodeIndex {
        let idx = self.nodes.len() as NodeIndex;
        self.nodes.push(Node {
            prev: idx,
            next: idx,
            linked: false,
            body,
        });
        idx
    }

    /// Links a node at the tail of the circular list (just before the main
    /// sentinel), preserving activation order for the round-robin walk.
    pub(crate) fn link_node(&mut self, idx: NodeIndex) {
        debug_assert!(!self.nodes[idx as usize].linked, "node already linked");
        let tail = self.nodes[MAIN_NODE as usize].prev;
        self.nodes[idx as usize].prev = tail;
        self.nodes[idx as usize].next = MAIN_NODE;
        self.nodes[tail as usize].next = idx;
        self.nodes[MAIN_NODE as usize].prev = idx;
        self.nodes[idx as usize].linked = true;
    }

    pub(crate) fn unlink_node(&mut self, idx: NodeIndex) {
        if !self.nodes[idx as usize].linked {
            return;
        }
        // Keep the cursor on a linked node: step it back so the next advance
        // lands where the removed node's successor was.
        if self.cursor == idx {
            self.cursor = self.nodes[idx as usize].prev;
        }
        let (prev, next) = {
            let n = &self.nodes[idx as usize];
            (n.prev, n.next)
        };
        self.nodes[prev as usize].next = next;
        self.nodes[next as usize].prev = prev;
        self.nodes[idx as usize].linked = false;
    }

    fn advance_cursor(&mut self) -> NodeIndex {
        self.cursor = self.nodes[self.cursor as usize].next;
        self.cursor
    }

    pub(crate) fn task(&self, id: TaskId) -> &TaskCb {
        match &self.nodes[id.0 as usize].body {
            NodeBody::Task(t) => t,
            _ => panic!("node {} is not a task", id.0),
        }
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> &mut TaskCb {
        match &mut self.nodes[id.0 as usize].body {
            NodeBody::Task(t) => t,
            _ => panic!("node {} is not a task", id.0),
        }
    }

    pub(crate) fn try_task(&self, id: TaskId) -> Option<&TaskCb> {
        match self.nodes.get(id.0 as usize).map(|n| &n.body) {
            Some(NodeBody::Task(t)) => Some(t),
            _ => None,
        }
    }

    pub(crate) fn try_task_mut(&mut self, id: TaskId) -> Option<&mut TaskCb> {
        match self.nodes.get_mut(id.0 as usize).map(|n| &mut n.body) {
            Some(NodeBody::Task(t)) => Some(t),
            _ => None,
        }
    }

    pub(crate) fn timer(&self, id: TimerId) -> &TimerCb {
        match &self.nodes[id.0 as usize].body {
            NodeBody::Timer(t) => t,
            _ => panic!("node {} is not a timer", id.0),
        }
    }

    pub(crate) fn timer_mut(&mut self, id: TimerId) -> &mut TimerCb {
        match &mut self.nodes[id.0 as usize].body {
            NodeBody::Timer(t) => t,
            _ => panic!("node {} is not a timer", id.0),
        }
    }

    pub(crate) fn try_timer_mut(&mut self, id: TimerId) -> Option<&mut TimerCb> {
        match self.nodes.get_mut(id.0 as usize).map(|n| &mut n.body) {
            Some(NodeBody::Timer(t)) => Some(t),
            _ => None,
        }
    }

    /// True when some linked node could be acted on right now: a ready task,
    /// a staged delivery, or a matured deadline. Used at the sentinel to
    /// decide between skipping it and declaring the revolution idle.
    pub(crate) fn has_immediate_work(&self) -> bool {
        let now = self.tick;
        self.nodes.iter().any(|n| {
            if !n.linked {
                return false;
            }
            match &n.body {
                NodeBody::Main => false,
                NodeBody::Timer(t) => t.deadline.is_some_and(|d| d.is_due(now)),
                NodeBody::Task(t) => match t.state {
                    TaskState::Stopped => false,
                    TaskState::Ready => true,
                    TaskState::TimedWait => {
                        t.signals.is_staged() || t.deadline.is_some_and(|d| d.is_due(now))
                    }
                },
            }
        })
    }
}

/// One scheduling pass: advance the cursor one link and walk until a
/// decision falls out. Always terminates within one revolution because the
/// main sentinel resolves to `Idle` or `Halt` when nothing else does.
pub(crate) fn schedule_pass(state: &mut KernelState) -> Pass {
    loop {
        let idx = state.advance_cursor();
        let now = state.tick;
        let visit = {
            match &state.nodes[idx as usize].body {
                NodeBody::Main => {
                    if state.shutdown || state.live_tasks == 0 {
                        Visit::Halt
                    } else if state.has_immediate_work() {
                        Visit::Skip
                    } else {
                        Visit::Idle
                    }
                }
                NodeBody::Timer(t) => match t.deadline {
                    Some(d) if d.is_due(now) => Visit::Fire(TimerId(idx)),
                    _ => Visit::Skip,
                },
                NodeBody::Task(t) => match t.state {
                    // Safety net: removal unlinks eagerly, but a stopped node
                    // the cursor still reaches is skipped, never scheduled.
                    TaskState::Stopped => Visit::Skip,
                    _ if t.signals.is_staged() => Visit::Deliver(TaskId(idx)),
                    TaskState::Ready => Visit::Run(TaskId(idx)),
                    TaskState::TimedWait => match t.deadline {
                        Some(d) if d.is_due(now) => Visit::TimeoutRun(TaskId(idx)),
                        _ => Visit::Skip,
                    },
                },
            }
        };
        match visit {
            Visit::Skip => continue,
            Visit::Idle => return Pass::Idle,
            Visit::Halt => return Pass::Halt,
            Visit::Run(id) => return Pass::Run(id),
            Visit::TimeoutRun(id) => {
                // Nobody woke the task before its deadline matured: the
                // scheduler itself delivers the timeout and runs the task.
                state.wake_task(id, WakeCode::Timeout);
                return Pass::Run(id);
            }
            Visit::Fire(id) => return Pass::FireTimer(id),
            Visit::Deliver(id) => return Pass::Deliver(id),
        }
    }
}
