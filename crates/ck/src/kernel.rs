//! The kernel facade: configuration, lifecycle API and the scheduler loop.
//!
//! A [`Kernel`] owns the whole scheduling state behind one lock (the global
//! critical section of the cooperative model) and is a cheap-clone handle, so
//! several independent kernels can coexist in one process. Tasks and timers
//! are created through the kernel, the run-list is driven by [`Kernel::run`],
//! and the blocking half of the API lives on [`crate::task::TaskContext`].
//!
//! Threading contract: kernel and task code form a single logical thread of
//! control. The "handler context" of this port is timer callbacks and signal
//! handlers, which run interleaved on the scheduler's stack and may use the
//! non-blocking API. From genuinely foreign threads only [`Kernel::tick`] and
//! [`Kernel::shutdown`] are meant to be called.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::continuation::{task_thread_main, Gate, Switchboard, ThreadContinuation};
use crate::sched::{schedule_pass, Node, NodeBody, NodeIndex, Pass, MAIN_NODE};
use crate::signal::Delivery;
use crate::sync::{Arc, Mutex, Weak};
use crate::task::{SignalHandlerFn, TaskCb, TaskConfig, TaskId, TaskState};
use crate::time::{Deadline, Tick};
use crate::timer::{TimerCb, TimerConfig, TimerId};
use crate::wait::{WaitQueue, WakeCode};

/// Kernel-wide configuration.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub name: &'static str,
    /// Advance the tick once per idle revolution (virtual time). With this
    /// off the kernel parks on idle until an external [`Kernel::tick`].
    pub auto_tick: bool,
    /// Invoked once per idle revolution, before time advances.
    pub idle_callback: Option<fn()>,
    /// Stack size for tasks that do not set their own.
    pub default_stack_size: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            name: "ck",
            auto_tick: true,
            idle_callback: None,
            default_stack_size: 64 * 1024,
        }
    }
}

impl KernelConfig {
    pub fn builder() -> KernelConfigBuilder {
        KernelConfigBuilder::default()
    }
}

/// Builder for ergonomic kernel configuration construction.
#[derive(Debug, Clone, Default)]
pub struct KernelConfigBuilder {
    config: KernelConfig,
}

impl KernelConfigBuilder {
    pub fn name(mut self, name: &'static str) -> Self {
        self.config.name = name;
        self
    }

    pub fn auto_tick(mut self, enabled: bool) -> Self {
        self.config.auto_tick = enabled;
        self
    }

    pub fn idle_callback(mut self, callback: fn()) -> Self {
        self.config.idle_callback = Some(callback);
        self
    }

    pub fn default_stack_size(mut self, bytes: usize) -> Self {
        self.config.default_stack_size = bytes;
        self
    }

    pub fn build(self) -> KernelConfig {
        self.config
    }
}

/// Kernel API errors.
#[derive(Debug)]
pub enum KernelError {
    /// `run` was called while the kernel was already running.
    AlreadyRunning,
    /// The handle does not name a task of this kernel.
    TaskNotFound(TaskId),
    /// The handle does not name a timer of this kernel.
    TimerNotFound(TimerId),
    /// The task cannot be activated (already activated, or its entry
    /// procedure was consumed by a failed activation).
    NotActivatable(TaskId),
    /// `stop` was asked to remove the running task; use `TaskContext::exit`.
    StopSelf(TaskId),
    /// The target task is stopped.
    TaskStopped(TaskId),
    /// Signal number out of range.
    InvalidSignal(u8),
    /// The backing thread for a task could not be spawned.
    Spawn(io::Error),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "kernel is already running"),
            Self::TaskNotFound(id) => write!(f, "task {id:?} not found"),
            Self::TimerNotFound(id) => write!(f, "timer {id:?} not found"),
            Self::NotActivatable(id) => write!(f, "task {id:?} cannot be activated"),
            Self::StopSelf(id) => {
                write!(f, "task {id:?} is running; it must stop itself via exit")
            }
            Self::TaskStopped(id) => write!(f, "task {id:?} is stopped"),
            Self::InvalidSignal(num) => write!(f, "signal number {num} out of range"),
            Self::Spawn(err) => write!(f, "failed to spawn task thread: {err}"),
        }
    }
}

impl std::error::Error for KernelError {}

/// Everything the scheduler mutates, guarded by the one kernel lock.
pub(crate) struct KernelState {
    pub(crate) nodes: Vec<Node>,
    pub(crate) cursor: NodeIndex,
    pub(crate) running: Option<TaskId>,
    pub(crate) tick: Tick,
    pub(crate) queues: Vec<Option<TaskId>>,
    pub(crate) shutdown: bool,
    pub(crate) live_tasks: usize,
}

impl KernelState {
    pub(crate) fn new() -> Self {
        Self {
            nodes: vec![Node {
                prev: MAIN_NODE,
                next: MAIN_NODE,
                linked: true,
                body: NodeBody::Main,
            }],
            cursor: MAIN_NODE,
            running: None,
            tick: 0,
            queues: Vec::new(),
            shutdown: false,
            live_tasks: 0,
        }
    }
}

pub(crate) struct KernelInner {
    pub(crate) state: Mutex<KernelState>,
    pub(crate) board: Arc<Switchboard>,
    pub(crate) config: KernelConfig,
    active: AtomicBool,
}

impl KernelInner {
    pub(crate) fn now(&self) -> Tick {
        self.state.lock().tick
    }

    /// Nudges an externally paced kernel out of its idle wait.
    pub(crate) fn poke(&self) {
        self.board.idle.notify_all();
    }

    pub(crate) fn timer_queue(&self, id: TimerId) -> WaitQueue {
        self.state.lock().timer(id).queue
    }

    /// Called by the trampoline when a task's entry procedure returns (or
    /// the task exits/panics): mark it stopped and take it off the run-list.
    pub(crate) fn finalize_task(&self, id: TaskId) {
        let mut state = self.state.lock();
        if state.task(id).state == TaskState::Stopped {
            return;
        }
        if let Some(queue) = state.task(id).guard {
            state.detach_waiter(queue, id);
        }
        {
            let t = state.task_mut(id);
            t.state = TaskState::Stopped;
            t.deadline = None;
            t.signals.delivery = Delivery::Idle;
            log::debug!("task '{}' stopped", t.name);
        }
        state.unlink_node(id.0);
        state.live_tasks -= 1;
    }
}

impl Drop for KernelInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let continuations: Vec<_> = state
            .nodes
            .iter_mut()
            .filter_map(|n| match &mut n.body {
                NodeBody::Task(t) => t.cont.take(),
                _ => None,
            })
            .collect();
        for cont in continuations {
            cont.terminate();
        }
    }
}

/// Weak kernel handle. Synchronization primitives hold one of these so that
/// storing a primitive inside a task closure (which lives in the kernel
/// arena) cannot keep the kernel alive forever.
#[derive(Clone)]
pub struct KernelWeak {
    inner: Weak<KernelInner>,
}

impl KernelWeak {
    pub fn upgrade(&self) -> Option<Kernel> {
        self.inner.upgrade().map(|inner| Kernel { inner })
    }
}

/// Owning handle to one cooperative kernel instance.
#[derive(Clone)]
pub struct Kernel {
    pub(crate) inner: Arc<KernelInner>,
}

impl Kernel {
    pub fn builder() -> KernelBuilder {
        KernelBuilder::new(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> KernelBuilder {
        KernelBuilder::new(config)
    }

    pub(crate) fn from_inner(inner: Arc<KernelInner>) -> Self {
        Self { inner }
    }

    fn new(config: KernelConfig) -> Self {
        Self {
            inner: Arc::new(KernelInner {
                state: Mutex::new(KernelState::new()),
                board: Arc::new(Switchboard::new()),
                config,
                active: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> KernelWeak {
        KernelWeak {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Current kernel tick.
    pub fn now(&self) -> Tick {
        self.inner.now()
    }

    /// Advances the tick by one. The external time source for kernels built
    /// with `auto_tick(false)`; safe to call from any thread.
    pub fn tick(&self) {
        {
            let mut state = self.inner.state.lock();
            state.tick = state.tick.wrapping_add(1);
        }
        self.inner.poke();
    }

    /// Requests an orderly halt: `run` returns once the current pass
    /// completes. Safe to call from any thread, a task, or a handler.
    pub fn shutdown(&self) {
        self.inner.state.lock().shutdown = true;
        self.inner.poke();
    }

    /// Identity of the task executing right now, if any.
    pub fn current_task(&self) -> Option<TaskId> {
        self.inner.state.lock().running
    }

    // Task lifecycle.

    /// Creates a task in the inactive state; it joins the run-list when
    /// activated.
    pub fn create_task(&self, config: TaskConfig) -> TaskId {
        let mut state = self.inner.state.lock();
        let idx = state.push_node(NodeBody::Task(TaskCb::new(config)));
        TaskId(idx)
    }

    /// Activates a created task: spawns its continuation and links it at the
    /// tail of the run-list with a ready state.
    pub fn activate(&self, id: TaskId) -> Result<(), KernelError> {
        let mut state = self.inner.state.lock();
        let (entry, name, on_return, stack_size) = {
            let t = state
                .try_task_mut(id)
                .ok_or(KernelError::TaskNotFound(id))?;
            if t.state != TaskState::Stopped || t.cont.is_some() {
                return Err(KernelError::NotActivatable(id));
            }
            let entry = t.entry.take().ok_or(KernelError::NotActivatable(id))?;
            (entry, t.name, t.on_return, t.stack_size)
        };
        let stack = stack_size.unwrap_or(self.inner.config.default_stack_size);
        let gate = Arc::new(Gate::new());
        let board = Arc::clone(&self.inner.board);
        let weak = Arc::downgrade(&self.inner);
        let thread_gate = Arc::clone(&gate);
        let handle = std::thread::Builder::new()
            .name(format!("ck-task-{name}"))
            .stack_size(stack)
            .spawn(move || task_thread_main(weak, id, thread_gate, board, entry, on_return))
            .map_err(KernelError::Spawn)?;
        {
            let t = state.task_mut(id);
            t.cont = Some(Arc::new(ThreadContinuation::new(
                gate,
                Arc::clone(&self.inner.board),
                handle,
            )));
            t.state = TaskState::Ready;
        }
        state.live_tasks += 1;
        state.link_node(id.0);
        drop(state);
        self.inner.poke();
        log::debug!("task {id:?} activated");
        Ok(())
    }

    /// Creates and immediately activates a task.
    pub fn spawn(&self, config: TaskConfig) -> Result<TaskId, KernelError> {
        let id = self.create_task(config);
        self.activate(id)?;
        Ok(id)
    }

    /// Permanently removes a task that is not currently executing. The
    /// running task stops itself with [`crate::task::TaskContext::exit`].
    /// Stopping an already stopped task is a no-op.
    pub fn stop(&self, id: TaskId) -> Result<(), KernelError> {
        let mut state = self.inner.state.lock();
        if state.running == Some(id) {
            return Err(KernelError::StopSelf(id));
        }
        let t = state.try_task(id).ok_or(KernelError::TaskNotFound(id))?;
        if t.state == TaskState::Stopped {
            return Ok(());
        }
        if let Some(queue) = state.task(id).guard {
            state.detach_waiter(queue, id);
        }
        {
            let t = state.task_mut(id);
            t.state = TaskState::Stopped;
            t.deadline = None;
            t.signals.delivery = Delivery::Idle;
            log::debug!("task '{}' stopped externally", t.name);
        }
        state.unlink_node(id.0);
        state.live_tasks -= 1;
        drop(state);
        self.inner.poke();
        Ok(())
    }

    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.inner.state.lock().try_task(id).map(|t| t.state)
    }

    // Timers.

    /// Creates a timer and links it into the run-list; armed immediately if
    /// the configuration carries an initial delay.
    pub fn create_timer(&self, config: TimerConfig) -> TimerId {
        let mut state = self.inner.state.lock();
        let queue = state.new_queue();
        let now = state.tick;
        let deadline = config.delay.map(|d| Deadline::new(now, d));
        let idx = state.push_node(NodeBody::Timer(TimerCb {
            name: config.name,
            callback: config.callback,
            deadline,
            period: config.period,
            queue,
        }));
        state.link_node(idx);
        drop(state);
        self.inner.poke();
        TimerId(idx)
    }

    /// (Re)arms a timer to fire `delay` ticks from now, then every `period`
    /// ticks if given.
    pub fn arm_timer(
        &self,
        id: TimerId,
        delay: u32,
        period: Option<u32>,
    ) -> Result<(), KernelError> {
        {
            let mut state = self.inner.state.lock();
            let now = state.tick;
            let t = state
                .try_timer_mut(id)
                .ok_or(KernelError::TimerNotFound(id))?;
            t.deadline = Some(Deadline::new(now, delay));
            t.period = period;
        }
        self.inner.poke();
        Ok(())
    }

    pub fn disarm_timer(&self, id: TimerId) -> Result<(), KernelError> {
        let mut state = self.inner.state.lock();
        let t = state
            .try_timer_mut(id)
            .ok_or(KernelError::TimerNotFound(id))?;
        t.deadline = None;
        Ok(())
    }

    pub fn timer_armed(&self, id: TimerId) -> Result<bool, KernelError> {
        let mut state = self.inner.state.lock();
        let t = state
            .try_timer_mut(id)
            .ok_or(KernelError::TimerNotFound(id))?;
        Ok(t.armed())
    }

    // Signals.

    /// Posts signal `num` to `target`. Pends the bit, and if the target has a
    /// handler, stages delivery for its next turn (or runs the handlers
    /// immediately when the target is the running task).
    pub fn post_signal(&self, target: TaskId, num: u8) -> Result<(), KernelError> {
        let result = self.inner.post_signal_inner(target, num);
        self.inner.poke();
        result
    }

    /// Installs or replaces a task's signal handler.
    pub fn set_signal_handler(
        &self,
        target: TaskId,
        handler: impl Fn(u8) + Send + Sync + 'static,
    ) -> Result<(), KernelError> {
        let mut state = self.inner.state.lock();
        let t = state
            .try_task_mut(target)
            .ok_or(KernelError::TaskNotFound(target))?;
        t.signals.handler = Some(Arc::new(handler) as SignalHandlerFn);
        Ok(())
    }

    // Wait-queue protocol surface used by synchronization primitives.

    /// Allocates a wait queue. Queues live as long as the kernel.
    pub fn new_wait_queue(&self) -> WaitQueue {
        self.inner.state.lock().new_queue()
    }

    /// Pops and wakes the FIFO head, delivering `code`.
    pub fn wake_one(&self, queue: WaitQueue, code: WakeCode) -> Option<TaskId> {
        let woken = self.inner.state.lock().wake_one(queue, code);
        self.inner.poke();
        woken
    }

    /// Drains up to `n` waiters in FIFO order.
    pub fn wake_n(&self, queue: WaitQueue, code: WakeCode, n: usize) -> usize {
        let woken = self.inner.state.lock().wake_n(queue, code, n);
        self.inner.poke();
        woken
    }

    /// Drains the whole queue.
    pub fn wake_all(&self, queue: WaitQueue, code: WakeCode) -> usize {
        self.wake_n(queue, code, usize::MAX)
    }

    /// Wakes one specific waiter if it is in the queue.
    pub fn wake_specific(&self, queue: WaitQueue, id: TaskId, code: WakeCode) -> bool {
        let woken = self.inner.state.lock().wake_specific(queue, id, code);
        self.inner.poke();
        woken
    }

    /// Walks the queue in FIFO order, handing each waiter's payload word to
    /// `decide`; waiters for which it returns true are woken with `code`.
    pub fn wake_filter(
        &self,
        queue: WaitQueue,
        code: WakeCode,
        mut decide: impl FnMut(&mut u64) -> bool,
    ) -> usize {
        let woken = self.inner.state.lock().wake_filter(queue, code, &mut decide);
        self.inner.poke();
        woken
    }

    /// Empties a queue, waking every waiter with `Stopped`. The reset path
    /// shared by all primitives.
    pub fn reset_queue(&self, queue: WaitQueue) -> usize {
        self.wake_all(queue, WakeCode::Stopped)
    }

    // The scheduler loop.

    /// Drives the run-list until shutdown is requested or no live task
    /// remains. Blocked tasks keep their state across calls, so a halted
    /// kernel can be run again.
    pub fn run(&self) -> Result<(), KernelError> {
        if self.inner.active.swap(true, Ordering::SeqCst) {
            return Err(KernelError::AlreadyRunning);
        }
        log::info!("kernel '{}' running", self.inner.config.name);
        let inner = &*self.inner;
        let mut state = inner.state.lock();
        loop {
            match schedule_pass(&mut state) {
                Pass::Halt => break,
                Pass::Idle => {
                    if let Some(callback) = inner.config.idle_callback {
                        drop(state);
                        callback();
                        state = inner.state.lock();
                        if state.shutdown || state.has_immediate_work() {
                            continue;
                        }
                    }
                    if inner.config.auto_tick {
                        state.tick = state.tick.wrapping_add(1);
                        log::trace!("idle revolution, tick -> {}", state.tick);
                    } else {
                        inner.board.idle.wait(&mut state);
                    }
                }
                Pass::FireTimer(id) => {
                    let (callback, queue, name) = {
                        let t = state.timer_mut(id);
                        let callback = Arc::clone(&t.callback);
                        let queue = t.queue;
                        let name = t.name;
                        t.rearm_after_fire();
                        (callback, queue, name)
                    };
                    let woken = state.wake_n(queue, WakeCode::Success, usize::MAX);
                    log::trace!("timer '{}' fired, woke {} waiter(s)", name, woken);
                    drop(state);
                    callback();
                    state = inner.state.lock();
                }
                Pass::Deliver(id) => {
                    state = inner.deliver_staged(state, id);
                }
                Pass::Run(id) => {
                    state.running = Some(id);
                    let cont = state
                        .task(id)
                        .cont
                        .as_ref()
                        .map(Arc::clone)
                        .expect("scheduled task has no continuation");
                    log::trace!("resuming task '{}'", state.task(id).name);
                    drop(state);
                    cont.resume();
                    state = inner.state.lock();
                    state.running = None;
                }
            }
        }
        state.running = None;
        drop(state);
        self.inner.active.store(false, Ordering::SeqCst);
        log::info!("kernel '{}' halted", self.inner.config.name);
        Ok(())
    }
}

/// Builder for a kernel plus its initial tasks and timers.
pub struct KernelBuilder {
    config: KernelConfig,
    tasks: Vec<TaskConfig>,
    timers: Vec<TimerConfig>,
}

impl KernelBuilder {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            tasks: Vec::new(),
            timers: Vec::new(),
        }
    }

    /// Registers a task, activated in registration order when the kernel is
    /// built.
    pub fn task(mut self, config: TaskConfig) -> Self {
        self.tasks.push(config);
        self
    }

    /// Registers a timer, created when the kernel is built.
    pub fn timer(mut self, config: TimerConfig) -> Self {
        self.timers.push(config);
        self
    }

    pub fn build(self) -> Result<Kernel, KernelError> {
        let kernel = Kernel::new(self.config);
        for config in self.tasks {
            kernel.spawn(config)?;
        }
        for config in self.timers {
            kernel.create_timer(config);
        }
        Ok(kernel)
    }
}
