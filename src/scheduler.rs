//! # Scheduler
//!
//! Core scheduling logic for TOS: a preemptive, fixed-priority scheduler over
//! a fixed pool of task control blocks.
//!
//! ## Run State
//!
//! - one FIFO ready list per priority, plus `ready_mask` where bit *p* is set
//!   iff ready list *p* is non-empty
//! - one timed-wait list shared by sleeping tasks and timed synchronization
//!   waits
//! - the all-tasks list and the free-TCB list
//!
//! The running task stays at the head of its ready list. A scheduling
//! decision takes the highest set bit of `ready_mask` and the head of that
//! list; ties within a priority are broken by list order, which only `yield`
//! rotates.
//!
//! ## Switching
//!
//! `schedule` and `exit_isr` only *request* a switch through the [`Port`].
//! The switch completes in [`Scheduler::switch_in`], which the port's switch
//! handler (PendSV on Cortex-M) calls with the outgoing stack pointer.
//!
//! All methods expect to run with interrupts masked; `KernelCell` provides
//! that on the target.

use crate::arch::Port;
use crate::config::{
    IDLE_PRIO, MAX_CONDS, MAX_MUTEXES, MAX_PRIO, MIN_STACK_WORDS, PRIO_LEVELS, TASK_POOL_SIZE,
    TICK_MS, WAIT_INFINITE,
};
use crate::error::{KernelError, Result};
use crate::log;
use crate::queue::{LinkTable, NodeId};
use crate::task::{TaskAttr, TaskControlBlock, TaskEntry, TaskHandle, TaskInfo, TaskState};

// ---------------------------------------------------------------------------
// Link table layout
// ---------------------------------------------------------------------------

// Ready/pending table: ready heads, mutex pending heads, condvar waiting
// heads, then one node per TCB.
const MUTEX_HEAD_BASE: usize = PRIO_LEVELS;
const COND_HEAD_BASE: usize = MUTEX_HEAD_BASE + MAX_MUTEXES;
const RP_TASK_BASE: usize = COND_HEAD_BASE + MAX_CONDS;
const RP_NODES: usize = RP_TASK_BASE + TASK_POOL_SIZE;

// Timed-wait table: one head, then one node per TCB.
const WAIT_HEAD: NodeId = 0;
const WAIT_NODES: usize = 1 + TASK_POOL_SIZE;

// All/free table: two heads, then one node per TCB.
const ALL_HEAD: NodeId = 0;
const FREE_HEAD: NodeId = 1;
const AF_NODES: usize = 2 + TASK_POOL_SIZE;

#[inline]
const fn ready_head(prio: u8) -> NodeId {
    prio as NodeId
}

#[inline]
const fn rp_node(task: usize) -> NodeId {
    (RP_TASK_BASE + task) as NodeId
}

#[inline]
const fn wait_node(task: usize) -> NodeId {
    (1 + task) as NodeId
}

#[inline]
const fn af_node(task: usize) -> NodeId {
    (2 + task) as NodeId
}

/// Blocking list owned by a synchronization object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendList {
    /// Pending list of mutex slot `n`.
    Mutex(usize),
    /// Waiting list of condition variable slot `n`.
    Cond(usize),
}

impl PendList {
    fn head(self) -> NodeId {
        match self {
            PendList::Mutex(slot) => {
                debug_assert!(slot < MAX_MUTEXES);
                (MUTEX_HEAD_BASE + slot) as NodeId
            }
            PendList::Cond(slot) => {
                debug_assert!(slot < MAX_CONDS);
                (COND_HEAD_BASE + slot) as NodeId
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Timeout {
    /// Fail at once instead of blocking.
    Immediate,
    /// Give up after this many milliseconds. `Millis(0)` is `Immediate`.
    Millis(u32),
    /// Wait until woken.
    Forever,
}

impl Timeout {
    pub fn is_immediate(self) -> bool {
        matches!(self, Timeout::Immediate | Timeout::Millis(0))
    }

    /// Deadline in ticks, `None` for an unbounded wait.
    pub fn ticks(self) -> Option<u32> {
        match self {
            Timeout::Immediate => Some(0),
            Timeout::Millis(ms) => Some(ms_to_ticks(ms)),
            Timeout::Forever => None,
        }
    }
}

/// Convert milliseconds to ticks, never less than one tick. Finite waits
/// stay below `WAIT_INFINITE`.
pub fn ms_to_ticks(ms: u32) -> u32 {
    (ms / TICK_MS).clamp(1, WAIT_INFINITE - 1)
}

/// Result of the first phase of a blocking call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Pend {
    /// Finished without blocking.
    Done,
    /// The caller was parked and a switch was requested; finish the call once
    /// the task runs again.
    Blocked,
}

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

/// The central scheduler state.
pub struct Scheduler<P: Port> {
    port: P,

    /// Fixed TCB pool. Slot 0 holds the idle task after `init`.
    tasks: [TaskControlBlock; TASK_POOL_SIZE],

    ready_pending: LinkTable<RP_NODES>,
    waiting: LinkTable<WAIT_NODES>,
    all_free: LinkTable<AF_NODES>,

    /// Task whose context is loaded on the CPU.
    current: Option<usize>,
    /// Task chosen by the last scheduling decision.
    switch_to: Option<usize>,
    /// Priority mask of the current task.
    current_prio_mask: u32,

    ready_mask: u32,
    intr_level: u8,
    schedule_enabled: bool,
    running: bool,
    ticks: u32,

    task_count: u32,
    next_id: u32,
    idle: Option<TaskHandle>,
}

impl<P: Port> Scheduler<P> {
    /// A scheduler with an empty pool. Call [`Scheduler::init`] before use.
    pub fn new(port: P) -> Self {
        let mut scheduler = Self {
            port,
            tasks: [TaskControlBlock::EMPTY; TASK_POOL_SIZE],
            ready_pending: LinkTable::new(),
            waiting: LinkTable::new(),
            all_free: LinkTable::new(),
            current: None,
            switch_to: None,
            current_prio_mask: 0,
            ready_mask: 0,
            intr_level: 0,
            schedule_enabled: false,
            running: false,
            ticks: 0,
            task_count: 0,
            next_id: 0,
            idle: None,
        };
        scheduler.reset();
        scheduler
    }

    fn reset(&mut self) {
        self.current = None;
        self.switch_to = None;
        self.current_prio_mask = 0;
        self.ready_mask = 0;
        self.intr_level = 0;
        self.schedule_enabled = false;
        self.running = false;
        self.ticks = 0;
        self.task_count = 0;
        self.next_id = 0;
        self.idle = None;

        self.ready_pending.reset();
        self.waiting.reset();
        self.all_free.reset();

        for (i, tcb) in self.tasks.iter_mut().enumerate() {
            if tcb.is_live() {
                tcb.release();
            }
            self.all_free.insert_tail(FREE_HEAD, af_node(i));
        }
    }

    /// Reset all run state, rebuild the free pool and create the idle task.
    ///
    /// Failing to create the idle task is fatal for the kernel; the error is
    /// logged and returned so the caller can halt.
    pub fn init(&mut self, idle_stack: &'static mut [u32]) -> Result<TaskHandle> {
        self.reset();

        let attr = TaskAttr {
            name: "idle",
            priority: IDLE_PRIO,
            stack: Some(idle_stack),
            wait_time: 0,
        };
        match self.create_task(idle_task, 0, attr) {
            Ok(handle) => {
                self.idle = Some(handle);
                Ok(handle)
            }
            Err(e) => {
                log::error!("idle task creation failed: {}", e);
                Err(e)
            }
        }
    }

    /// Select the first task and mark the kernel running.
    ///
    /// Returns the stack pointer of the first task; the caller hands it to
    /// [`Port::start_first`].
    pub fn start(&mut self) -> Result<*mut u32> {
        let next = self.select_next().ok_or(KernelError::NotStarted)?;

        self.running = true;
        self.schedule_enabled = true;
        self.switch_to = None;
        self.current = Some(next);
        self.current_prio_mask = self.tasks[next].prio_mask;

        let tcb = &mut self.tasks[next];
        tcb.switch_count = tcb.switch_count.wrapping_add(1);
        tcb.state = TaskState::Running;

        self.port.init_tick();
        log::info!("kernel started with task {}", tcb.name);
        Ok(tcb.stack_ptr)
    }

    /// Start the tick source without starting the scheduler.
    pub fn start_clock(&mut self) {
        self.port.init_tick();
    }

    // -----------------------------------------------------------------------
    // Task lifecycle
    // -----------------------------------------------------------------------

    /// Create a task and put it on its ready list.
    ///
    /// If the kernel is running the new task may preempt the caller.
    pub fn create_task(&mut self, entry: TaskEntry, arg: usize, attr: TaskAttr) -> Result<TaskHandle> {
        let TaskAttr {
            name,
            priority,
            stack,
            wait_time,
        } = attr;

        let stack = match stack {
            Some(stack) if !stack.is_empty() => stack,
            _ => return Err(KernelError::NullHandle),
        };
        if self.intr_level > 0 {
            return Err(KernelError::InterruptContext);
        }
        if priority > MAX_PRIO || stack.len() < MIN_STACK_WORDS {
            return Err(KernelError::Invalid);
        }

        let Some(node) = self.all_free.first(FREE_HEAD) else {
            log::warning!("create {}: no free task slots", name);
            return Err(KernelError::ResourceExhausted);
        };
        self.all_free.remove(node);
        let idx = node as usize - af_node(0) as usize;

        let sp = self.port.init_stack_frame(entry, arg, stack);
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.tasks[idx].init(id, name, priority, wait_time, stack, sp);

        self.ready_pending.insert_tail(ready_head(priority), rp_node(idx));
        self.ready_mask |= self.tasks[idx].prio_mask;
        self.all_free.insert_tail(ALL_HEAD, node);
        self.task_count += 1;

        log::info!(
            "create {}: prio {} stack {} bytes",
            name,
            priority,
            self.tasks[idx].stack_size
        );

        if self.running {
            self.schedule();
        }
        Ok(self.handle_of(idx))
    }

    /// Delete a task and return its TCB to the pool. The caller keeps the
    /// stack memory.
    ///
    /// Refused without effect from interrupt context.
    pub fn delete_task(&mut self, handle: TaskHandle) -> Result<()> {
        if self.intr_level > 0 {
            log::warning!("delete_task ignored in interrupt context");
            return Ok(());
        }
        let idx = self.resolve(handle)?;
        if self.idle == Some(handle) {
            return Err(KernelError::PermissionDenied);
        }

        let prio = self.tasks[idx].priority;
        self.ready_pending.remove(rp_node(idx));
        self.refresh_ready_bit(prio);
        self.waiting.remove(wait_node(idx));

        self.all_free.remove(af_node(idx));
        self.all_free.insert_tail(FREE_HEAD, af_node(idx));
        self.task_count -= 1;

        log::info!("delete {}", self.tasks[idx].name);
        self.tasks[idx].release();

        if self.current == Some(idx) {
            self.current = None;
            self.current_prio_mask = 0;
        }
        if self.switch_to == Some(idx) {
            self.switch_to = None;
        }
        if self.running {
            self.schedule();
        }
        Ok(())
    }

    /// Change a task's priority. Returns the previous priority.
    ///
    /// A ready or running task moves to the ready list of its new priority.
    /// A blocked task only records the new value: its pending list is not
    /// ordered by priority and it joins the right ready list when woken.
    pub fn set_priority(&mut self, handle: TaskHandle, priority: u8) -> Result<u8> {
        if priority > MAX_PRIO {
            return Err(KernelError::Invalid);
        }
        let idx = self.resolve(handle)?;
        let old = self.tasks[idx].priority;
        if old == priority {
            return Ok(old);
        }

        if self.tasks[idx].is_schedulable() {
            self.ready_pending.remove(rp_node(idx));
            self.refresh_ready_bit(old);
            self.ready_pending.insert_tail(ready_head(priority), rp_node(idx));
            self.ready_mask |= 1 << priority;
        }
        self.tasks[idx].set_priority(priority);
        if self.current == Some(idx) {
            self.current_prio_mask = self.tasks[idx].prio_mask;
        }

        log::debug!("{}: prio {} -> {}", self.tasks[idx].name, old, priority);
        self.schedule();
        Ok(old)
    }

    pub fn priority(&self, handle: TaskHandle) -> Result<u8> {
        self.resolve(handle).map(|idx| self.tasks[idx].priority)
    }

    /// State of a task. Stale handles report `Stopped`.
    pub fn task_state(&self, handle: TaskHandle) -> TaskState {
        self.resolve(handle)
            .map(|idx| self.tasks[idx].state)
            .unwrap_or(TaskState::Stopped)
    }

    pub fn task_info(&self, handle: TaskHandle) -> Result<TaskInfo> {
        self.resolve(handle).map(|idx| self.tasks[idx].info())
    }

    /// Live tasks in creation order.
    pub fn tasks(&self) -> impl Iterator<Item = TaskHandle> + '_ {
        self.all_free
            .iter(ALL_HEAD)
            .map(move |node| self.handle_of(node as usize - af_node(0) as usize))
    }

    // -----------------------------------------------------------------------
    // Current task operations
    // -----------------------------------------------------------------------

    /// Put the current task to sleep for `ms` milliseconds (at least one
    /// tick). Ignored in interrupt context.
    pub fn sleep(&mut self, ms: u32) {
        if self.intr_level > 0 {
            log::warning!("sleep ignored in interrupt context");
            return;
        }
        if self.suspend_current(None, Some(ms_to_ticks(ms)), TaskState::Waiting).is_ok() {
            self.schedule();
        }
    }

    /// Move the current task behind its peers of equal priority.
    pub fn yield_now(&mut self) {
        if self.intr_level > 0 {
            return;
        }
        let Some(cur) = self.current else {
            return;
        };
        let node = rp_node(cur);
        self.ready_pending.remove(node);
        self.ready_pending
            .insert_tail(ready_head(self.tasks[cur].priority), node);
        self.schedule();
    }

    // -----------------------------------------------------------------------
    // Tick and interrupt bracketing
    // -----------------------------------------------------------------------

    /// Tick interrupt body: advance time and wake tasks whose wait expired.
    ///
    /// Expiry moves a task to its ready list whatever it was waiting for; a
    /// synchronization call tells timeout from wakeup by re-checking its
    /// object afterwards.
    pub fn tick(&mut self) {
        self.ticks = self.ticks.wrapping_add(1);
        if let Some(cur) = self.current {
            self.tasks[cur].run_ticks = self.tasks[cur].run_ticks.wrapping_add(1);
        }

        let mut node = self.waiting.next(WAIT_HEAD);
        while node != WAIT_HEAD {
            // Waking unlinks the node, read the successor first.
            let next = self.waiting.next(node);
            let idx = node as usize - 1;
            let tcb = &mut self.tasks[idx];
            if tcb.has_deadline() {
                if tcb.wait_time <= 1 {
                    tcb.wait_time = 0;
                    log::trace!("{}: wait expired", tcb.name);
                    self.wake(idx);
                } else {
                    tcb.wait_time -= 1;
                }
            }
            node = next;
        }
    }

    /// Called at the start of every interrupt handler.
    pub fn enter_isr(&mut self) {
        if self.running {
            self.intr_level = self.intr_level.saturating_add(1);
        }
    }

    /// Called at the end of every interrupt handler. Leaving the outermost
    /// handler reschedules.
    pub fn exit_isr(&mut self) {
        if !self.running {
            return;
        }
        self.intr_level = self.intr_level.saturating_sub(1);
        if self.intr_level == 0 && self.schedule_enabled {
            if let Some(next) = self.select_next() {
                self.switch_to = Some(next);
                if self.current != Some(next) {
                    self.tasks[next].switch_count = self.tasks[next].switch_count.wrapping_add(1);
                    self.port.switch_context_from_isr();
                }
            }
        }
    }

    pub fn schedule_enable(&mut self) {
        self.schedule_enabled = true;
    }

    /// Defer preemption until [`Scheduler::schedule_enable`].
    pub fn schedule_disable(&mut self) {
        self.schedule_enabled = false;
    }

    // -----------------------------------------------------------------------
    // Scheduling decision
    // -----------------------------------------------------------------------

    /// Pick the highest-priority ready task and request a switch to it if it
    /// is not the current task. No-op inside interrupts or while scheduling
    /// is disabled.
    pub fn schedule(&mut self) {
        if self.intr_level > 0 || !self.schedule_enabled {
            return;
        }
        let Some(next) = self.select_next() else {
            return;
        };
        self.switch_to = Some(next);
        if self.current != Some(next) {
            self.tasks[next].switch_count = self.tasks[next].switch_count.wrapping_add(1);
            self.port.switch_context();
        }
    }

    fn select_next(&self) -> Option<usize> {
        if self.ready_mask == 0 {
            return None;
        }
        let prio = (31 - self.ready_mask.leading_zeros()) as u8;
        self.ready_pending
            .first(ready_head(prio))
            .map(|node| node as usize - RP_TASK_BASE)
    }

    /// Complete a requested switch. Stores `saved_sp` in the outgoing task,
    /// makes the selected task current and returns its stack pointer.
    ///
    /// # Panics
    /// If `saved_sp` lies outside the outgoing task's stack region. The task
    /// has overrun its stack and kernel memory can no longer be trusted.
    pub fn switch_in(&mut self, saved_sp: *mut u32) -> *mut u32 {
        if let Some(cur) = self.current {
            let tcb = &mut self.tasks[cur];
            if !tcb.owns_stack_pointer(saved_sp) {
                log::error!("stack overflow in task {}", tcb.name);
                panic!("stack overflow in task {}", tcb.name);
            }
            tcb.stack_ptr = saved_sp;
            if tcb.state == TaskState::Running {
                tcb.state = TaskState::Ready;
            }
        }

        let Some(next) = self.switch_to.take().or(self.current) else {
            return saved_sp;
        };
        self.current = Some(next);
        self.current_prio_mask = self.tasks[next].prio_mask;
        let tcb = &mut self.tasks[next];
        tcb.state = TaskState::Running;
        tcb.stack_ptr
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn in_isr(&self) -> bool {
        self.intr_level > 0
    }

    pub fn tick_count(&self) -> u32 {
        self.ticks
    }

    pub fn task_count(&self) -> u32 {
        self.task_count
    }

    pub fn ready_mask(&self) -> u32 {
        self.ready_mask
    }

    pub fn current_task(&self) -> Option<TaskHandle> {
        self.current.map(|idx| self.handle_of(idx))
    }

    /// Priority mask of the current task.
    pub fn current_prio_mask(&self) -> u32 {
        self.current_prio_mask
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    // -----------------------------------------------------------------------
    // Blocking support for the synchronization objects
    // -----------------------------------------------------------------------

    pub(crate) fn handle_of(&self, idx: usize) -> TaskHandle {
        TaskHandle {
            index: idx as u8,
            generation: self.tasks[idx].generation,
        }
    }

    fn resolve(&self, handle: TaskHandle) -> Result<usize> {
        let idx = handle.index as usize;
        match self.tasks.get(idx) {
            Some(tcb) if tcb.generation == handle.generation && tcb.is_live() => Ok(idx),
            _ => Err(KernelError::Invalid),
        }
    }

    pub(crate) fn priority_of(&self, idx: usize) -> u8 {
        self.tasks[idx].priority
    }

    /// Take the current task off its ready list and park it on `list` (if
    /// any), with a deadline of `ticks` (if any).
    pub(crate) fn suspend_current(
        &mut self,
        list: Option<PendList>,
        ticks: Option<u32>,
        state: TaskState,
    ) -> Result<()> {
        let cur = self.current.ok_or(KernelError::NotStarted)?;
        let node = rp_node(cur);
        let prio = self.tasks[cur].priority;

        self.ready_pending.remove(node);
        self.refresh_ready_bit(prio);
        if let Some(list) = list {
            self.ready_pending.insert_tail(list.head(), node);
        }

        let tcb = &mut self.tasks[cur];
        tcb.state = state;
        match ticks {
            Some(ticks) => {
                tcb.wait_time = ticks;
                self.waiting.insert_tail(WAIT_HEAD, wait_node(cur));
            }
            None => tcb.wait_time = WAIT_INFINITE,
        }
        Ok(())
    }

    /// Move a blocked task to its ready list, off any pending and timed-wait
    /// list.
    pub(crate) fn wake(&mut self, idx: usize) {
        let node = rp_node(idx);
        self.ready_pending.remove(node);
        self.waiting.remove(wait_node(idx));

        let tcb = &mut self.tasks[idx];
        tcb.state = TaskState::Ready;
        self.ready_pending.insert_tail(ready_head(tcb.priority), node);
        self.ready_mask |= tcb.prio_mask;
    }

    pub(crate) fn first_pending(&self, list: PendList) -> Option<usize> {
        self.ready_pending
            .first(list.head())
            .map(|node| node as usize - RP_TASK_BASE)
    }

    pub(crate) fn pending(&self, list: PendList) -> impl Iterator<Item = usize> + '_ {
        self.ready_pending
            .iter(list.head())
            .map(|node| node as usize - RP_TASK_BASE)
    }

    fn refresh_ready_bit(&mut self, prio: u8) {
        if self.ready_pending.is_empty(ready_head(prio)) {
            self.ready_mask &= !(1 << prio);
        } else {
            self.ready_mask |= 1 << prio;
        }
    }

    // -----------------------------------------------------------------------
    // Test support
    // -----------------------------------------------------------------------

    /// Play the role of the switch handler: complete a pending switch using
    /// the current task's saved stack pointer.
    #[cfg(test)]
    pub(crate) fn dispatch(&mut self) {
        let sp = self
            .current
            .map(|idx| self.tasks[idx].stack_ptr)
            .unwrap_or(core::ptr::null_mut());
        self.switch_in(sp);
    }

    #[cfg(test)]
    pub(crate) fn assert_ready_mask_consistent(&self) {
        for prio in 0..PRIO_LEVELS as u8 {
            let bit = self.ready_mask & (1 << prio) != 0;
            let non_empty = !self.ready_pending.is_empty(ready_head(prio));
            assert_eq!(bit, non_empty, "ready mask bit {} out of sync", prio);
        }
    }

    #[cfg(test)]
    pub(crate) fn ready_order(&self, prio: u8) -> std::vec::Vec<TaskHandle> {
        self.ready_pending
            .iter(ready_head(prio))
            .map(|node| self.handle_of(node as usize - RP_TASK_BASE))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn free_slots(&self) -> usize {
        self.all_free.len(FREE_HEAD)
    }
}

/// Idle task: runs whenever nothing else is ready.
extern "C" fn idle_task(_arg: usize) -> ! {
    loop {
        core::hint::spin_loop();
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
