//! # Task Control Block
//!
//! Defines the task model for TOS. Each task owns one slot of the fixed TCB
//! pool in the scheduler; the slot records scheduling state, the bounds of the
//! caller-supplied stack and accounting counters. The three list memberships
//! of a task (ready/pending, timed-wait, all/free) are kept by the scheduler's
//! link tables, keyed by the slot index.

use crate::config::{MAX_PRIO, WAIT_INFINITE};

/// Task entry point. Receives the argument given at creation and never
/// returns.
pub type TaskEntry = extern "C" fn(usize) -> !;

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
///
/// ```text
///   Stopped ──create──► Ready ◄──schedule/preempt──► Running
///      ▲                  ▲                             │
///      │                  │ unlock / signal / timeout   ├─ lock / wait ──► Pending
///      │                  └─────────────────────────────┤
///      │                  ▲ tick expiry                 └─ sleep ───────► Waiting
///      │                  └──────────────────────────────────────────────────┘
///      └──────────────── delete (from any state) ──────────────────────────────
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TaskState {
    /// Slot unused: never created or deleted.
    Stopped,
    /// On a ready list, not executing.
    Ready,
    /// Currently executing. Stays at the head of its ready list.
    Running,
    /// Blocked on a mutex or condition variable.
    Pending,
    /// Sleeping until its wait counter expires.
    Waiting,
}

// ---------------------------------------------------------------------------
// Creation attributes
// ---------------------------------------------------------------------------

/// Attributes for [`create_task`](crate::scheduler::Scheduler::create_task).
///
/// The stack region is owned by the caller for the whole life of the task; the
/// kernel writes the initial frame into it but never frees it.
pub struct TaskAttr {
    /// Human-readable name, reported by `task_info`.
    pub name: &'static str,
    /// Priority, 0..=`MAX_PRIO`. Higher runs first.
    pub priority: u8,
    /// Stack memory for the task.
    pub stack: Option<&'static mut [u32]>,
    /// Initial value of the wait counter. Recorded only; a new task always
    /// starts on its ready list.
    pub wait_time: u32,
}

impl TaskAttr {
    /// Attributes with the given name, priority and stack.
    pub fn new(name: &'static str, priority: u8, stack: &'static mut [u32]) -> Self {
        Self {
            name,
            priority,
            stack: Some(stack),
            wait_time: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Reference to a task. Carries the generation of its TCB slot, so a handle
/// kept after the task was deleted is recognised as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TaskHandle {
    pub(crate) index: u8,
    pub(crate) generation: u16,
}

impl TaskHandle {
    /// Slot index in the TCB pool.
    pub fn slot(&self) -> usize {
        self.index as usize
    }
}

/// Snapshot of a task for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TaskInfo {
    pub id: u32,
    pub name: &'static str,
    pub priority: u8,
    pub state: TaskState,
    /// Number of times the task was selected to run.
    pub switch_count: u32,
    /// Ticks during which the task was current.
    pub run_ticks: u32,
    /// Stack size in bytes.
    pub stack_size: usize,
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Task Control Block (TCB).
///
/// Stack bounds are raw addresses into the caller's region:
/// `stack_base` is its lowest word, `stack_top` is one past its highest.
/// The saved stack pointer is opaque to the portable kernel beyond the
/// bounds check.
pub struct TaskControlBlock {
    /// Creation sequence number.
    pub id: u32,
    pub name: &'static str,
    pub state: TaskState,
    pub priority: u8,
    /// Always `1 << priority`.
    pub prio_mask: u32,
    /// Ticks left before a timed wait expires, or `WAIT_INFINITE`.
    pub wait_time: u32,
    /// Saved stack pointer, updated on every switch away from the task.
    pub stack_ptr: *mut u32,
    pub stack_base: *mut u32,
    pub stack_top: *mut u32,
    /// Stack size in bytes.
    pub stack_size: usize,
    pub switch_count: u32,
    pub run_ticks: u32,
    /// Bumped whenever the slot is released.
    pub generation: u16,
}

// Safety: the raw stack pointers refer to caller-owned `'static` memory and
// are only touched with interrupts masked.
unsafe impl Send for TaskControlBlock {}

impl TaskControlBlock {
    pub const EMPTY: Self = Self::empty();

    /// An unused slot.
    pub const fn empty() -> Self {
        Self {
            id: 0,
            name: "",
            state: TaskState::Stopped,
            priority: 0,
            prio_mask: 1,
            wait_time: 0,
            stack_ptr: core::ptr::null_mut(),
            stack_base: core::ptr::null_mut(),
            stack_top: core::ptr::null_mut(),
            stack_size: 0,
            switch_count: 0,
            run_ticks: 0,
            generation: 0,
        }
    }

    /// Fill the slot for a freshly created task. The generation is kept.
    pub fn init(
        &mut self,
        id: u32,
        name: &'static str,
        priority: u8,
        wait_time: u32,
        stack: &mut [u32],
        stack_ptr: *mut u32,
    ) {
        debug_assert!(priority <= MAX_PRIO);
        let range = stack.as_mut_ptr_range();
        self.id = id;
        self.name = name;
        self.state = TaskState::Ready;
        self.set_priority(priority);
        self.wait_time = wait_time;
        self.stack_ptr = stack_ptr;
        self.stack_base = range.start;
        self.stack_top = range.end;
        self.stack_size = core::mem::size_of_val(stack);
        self.switch_count = 0;
        self.run_ticks = 0;
    }

    /// Mark the slot unused and invalidate outstanding handles.
    pub fn release(&mut self) {
        self.state = TaskState::Stopped;
        self.wait_time = 0;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Update the priority and its derived mask.
    #[inline]
    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority;
        self.prio_mask = 1 << priority;
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.state != TaskState::Stopped
    }

    /// True while the task sits on a ready list (ready or executing).
    #[inline]
    pub fn is_schedulable(&self) -> bool {
        matches!(self.state, TaskState::Ready | TaskState::Running)
    }

    /// True if the wait counter has a finite deadline.
    #[inline]
    pub fn has_deadline(&self) -> bool {
        self.wait_time != WAIT_INFINITE
    }

    /// True if `sp` lies inside the task's stack region.
    pub fn owns_stack_pointer(&self, sp: *mut u32) -> bool {
        let sp = sp as usize;
        sp >= self.stack_base as usize && sp <= self.stack_top as usize
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            name: self.name,
            priority: self.priority,
            state: self.state,
            switch_count: self.switch_count,
            run_ticks: self.run_ticks,
            stack_size: self.stack_size,
        }
    }
}
