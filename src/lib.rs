//! # TOS: Tiny Operating System
//!
//! A small preemptive, fixed-priority RTOS kernel for single-core
//! Cortex-M microcontrollers.
//!
//! ## Overview
//!
//! TOS runs a fixed pool of tasks over per-priority FIFO ready lists. The
//! highest-priority ready task always runs; equal priorities rotate only when
//! a task yields. Tasks block on timed sleeps, mutexes and condition
//! variables, and a small bucketed allocator serves blocks of up to 128 bytes.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                   │
//! ├────────────────────────────────────────────────────────┤
//! │               Kernel API (kernel.rs)                   │
//! │    KernelCell · create_task · sleep · lock · wait      │
//! ├──────────────┬──────────────────┬──────────────────────┤
//! │  Scheduler   │  Mutex / Cond    │  Allocator (mem.rs)  │
//! │  scheduler.rs│  mutex.rs        │  ─ alloc / dealloc   │
//! │  ─ schedule()│  cond.rs         │  ─ malloc / free     │
//! │  ─ tick()    │  ─ FIFO handoff  │                      │
//! │  ─ switch_in │  ─ sequence no.  │                      │
//! ├──────────────┴──────────────────┴──────────────────────┤
//! │   Task Model (task.rs) · Link tables (queue.rs)        │
//! ├────────────────────────────────────────────────────────┤
//! │   Port trait (arch/mod.rs) · Cortex-M (arch/cortex_m)  │
//! │   PendSV · SysTick · Stack frames                      │
//! ├────────────────────────────────────────────────────────┤
//! │         ARM Cortex-M3/M4 Hardware (Thumb-2)            │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Scheduling Model
//!
//! - Priorities `0..=MAX_PRIO`; numerically higher runs first; the idle task
//!   sits at priority 0 and is always ready.
//! - Bit *p* of the ready mask is set iff ready list *p* is non-empty, so
//!   the next task is the head of the list at the mask's highest set bit.
//! - Preemption points: task creation, unlock, signal, priority change,
//!   sleep, yield and the exit of the outermost interrupt handler.
//! - Timed waits expire in the tick handler, which moves the task to its
//!   ready list whatever it was waiting for; the blocking call then checks
//!   its object to tell a wakeup from a timeout.
//!
//! ## Memory Model
//!
//! - **No heap in the kernel**: all pools are fixed arrays
//! - **Caller-owned stacks**: tasks run on `&'static mut [u32]` regions
//! - **Index-linked lists**: list links live in tables keyed by slot index
//! - **Generational handles**: stale task, mutex and condvar handles are
//!   detected and rejected with `KernelError::Invalid`
//! - **Critical sections**: the `critical-section` crate, backed by PRIMASK
//!   on the target

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod cond;
pub mod config;
pub mod error;
pub mod kernel;
mod log;
pub mod mem;
pub mod mutex;
pub mod queue;
pub mod scheduler;
pub mod sync;
pub mod task;

pub use cond::CondHandle;
pub use error::{KernelError, Result};
pub use kernel::{Kernel, KernelCell};
pub use mutex::MutexHandle;
pub use scheduler::{Pend, Scheduler, Timeout};
pub use task::{TaskAttr, TaskEntry, TaskHandle, TaskInfo, TaskState};

#[cfg(target_arch = "arm")]
pub use kernel::KERNEL;
