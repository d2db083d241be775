//! # Kernel
//!
//! Top-level kernel object and public API for TOS.
//!
//! [`Kernel`] owns the scheduler and the mutex and condition variable pools
//! and exposes each blocking operation as separate phases. [`KernelCell`]
//! wraps one kernel for shared use by tasks and interrupt handlers: every
//! phase runs in its own critical section, so a switch requested by one
//! phase takes effect before the next one starts.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► KERNEL.init(port, idle_stack)  ← reset run state, create idle task
//!         ├─► KERNEL.create_task() (×N)      ← register tasks
//!         ├─► KERNEL.mutex_create() / cond_create()
//!         └─► KERNEL.start()                 ← never returns
//!               ├─► select highest-priority task
//!               ├─► start SysTick, set exception priorities
//!               └─► Port::start_first()
//! ```

use core::cell::RefCell;

use critical_section::Mutex;

use crate::arch::Port;
use crate::cond::{CondHandle, CondPool, Ticket};
use crate::config::TASK_POOL_SIZE;
use crate::error::{KernelError, Result};
use crate::log;
use crate::mutex::{MutexHandle, MutexPool};
use crate::scheduler::{Pend, Scheduler, Timeout};
use crate::sync::critical_section;
use crate::task::{TaskAttr, TaskEntry, TaskHandle, TaskInfo, TaskState};

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// Scheduler plus synchronization object pools.
pub struct Kernel<P: Port> {
    sched: Scheduler<P>,
    mutexes: MutexPool,
    conds: CondPool,
}

impl<P: Port> Kernel<P> {
    pub fn new(port: P) -> Self {
        Self {
            sched: Scheduler::new(port),
            mutexes: MutexPool::new(),
            conds: CondPool::new(),
        }
    }

    /// Reset the pools and the scheduler and create the idle task.
    pub fn init(&mut self, idle_stack: &'static mut [u32]) -> Result<TaskHandle> {
        self.mutexes.reset();
        self.conds.reset();
        self.sched.init(idle_stack)
    }

    pub fn scheduler(&self) -> &Scheduler<P> {
        &self.sched
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler<P> {
        &mut self.sched
    }

    pub fn mutexes(&self) -> &MutexPool {
        &self.mutexes
    }

    pub fn conds(&self) -> &CondPool {
        &self.conds
    }

    // -----------------------------------------------------------------------
    // Mutex
    // -----------------------------------------------------------------------

    pub fn mutex_create(&mut self) -> Result<MutexHandle> {
        self.mutexes.create()
    }

    pub fn mutex_destroy(&mut self, m: MutexHandle) -> Result<()> {
        self.mutexes.destroy(m)
    }

    pub fn mutex_lock(&mut self, m: MutexHandle, timeout: Timeout) -> Result<Pend> {
        self.mutexes.lock(&mut self.sched, m, timeout)
    }

    pub fn mutex_lock_resume(&self, m: MutexHandle) -> Result<()> {
        self.mutexes.lock_resume(&self.sched, m)
    }

    pub fn mutex_unlock(&mut self, m: MutexHandle) -> Result<()> {
        self.mutexes.unlock(&mut self.sched, m)
    }

    // -----------------------------------------------------------------------
    // Condition variable
    // -----------------------------------------------------------------------

    pub fn cond_create(&mut self) -> Result<CondHandle> {
        self.conds.create()
    }

    pub fn cond_destroy(&mut self, c: CondHandle) -> Result<()> {
        self.conds.destroy(c)
    }

    pub fn cond_signal(&mut self, c: CondHandle) -> Result<()> {
        self.conds.signal(&mut self.sched, c)
    }

    pub fn cond_broadcast(&mut self, c: CondHandle) -> Result<()> {
        self.conds.broadcast(&mut self.sched, c)
    }

    /// First phase of a wait: take a ticket and release `m`.
    ///
    /// If the release fails (the caller does not hold `m`) the wait is
    /// abandoned and the error returned.
    pub fn cond_wait_enter(&mut self, c: CondHandle, m: MutexHandle) -> Result<Ticket> {
        let ticket = self.conds.wait_enter(&self.sched, c)?;
        if let Err(e) = self.mutexes.unlock(&mut self.sched, m) {
            self.conds.wait_abort(c);
            return Err(e);
        }
        Ok(ticket)
    }

    pub fn cond_wait_block(&mut self, c: CondHandle, ticket: Ticket, timeout: Timeout) -> Result<Pend> {
        self.conds.wait_block(&mut self.sched, c, ticket, timeout)
    }

    pub fn cond_wait_resume(&mut self, c: CondHandle, ticket: Ticket) -> Result<()> {
        self.conds.wait_resume(c, ticket)
    }
}

// ---------------------------------------------------------------------------
// Shared kernel
// ---------------------------------------------------------------------------

/// A kernel shared between tasks and interrupt handlers.
///
/// Every call enters a critical section. Before [`KernelCell::init`] all
/// fallible calls return `NotStarted`.
pub struct KernelCell<P: Port> {
    inner: Mutex<RefCell<Option<Kernel<P>>>>,
}

impl<P: Port> KernelCell<P> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(None)),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Kernel<P>) -> Result<R>) -> Result<R> {
        critical_section(|cs| match self.inner.borrow_ref_mut(cs).as_mut() {
            Some(kernel) => f(kernel),
            None => Err(KernelError::NotStarted),
        })
    }

    /// Run `f` against the kernel, if initialized. `f` must not call back
    /// into the cell.
    fn inspect<R>(&self, f: impl FnOnce(&Kernel<P>) -> R) -> Option<R> {
        critical_section(|cs| self.inner.borrow_ref(cs).as_ref().map(f))
    }

    /// Build the kernel around `port` and create the idle task.
    pub fn init(&self, port: P, idle_stack: &'static mut [u32]) -> Result<TaskHandle> {
        critical_section(|cs| {
            let mut slot = self.inner.borrow_ref_mut(cs);
            slot.insert(Kernel::new(port)).init(idle_stack)
        })
    }

    /// Start scheduling. Never returns.
    ///
    /// # Panics
    /// If the kernel was not initialized.
    pub fn start(&self) -> ! {
        // Interrupts stay masked until the first task is running
        let error = critical_section(|cs| {
            let started = match self.inner.borrow_ref_mut(cs).as_mut() {
                Some(kernel) => kernel.sched.start(),
                None => Err(KernelError::NotStarted),
            };
            match started {
                // Safety: the stack pointer comes from `init_stack_frame`.
                Ok(sp) => unsafe { P::start_first(sp) },
                Err(e) => e,
            }
        });
        log::error!("kernel start failed: {}", error);
        panic!("kernel start failed: {}", error);
    }

    pub fn start_clock(&self) -> Result<()> {
        self.with(|k| {
            k.sched.start_clock();
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub fn create_task(&self, entry: TaskEntry, arg: usize, attr: TaskAttr) -> Result<TaskHandle> {
        self.with(|k| k.sched.create_task(entry, arg, attr))
    }

    pub fn delete_task(&self, task: TaskHandle) -> Result<()> {
        self.with(|k| k.sched.delete_task(task))
    }

    pub fn set_priority(&self, task: TaskHandle, priority: u8) -> Result<u8> {
        self.with(|k| k.sched.set_priority(task, priority))
    }

    pub fn priority(&self, task: TaskHandle) -> Result<u8> {
        self.with(|k| k.sched.priority(task))
    }

    pub fn task_state(&self, task: TaskHandle) -> TaskState {
        self.inspect(|k| k.sched.task_state(task))
            .unwrap_or(TaskState::Stopped)
    }

    pub fn task_info(&self, task: TaskHandle) -> Result<TaskInfo> {
        self.with(|k| k.sched.task_info(task))
    }

    /// Call `f` with a snapshot of every live task, in creation order.
    ///
    /// The snapshots are taken in one critical section and `f` runs after it
    /// ends, so `f` may call back into the kernel.
    pub fn for_each_task(&self, mut f: impl FnMut(TaskInfo)) {
        let mut snapshot: [Option<TaskInfo>; TASK_POOL_SIZE] = [None; TASK_POOL_SIZE];
        self.inspect(|k| {
            let infos = k.sched.tasks().filter_map(|task| k.sched.task_info(task).ok());
            for (slot, info) in snapshot.iter_mut().zip(infos) {
                *slot = Some(info);
            }
        });
        snapshot.into_iter().flatten().for_each(&mut f);
    }

    pub fn current_task(&self) -> Option<TaskHandle> {
        self.inspect(|k| k.sched.current_task()).flatten()
    }

    pub fn is_running(&self) -> bool {
        self.inspect(|k| k.sched.is_running()).unwrap_or(false)
    }

    pub fn tick_count(&self) -> u32 {
        self.inspect(|k| k.sched.tick_count()).unwrap_or(0)
    }

    /// Sleep for `ms` milliseconds, at least one tick.
    pub fn sleep_ms(&self, ms: u32) {
        let _ = self.with(|k| {
            k.sched.sleep(ms);
            Ok(())
        });
    }

    pub fn yield_now(&self) {
        let _ = self.with(|k| {
            k.sched.yield_now();
            Ok(())
        });
    }

    pub fn schedule_enable(&self) {
        let _ = self.with(|k| {
            k.sched.schedule_enable();
            k.sched.schedule();
            Ok(())
        });
    }

    pub fn schedule_disable(&self) {
        let _ = self.with(|k| {
            k.sched.schedule_disable();
            Ok(())
        });
    }

    // -----------------------------------------------------------------------
    // Interrupt entry points
    // -----------------------------------------------------------------------

    pub fn enter_isr(&self) {
        let _ = self.with(|k| {
            k.sched.enter_isr();
            Ok(())
        });
    }

    pub fn exit_isr(&self) {
        let _ = self.with(|k| {
            k.sched.exit_isr();
            Ok(())
        });
    }

    pub fn tick(&self) {
        let _ = self.with(|k| {
            k.sched.tick();
            Ok(())
        });
    }

    /// Complete a context switch; see [`Scheduler::switch_in`].
    pub fn switch_in(&self, saved_sp: *mut u32) -> *mut u32 {
        self.with(|k| Ok(k.sched.switch_in(saved_sp)))
            .unwrap_or(saved_sp)
    }

    // -----------------------------------------------------------------------
    // Mutex
    // -----------------------------------------------------------------------

    pub fn mutex_create(&self) -> Result<MutexHandle> {
        self.with(|k| k.mutex_create())
    }

    pub fn mutex_destroy(&self, m: MutexHandle) -> Result<()> {
        self.with(|k| k.mutex_destroy(m))
    }

    /// Lock `m`, waiting as long as it takes.
    pub fn mutex_lock(&self, m: MutexHandle) -> Result<()> {
        self.mutex_try_lock(m, Timeout::Forever)
    }

    /// Lock `m`, giving up after `timeout`.
    pub fn mutex_try_lock(&self, m: MutexHandle, timeout: Timeout) -> Result<()> {
        match self.with(|k| k.mutex_lock(m, timeout))? {
            Pend::Done => Ok(()),
            Pend::Blocked => self.with(|k| k.mutex_lock_resume(m)),
        }
    }

    pub fn mutex_unlock(&self, m: MutexHandle) -> Result<()> {
        self.with(|k| k.mutex_unlock(m))
    }

    // -----------------------------------------------------------------------
    // Condition variable
    // -----------------------------------------------------------------------

    pub fn cond_create(&self) -> Result<CondHandle> {
        self.with(|k| k.cond_create())
    }

    pub fn cond_destroy(&self, c: CondHandle) -> Result<()> {
        self.with(|k| k.cond_destroy(c))
    }

    pub fn cond_signal(&self, c: CondHandle) -> Result<()> {
        self.with(|k| k.cond_signal(c))
    }

    pub fn cond_broadcast(&self, c: CondHandle) -> Result<()> {
        self.with(|k| k.cond_broadcast(c))
    }

    /// Release `m`, wait for a notification on `c`, then re-acquire `m`.
    pub fn cond_wait(&self, c: CondHandle, m: MutexHandle) -> Result<()> {
        self.cond_wait_for(c, m, Timeout::Forever)
    }

    /// Like [`KernelCell::cond_wait`] with a deadline.
    ///
    /// On `Timeout` the mutex is *not* re-acquired.
    pub fn cond_wait_for(&self, c: CondHandle, m: MutexHandle, timeout: Timeout) -> Result<()> {
        let ticket = self.with(|k| k.cond_wait_enter(c, m))?;
        // Unlocking may have handed `m` to a waiter that preempts us here
        match self.with(|k| k.cond_wait_block(c, ticket, timeout))? {
            Pend::Done => {}
            Pend::Blocked => self.with(|k| k.cond_wait_resume(c, ticket))?,
        }
        self.mutex_lock(m)
    }
}

impl<P: Port> Default for KernelCell<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel instance used by the Cortex-M exception handlers.
#[cfg(target_arch = "arm")]
pub static KERNEL: KernelCell<crate::arch::cortex_m::CortexM> = KernelCell::new();

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::test_port::{noop_task, stack, TestPort};
    use crate::config::{IDLE_STACK_WORDS, MAX_CONDS, MAX_MUTEXES};

    fn kernel() -> Kernel<TestPort> {
        let mut k = Kernel::new(TestPort::default());
        k.init(stack(IDLE_STACK_WORDS)).unwrap();
        k.scheduler_mut().start().unwrap();
        k
    }

    fn spawn(k: &mut Kernel<TestPort>, name: &'static str, prio: u8) -> TaskHandle {
        k.scheduler_mut()
            .create_task(noop_task, 0, TaskAttr::new(name, prio, stack(64)))
            .unwrap()
    }

    fn dispatch(k: &mut Kernel<TestPort>) {
        k.scheduler_mut().dispatch();
    }

    fn current(k: &Kernel<TestPort>) -> Option<TaskHandle> {
        k.scheduler().current_task()
    }

    #[test]
    fn test_producer_consumer_handshake() {
        let mut k = kernel();
        let m = k.mutex_create().unwrap();
        let c = k.cond_create().unwrap();

        let producer = spawn(&mut k, "producer", 2);
        dispatch(&mut k);
        k.scheduler_mut().sleep(5);
        dispatch(&mut k);

        let consumer = spawn(&mut k, "consumer", 3);
        dispatch(&mut k);
        assert_eq!(k.mutex_lock(m, Timeout::Forever), Ok(Pend::Done));
        let ticket = k.cond_wait_enter(c, m).unwrap();
        assert_eq!(k.mutexes().owner(m), Ok(None));
        assert_eq!(k.cond_wait_block(c, ticket, Timeout::Forever), Ok(Pend::Blocked));
        dispatch(&mut k);

        for _ in 0..5 {
            k.scheduler_mut().tick();
        }
        k.scheduler_mut().schedule();
        dispatch(&mut k);
        assert_eq!(current(&k), Some(producer));

        assert_eq!(k.mutex_lock(m, Timeout::Forever), Ok(Pend::Done));
        k.cond_signal(c).unwrap();
        dispatch(&mut k);
        assert_eq!(current(&k), Some(consumer));
        assert_eq!(k.cond_wait_resume(c, ticket), Ok(()));

        // Re-acquire: the producer still holds the mutex
        assert_eq!(k.mutex_lock(m, Timeout::Forever), Ok(Pend::Blocked));
        dispatch(&mut k);
        assert_eq!(current(&k), Some(producer));
        k.mutex_unlock(m).unwrap();
        dispatch(&mut k);
        assert_eq!(current(&k), Some(consumer));
        assert_eq!(k.mutex_lock_resume(m), Ok(()));
        assert_eq!(k.conds().use_count(c), Ok(0));
    }

    #[test]
    fn test_notification_during_unlock_handoff_is_not_lost() {
        let mut k = kernel();
        let m = k.mutex_create().unwrap();
        let c = k.cond_create().unwrap();

        let consumer = spawn(&mut k, "consumer", 3);
        dispatch(&mut k);
        k.mutex_lock(m, Timeout::Forever).unwrap();

        // A higher-priority producer queues on the mutex
        let producer = spawn(&mut k, "producer", 5);
        dispatch(&mut k);
        assert_eq!(k.mutex_lock(m, Timeout::Forever), Ok(Pend::Blocked));
        dispatch(&mut k);
        assert_eq!(current(&k), Some(consumer));

        // Releasing the mutex hands it over and lets the producer run first
        let ticket = k.cond_wait_enter(c, m).unwrap();
        dispatch(&mut k);
        assert_eq!(current(&k), Some(producer));
        assert_eq!(k.mutex_lock_resume(m), Ok(()));
        k.cond_signal(c).unwrap();
        k.mutex_unlock(m).unwrap();
        k.scheduler_mut().sleep(10);
        dispatch(&mut k);

        // The consumer must not block on a notification it already missed
        assert_eq!(current(&k), Some(consumer));
        assert_eq!(k.cond_wait_block(c, ticket, Timeout::Forever), Ok(Pend::Done));
        assert_eq!(k.mutex_lock(m, Timeout::Forever), Ok(Pend::Done));
    }

    #[test]
    fn test_wait_without_holding_mutex_fails_cleanly() {
        let mut k = kernel();
        let m = k.mutex_create().unwrap();
        let c = k.cond_create().unwrap();

        assert_eq!(k.cond_wait_enter(c, m), Err(KernelError::Unlocked));
        assert_eq!(k.conds().use_count(c), Ok(0));
        k.cond_destroy(c).unwrap();
    }

    #[test]
    fn test_timed_wait_returns_timeout_after_deadline() {
        let mut k = kernel();
        let m = k.mutex_create().unwrap();
        let c = k.cond_create().unwrap();
        let waiter = spawn(&mut k, "waiter", 4);
        dispatch(&mut k);

        k.mutex_lock(m, Timeout::Forever).unwrap();
        let ticket = k.cond_wait_enter(c, m).unwrap();
        assert_eq!(k.cond_wait_block(c, ticket, Timeout::Millis(3)), Ok(Pend::Blocked));
        dispatch(&mut k);

        for _ in 0..2 {
            k.scheduler_mut().tick();
        }
        assert_eq!(k.scheduler().task_state(waiter), TaskState::Pending);
        k.scheduler_mut().tick();
        k.scheduler_mut().schedule();
        dispatch(&mut k);
        assert_eq!(current(&k), Some(waiter));
        assert_eq!(k.cond_wait_resume(c, ticket), Err(KernelError::Timeout));
        assert_eq!(k.mutexes().is_locked(m), Ok(false));
    }

    #[test]
    fn test_init_invalidates_objects() {
        let mut k = kernel();
        let m = k.mutex_create().unwrap();
        let c = k.cond_create().unwrap();
        k.init(stack(IDLE_STACK_WORDS)).unwrap();
        assert_eq!(k.mutex_destroy(m), Err(KernelError::Invalid));
        assert_eq!(k.cond_signal(c), Err(KernelError::Invalid));

        for _ in 0..MAX_MUTEXES {
            k.mutex_create().unwrap();
        }
        for _ in 0..MAX_CONDS {
            k.cond_create().unwrap();
        }
    }

    #[test]
    fn test_cell_requires_init() {
        let cell: KernelCell<TestPort> = KernelCell::new();
        assert_eq!(cell.mutex_create(), Err(KernelError::NotStarted));
        assert!(!cell.is_running());
        assert_eq!(cell.current_task(), None);
        assert_eq!(cell.switch_in(core::ptr::null_mut()), core::ptr::null_mut());
    }

    #[test]
    #[should_panic(expected = "kernel start failed")]
    fn test_cell_start_without_init_panics() {
        let cell: KernelCell<TestPort> = KernelCell::new();
        cell.start();
    }

    #[test]
    fn test_cell_task_and_object_management() {
        let cell: KernelCell<TestPort> = KernelCell::new();
        cell.init(TestPort::default(), stack(IDLE_STACK_WORDS)).unwrap();

        let t = cell
            .create_task(noop_task, 7, TaskAttr::new("worker", 3, stack(64)))
            .unwrap();
        assert_eq!(cell.task_state(t), TaskState::Ready);
        assert_eq!(cell.set_priority(t, 4), Ok(3));
        assert_eq!(cell.priority(t), Ok(4));

        let mut names = std::vec::Vec::new();
        cell.for_each_task(|info| names.push(info.name));
        assert_eq!(names, ["idle", "worker"]);

        // Not started: the idle context is not current, locking is refused
        let m = cell.mutex_create().unwrap();
        assert_eq!(cell.mutex_lock(m), Err(KernelError::NotStarted));
        cell.mutex_destroy(m).unwrap();

        let c = cell.cond_create().unwrap();
        cell.cond_broadcast(c).unwrap();
        cell.cond_destroy(c).unwrap();

        cell.delete_task(t).unwrap();
        assert_eq!(cell.task_state(t), TaskState::Stopped);
        assert_eq!(
            cell.inspect(|k| k.scheduler().task_count()),
            Some(1)
        );
    }

    #[test]
    fn test_for_each_task_callback_may_reenter_cell() {
        let cell: KernelCell<TestPort> = KernelCell::new();
        cell.init(TestPort::default(), stack(IDLE_STACK_WORDS)).unwrap();
        let t = cell
            .create_task(noop_task, 0, TaskAttr::new("worker", 2, stack(64)))
            .unwrap();
        let m = cell.mutex_create().unwrap();

        let mut seen = 0;
        cell.for_each_task(|_info| {
            seen += 1;
            assert_eq!(cell.task_info(t).map(|i| i.name), Ok("worker"));
            assert_eq!(cell.task_state(t), TaskState::Ready);
            assert_eq!(cell.priority(t), Ok(2));
            assert_eq!(cell.mutex_unlock(m), Err(KernelError::Unlocked));
            assert!(!cell.is_running());
        });
        assert_eq!(seen, 2);
        assert_eq!(cell.set_priority(t, 3), Ok(2));
    }

    #[test]
    fn test_cell_uncontended_lock_and_isr_bracketing() {
        let cell: KernelCell<TestPort> = KernelCell::new();
        cell.init(TestPort::default(), stack(IDLE_STACK_WORDS)).unwrap();
        critical_section(|cs| {
            if let Some(k) = cell.inner.borrow_ref_mut(cs).as_mut() {
                k.scheduler_mut().start().unwrap();
            }
        });
        assert!(cell.is_running());

        let m = cell.mutex_create().unwrap();
        cell.mutex_lock(m).unwrap();
        assert_eq!(cell.mutex_try_lock(m, Timeout::Immediate), Err(KernelError::Timeout));
        cell.mutex_unlock(m).unwrap();

        cell.enter_isr();
        cell.tick();
        assert_eq!(cell.mutex_lock(m), Err(KernelError::InterruptContext));
        cell.exit_isr();
        assert_eq!(cell.tick_count(), 1);
    }
}
