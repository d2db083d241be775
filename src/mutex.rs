//! # Mutex
//!
//! Non-recursive mutexes drawn from a fixed pool. Waiters queue FIFO on the
//! mutex's pending list and the unlocking task hands ownership straight to
//! the head waiter, so a woken task never has to compete for the lock again.
//!
//! Locking is two-phase. [`MutexPool::lock`] either takes the lock or parks
//! the caller and requests a switch; once the caller runs again
//! [`MutexPool::lock_resume`] reports whether it was handed the lock or its
//! wait expired.

use crate::arch::Port;
use crate::config::MAX_MUTEXES;
use crate::error::{KernelError, Result};
use crate::log;
use crate::queue::{LinkTable, NodeId};
use crate::scheduler::{Pend, PendList, Scheduler, Timeout};
use crate::task::{TaskHandle, TaskState};

const FREE_HEAD: NodeId = 0;
const POOL_NODES: usize = MAX_MUTEXES + 1;

/// Reference to a mutex in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MutexHandle {
    index: u8,
    generation: u16,
}

#[derive(Debug, Clone, Copy)]
struct MutexSlot {
    in_use: bool,
    generation: u16,
    locked: bool,
    owner: Option<TaskHandle>,
}

impl MutexSlot {
    const FREE: Self = Self {
        in_use: false,
        generation: 0,
        locked: false,
        owner: None,
    };
}

/// Fixed pool of mutexes.
pub struct MutexPool {
    slots: [MutexSlot; MAX_MUTEXES],
    free: LinkTable<POOL_NODES>,
}

impl MutexPool {
    pub fn new() -> Self {
        let mut pool = Self {
            slots: [MutexSlot::FREE; MAX_MUTEXES],
            free: LinkTable::new(),
        };
        pool.reset();
        pool
    }

    /// Return every slot to the free list. Outstanding handles go stale.
    pub fn reset(&mut self) {
        self.free.reset();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.in_use {
                slot.generation = slot.generation.wrapping_add(1);
            }
            slot.in_use = false;
            slot.locked = false;
            slot.owner = None;
            self.free.insert_tail(FREE_HEAD, (i + 1) as NodeId);
        }
    }

    /// Take an unlocked mutex from the pool.
    pub fn create(&mut self) -> Result<MutexHandle> {
        let Some(node) = self.free.first(FREE_HEAD) else {
            log::warning!("no free mutex");
            return Err(KernelError::ResourceExhausted);
        };
        self.free.remove(node);
        let index = node as usize - 1;
        let slot = &mut self.slots[index];
        slot.in_use = true;
        slot.locked = false;
        slot.owner = None;
        Ok(MutexHandle {
            index: index as u8,
            generation: slot.generation,
        })
    }

    /// Return a mutex to the pool. Fails with `Blocking` while it has an
    /// owner.
    pub fn destroy(&mut self, handle: MutexHandle) -> Result<()> {
        let index = self.resolve(handle)?;
        let slot = &mut self.slots[index];
        if slot.owner.is_some() {
            return Err(KernelError::Blocking);
        }
        slot.in_use = false;
        slot.locked = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.insert_tail(FREE_HEAD, (index + 1) as NodeId);
        Ok(())
    }

    /// First phase of a lock.
    ///
    /// Takes a free mutex at once. A locked mutex fails with `Timeout` for an
    /// immediate timeout; otherwise the current task is parked on the pending
    /// list, with a deadline for a finite timeout, and `Pend::Blocked` is
    /// returned.
    pub fn lock<P: Port>(
        &mut self,
        sched: &mut Scheduler<P>,
        handle: MutexHandle,
        timeout: Timeout,
    ) -> Result<Pend> {
        let index = self.resolve(handle)?;
        if sched.in_isr() {
            return Err(KernelError::InterruptContext);
        }
        let me = sched.current_task().ok_or(KernelError::NotStarted)?;

        let slot = &mut self.slots[index];
        if !slot.locked {
            slot.locked = true;
            slot.owner = Some(me);
            return Ok(Pend::Done);
        }
        if timeout.is_immediate() {
            return Err(KernelError::Timeout);
        }

        sched.suspend_current(
            Some(PendList::Mutex(index)),
            timeout.ticks(),
            TaskState::Pending,
        )?;
        sched.schedule();
        Ok(Pend::Blocked)
    }

    /// Second phase of a blocked lock: succeed if ownership was handed to
    /// the caller, otherwise the wait expired.
    pub fn lock_resume<P: Port>(&self, sched: &Scheduler<P>, handle: MutexHandle) -> Result<()> {
        let index = self.resolve(handle)?;
        let owner = self.slots[index].owner;
        if owner.is_some() && owner == sched.current_task() {
            Ok(())
        } else {
            log::debug!("mutex {}: lock timed out", index);
            Err(KernelError::Timeout)
        }
    }

    /// Release a mutex held by the current task, handing it to the oldest
    /// waiter if there is one.
    pub fn unlock<P: Port>(&mut self, sched: &mut Scheduler<P>, handle: MutexHandle) -> Result<()> {
        let index = self.resolve(handle)?;
        let slot = &mut self.slots[index];
        if !slot.locked {
            return Err(KernelError::Unlocked);
        }
        if slot.owner != sched.current_task() {
            return Err(KernelError::PermissionDenied);
        }

        match sched.first_pending(PendList::Mutex(index)) {
            None => {
                slot.locked = false;
                slot.owner = None;
            }
            Some(waiter) => {
                sched.wake(waiter);
                slot.owner = Some(sched.handle_of(waiter));
                sched.schedule();
            }
        }
        Ok(())
    }

    pub fn is_locked(&self, handle: MutexHandle) -> Result<bool> {
        self.resolve(handle).map(|i| self.slots[i].locked)
    }

    pub fn owner(&self, handle: MutexHandle) -> Result<Option<TaskHandle>> {
        self.resolve(handle).map(|i| self.slots[i].owner)
    }

    fn resolve(&self, handle: MutexHandle) -> Result<usize> {
        let index = handle.index as usize;
        match self.slots.get(index) {
            Some(slot) if slot.in_use && slot.generation == handle.generation => Ok(index),
            _ => Err(KernelError::Invalid),
        }
    }
}

impl Default for MutexPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::test_port::{booted, spawn, TestPort};

    fn started() -> (Scheduler<TestPort>, MutexPool) {
        let mut s = booted();
        s.start().unwrap();
        (s, MutexPool::new())
    }

    /// Spawn a task that preempts, runs `lock` and blocks on `m`.
    fn block_on(
        s: &mut Scheduler<TestPort>,
        pool: &mut MutexPool,
        m: MutexHandle,
        name: &'static str,
        prio: u8,
    ) -> TaskHandle {
        let t = spawn(s, name, prio);
        s.dispatch();
        assert_eq!(s.current_task(), Some(t));
        assert_eq!(pool.lock(s, m, Timeout::Forever), Ok(Pend::Blocked));
        assert_eq!(s.task_state(t), TaskState::Pending);
        s.dispatch();
        t
    }

    #[test]
    fn test_lock_unlock_restores_free_state() {
        let (mut s, mut pool) = started();
        let m = pool.create().unwrap();
        let idle = s.current_task();

        assert_eq!(pool.lock(&mut s, m, Timeout::Forever), Ok(Pend::Done));
        assert_eq!(pool.owner(m), Ok(idle));
        assert_eq!(pool.is_locked(m), Ok(true));

        pool.unlock(&mut s, m).unwrap();
        assert_eq!(pool.owner(m), Ok(None));
        assert_eq!(pool.is_locked(m), Ok(false));
    }

    #[test]
    fn test_try_lock_immediate_fails_when_held() {
        let (mut s, mut pool) = started();
        let m = pool.create().unwrap();
        pool.lock(&mut s, m, Timeout::Forever).unwrap();

        let other = spawn(&mut s, "other", 4);
        s.dispatch();
        assert_eq!(pool.lock(&mut s, m, Timeout::Immediate), Err(KernelError::Timeout));
        assert_eq!(pool.lock(&mut s, m, Timeout::Millis(0)), Err(KernelError::Timeout));
        assert_eq!(s.task_state(other), TaskState::Running);
        assert_ne!(pool.owner(m), Ok(Some(other)));
    }

    #[test]
    fn test_unlock_errors() {
        let (mut s, mut pool) = started();
        let m = pool.create().unwrap();
        assert_eq!(pool.unlock(&mut s, m), Err(KernelError::Unlocked));

        pool.lock(&mut s, m, Timeout::Forever).unwrap();
        spawn(&mut s, "intruder", 3);
        s.dispatch();
        assert_eq!(pool.unlock(&mut s, m), Err(KernelError::PermissionDenied));
        assert_eq!(pool.is_locked(m), Ok(true));
    }

    #[test]
    fn test_unlock_hands_off_in_fifo_order() {
        let (mut s, mut pool) = started();
        let m = pool.create().unwrap();

        let holder = spawn(&mut s, "holder", 7);
        s.dispatch();
        pool.lock(&mut s, m, Timeout::Forever).unwrap();
        s.sleep(10);
        s.dispatch();

        // Lowest priority queues first
        let w1 = block_on(&mut s, &mut pool, m, "w1", 1);
        let w2 = block_on(&mut s, &mut pool, m, "w2", 2);
        let w3 = block_on(&mut s, &mut pool, m, "w3", 3);

        for _ in 0..10 {
            s.tick();
        }
        s.schedule();
        s.dispatch();
        assert_eq!(s.current_task(), Some(holder));

        pool.unlock(&mut s, m).unwrap();
        assert_eq!(pool.owner(m), Ok(Some(w1)));
        assert_eq!(s.task_state(w1), TaskState::Ready);
        assert_eq!(s.task_state(w2), TaskState::Pending);
        assert_eq!(s.task_state(w3), TaskState::Pending);

        // w1 is the only ready task below the holder
        s.sleep(10);
        s.dispatch();
        assert_eq!(s.current_task(), Some(w1));
        assert_eq!(pool.lock_resume(&s, m), Ok(()));

        pool.unlock(&mut s, m).unwrap();
        assert_eq!(pool.owner(m), Ok(Some(w2)));
        s.dispatch();
        assert_eq!(s.current_task(), Some(w2));
        assert_eq!(pool.lock_resume(&s, m), Ok(()));

        pool.unlock(&mut s, m).unwrap();
        assert_eq!(pool.owner(m), Ok(Some(w3)));
    }

    #[test]
    fn test_deleted_waiter_is_skipped_by_handoff() {
        let (mut s, mut pool) = started();
        let m = pool.create().unwrap();

        let holder = spawn(&mut s, "holder", 7);
        s.dispatch();
        pool.lock(&mut s, m, Timeout::Forever).unwrap();
        s.sleep(10);
        s.dispatch();

        // A timed waiter sits on both the pending and the timed-wait list
        let timed = spawn(&mut s, "timed", 1);
        s.dispatch();
        assert_eq!(pool.lock(&mut s, m, Timeout::Millis(50)), Ok(Pend::Blocked));
        s.dispatch();
        let w2 = block_on(&mut s, &mut pool, m, "w2", 2);

        s.delete_task(timed).unwrap();
        assert_eq!(s.task_state(timed), TaskState::Stopped);
        s.assert_ready_mask_consistent();

        for _ in 0..10 {
            s.tick();
        }
        s.schedule();
        s.dispatch();
        assert_eq!(s.current_task(), Some(holder));
        pool.unlock(&mut s, m).unwrap();
        assert_eq!(pool.owner(m), Ok(Some(w2)));

        // Fill the pool so the freed record is reused; it is neither
        // pending nor timed
        let mut reused = None;
        for _ in 0..s.free_slots() {
            let h = spawn(&mut s, "fresh", 1);
            if h.slot() == timed.slot() {
                reused = Some(h);
            }
        }
        let reused = reused.unwrap();
        for _ in 0..60 {
            s.tick();
        }
        assert_eq!(s.task_state(reused), TaskState::Ready);

        s.sleep(100);
        s.dispatch();
        assert_eq!(s.current_task(), Some(w2));
        assert_eq!(pool.lock_resume(&s, m), Ok(()));
        pool.unlock(&mut s, m).unwrap();
        assert_eq!(pool.is_locked(m), Ok(false));
        assert_eq!(pool.owner(m), Ok(None));
    }

    #[test]
    fn test_lock_timeout_expires() {
        let (mut s, mut pool) = started();
        let m = pool.create().unwrap();

        let holder = spawn(&mut s, "holder", 2);
        s.dispatch();
        pool.lock(&mut s, m, Timeout::Forever).unwrap();

        let waiter = spawn(&mut s, "waiter", 5);
        s.dispatch();
        assert_eq!(pool.lock(&mut s, m, Timeout::Millis(3)), Ok(Pend::Blocked));
        s.dispatch();
        assert_eq!(s.current_task(), Some(holder));

        s.tick();
        s.tick();
        assert_eq!(s.task_state(waiter), TaskState::Pending);
        s.tick();
        assert_eq!(s.task_state(waiter), TaskState::Ready);

        s.schedule();
        s.dispatch();
        assert_eq!(s.current_task(), Some(waiter));
        assert_eq!(pool.lock_resume(&s, m), Err(KernelError::Timeout));
        assert_eq!(pool.owner(m), Ok(Some(holder)));
    }

    #[test]
    fn test_expired_waiter_is_not_handed_the_lock() {
        let (mut s, mut pool) = started();
        let m = pool.create().unwrap();

        let holder = spawn(&mut s, "holder", 2);
        s.dispatch();
        pool.lock(&mut s, m, Timeout::Forever).unwrap();
        spawn(&mut s, "waiter", 5);
        s.dispatch();
        pool.lock(&mut s, m, Timeout::Millis(1)).unwrap();
        s.dispatch();

        s.tick();
        // Holder still running: the waiter left the pending list on expiry
        assert_eq!(s.current_task(), Some(holder));
        pool.unlock(&mut s, m).unwrap();
        assert_eq!(pool.is_locked(m), Ok(false));
    }

    #[test]
    fn test_forever_wait_ignores_ticks() {
        let (mut s, mut pool) = started();
        let m = pool.create().unwrap();
        pool.lock(&mut s, m, Timeout::Forever).unwrap();
        let w = block_on(&mut s, &mut pool, m, "w", 4);
        for _ in 0..1000 {
            s.tick();
        }
        assert_eq!(s.task_state(w), TaskState::Pending);
    }

    #[test]
    fn test_lock_rejected_in_isr() {
        let (mut s, mut pool) = started();
        let m = pool.create().unwrap();
        s.enter_isr();
        assert_eq!(
            pool.lock(&mut s, m, Timeout::Forever),
            Err(KernelError::InterruptContext)
        );
        s.exit_isr();
    }

    #[test]
    fn test_destroy_rules() {
        let (mut s, mut pool) = started();
        let m = pool.create().unwrap();
        pool.lock(&mut s, m, Timeout::Forever).unwrap();
        assert_eq!(pool.destroy(m), Err(KernelError::Blocking));

        pool.unlock(&mut s, m).unwrap();
        pool.destroy(m).unwrap();
        assert_eq!(pool.lock(&mut s, m, Timeout::Forever), Err(KernelError::Invalid));
        assert_eq!(pool.destroy(m), Err(KernelError::Invalid));
    }

    #[test]
    fn test_pool_capacity_and_reuse() {
        let mut pool = MutexPool::new();
        let handles: std::vec::Vec<_> = (0..MAX_MUTEXES).map(|_| pool.create().unwrap()).collect();
        assert_eq!(pool.create(), Err(KernelError::ResourceExhausted));

        pool.destroy(handles[3]).unwrap();
        let reused = pool.create().unwrap();
        assert_ne!(reused, handles[3]);
        assert_eq!(pool.is_locked(reused), Ok(false));
        assert_eq!(pool.is_locked(handles[3]), Err(KernelError::Invalid));
    }
}
