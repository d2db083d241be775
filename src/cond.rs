//! # Condition Variable
//!
//! Condition variables drawn from a fixed pool. Each one carries a 16-bit
//! sequence number bumped by every `signal` and `broadcast`. A waiter reads
//! the sequence (its *ticket*) before releasing the mutex and compares it
//! again before and after blocking: a notification that lands between the
//! release and the block is seen as an advanced sequence and the waiter does
//! not block at all.
//!
//! A wait runs in phases, each inside its own critical section:
//!
//! ```text
//!   wait_enter ──► (mutex unlock) ──► wait_block ──Done──────────────► relock
//!                                          │
//!                                          └─Blocked─► switch ─► wait_resume ─► relock
//! ```
//!
//! `use_count` counts tasks between `wait_enter` and the end of the wait and
//! keeps the variable from being destroyed under them.

use crate::arch::Port;
use crate::config::MAX_CONDS;
use crate::error::{KernelError, Result};
use crate::log;
use crate::queue::{LinkTable, NodeId};
use crate::scheduler::{Pend, PendList, Scheduler, Timeout};
use crate::task::TaskState;

const FREE_HEAD: NodeId = 0;
const POOL_NODES: usize = MAX_CONDS + 1;

/// Reference to a condition variable in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CondHandle {
    index: u8,
    generation: u16,
}

/// Sequence number observed by a waiter when it entered the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ticket(u16);

#[derive(Debug, Clone, Copy)]
struct CondSlot {
    in_use: bool,
    generation: u16,
    sequence: u16,
    use_count: u16,
}

impl CondSlot {
    const FREE: Self = Self {
        in_use: false,
        generation: 0,
        sequence: 0,
        use_count: 0,
    };
}

/// Fixed pool of condition variables.
pub struct CondPool {
    slots: [CondSlot; MAX_CONDS],
    free: LinkTable<POOL_NODES>,
}

impl CondPool {
    pub fn new() -> Self {
        let mut pool = Self {
            slots: [CondSlot::FREE; MAX_CONDS],
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
            slot.use_count = 0;
            self.free.insert_tail(FREE_HEAD, (i + 1) as NodeId);
        }
    }

    pub fn create(&mut self) -> Result<CondHandle> {
        let Some(node) = self.free.first(FREE_HEAD) else {
            log::warning!("no free condition variable");
            return Err(KernelError::ResourceExhausted);
        };
        self.free.remove(node);
        let index = node as usize - 1;
        let slot = &mut self.slots[index];
        slot.in_use = true;
        slot.sequence = 0;
        slot.use_count = 0;
        Ok(CondHandle {
            index: index as u8,
            generation: slot.generation,
        })
    }

    /// Return a condition variable to the pool. Fails with `Blocking` while
    /// any task is inside a wait on it.
    pub fn destroy(&mut self, handle: CondHandle) -> Result<()> {
        let index = self.resolve(handle)?;
        let slot = &mut self.slots[index];
        if slot.use_count > 0 {
            return Err(KernelError::Blocking);
        }
        slot.in_use = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.insert_tail(FREE_HEAD, (index + 1) as NodeId);
        Ok(())
    }

    /// Start a wait: take a ticket and count the caller as a user.
    pub fn wait_enter<P: Port>(&mut self, sched: &Scheduler<P>, handle: CondHandle) -> Result<Ticket> {
        let index = self.resolve(handle)?;
        if sched.in_isr() {
            return Err(KernelError::InterruptContext);
        }
        if sched.current_task().is_none() {
            return Err(KernelError::NotStarted);
        }
        let slot = &mut self.slots[index];
        slot.use_count += 1;
        Ok(Ticket(slot.sequence))
    }

    /// Leave a wait that failed before blocking, e.g. because the caller did
    /// not hold the mutex.
    pub fn wait_abort(&mut self, handle: CondHandle) {
        if let Ok(index) = self.resolve(handle) {
            let slot = &mut self.slots[index];
            slot.use_count = slot.use_count.saturating_sub(1);
        }
    }

    /// Block unless a notification arrived since `ticket` was taken.
    ///
    /// Returns `Pend::Done` if the sequence already moved, `Timeout` for an
    /// immediate timeout, and `Pend::Blocked` after parking the caller on
    /// the waiting list.
    pub fn wait_block<P: Port>(
        &mut self,
        sched: &mut Scheduler<P>,
        handle: CondHandle,
        ticket: Ticket,
        timeout: Timeout,
    ) -> Result<Pend> {
        let index = self.resolve(handle)?;
        let slot = &mut self.slots[index];

        if slot.sequence != ticket.0 {
            slot.use_count = slot.use_count.saturating_sub(1);
            return Ok(Pend::Done);
        }
        if timeout.is_immediate() {
            slot.use_count = slot.use_count.saturating_sub(1);
            return Err(KernelError::Timeout);
        }

        if let Err(e) = sched.suspend_current(
            Some(PendList::Cond(index)),
            timeout.ticks(),
            TaskState::Pending,
        ) {
            slot.use_count = slot.use_count.saturating_sub(1);
            return Err(e);
        }
        sched.schedule();
        Ok(Pend::Blocked)
    }

    /// Finish a blocked wait: success if the sequence moved past `ticket`,
    /// otherwise the deadline expired.
    pub fn wait_resume(&mut self, handle: CondHandle, ticket: Ticket) -> Result<()> {
        let index = self.resolve(handle)?;
        let slot = &mut self.slots[index];
        slot.use_count = slot.use_count.saturating_sub(1);
        if slot.sequence != ticket.0 {
            Ok(())
        } else {
            log::debug!("cond {}: wait timed out", index);
            Err(KernelError::Timeout)
        }
    }

    /// Wake the highest-priority waiter, the oldest one among equals.
    pub fn signal<P: Port>(&mut self, sched: &mut Scheduler<P>, handle: CondHandle) -> Result<()> {
        let index = self.resolve(handle)?;
        let slot = &mut self.slots[index];
        slot.sequence = slot.sequence.wrapping_add(1);

        let mut best: Option<(usize, u8)> = None;
        for task in sched.pending(PendList::Cond(index)) {
            let prio = sched.priority_of(task);
            if best.map_or(true, |(_, best_prio)| prio > best_prio) {
                best = Some((task, prio));
            }
        }
        if let Some((task, _)) = best {
            sched.wake(task);
            sched.schedule();
        }
        Ok(())
    }

    /// Wake every waiter, then make one scheduling decision.
    pub fn broadcast<P: Port>(&mut self, sched: &mut Scheduler<P>, handle: CondHandle) -> Result<()> {
        let index = self.resolve(handle)?;
        let slot = &mut self.slots[index];
        slot.sequence = slot.sequence.wrapping_add(1);

        while let Some(task) = sched.first_pending(PendList::Cond(index)) {
            sched.wake(task);
        }
        sched.schedule();
        Ok(())
    }

    /// Number of tasks currently inside a wait.
    pub fn use_count(&self, handle: CondHandle) -> Result<u16> {
        self.resolve(handle).map(|i| self.slots[i].use_count)
    }

    fn resolve(&self, handle: CondHandle) -> Result<usize> {
        let index = handle.index as usize;
        match self.slots.get(index) {
            Some(slot) if slot.in_use && slot.generation == handle.generation => Ok(index),
            _ => Err(KernelError::Invalid),
        }
    }
}

impl Default for CondPool {
    fn default() -> Self {
        Self::new()
    }
}
