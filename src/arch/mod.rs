//! # Architecture Abstraction Layer
//!
//! The portable kernel reaches the processor only through [`Port`]. The
//! Cortex-M port lives in [`cortex_m`]; host tests use a recording port.

use crate::task::TaskEntry;

#[cfg(target_arch = "arm")]
pub mod cortex_m;

#[cfg(test)]
pub(crate) mod test_port;

/// Processor services consumed by the scheduler.
///
/// Interrupt masking is not part of this trait: the kernel uses the
/// `critical-section` crate, whose implementation the port crate provides.
pub trait Port {
    /// Build the initial register frame at the top of `stack` so that the
    /// first dispatch runs `entry(arg)`. Returns the stack pointer to store
    /// in the TCB.
    fn init_stack_frame(&mut self, entry: TaskEntry, arg: usize, stack: &mut [u32]) -> *mut u32;

    /// Request a switch from the current task to the one selected by the
    /// scheduler. The switch may be deferred until interrupts are unmasked;
    /// it completes in [`Scheduler::switch_in`](crate::scheduler::Scheduler::switch_in).
    fn switch_context(&mut self);

    /// Same as [`Port::switch_context`], issued from the epilogue of the
    /// outermost interrupt handler.
    fn switch_context_from_isr(&mut self);

    /// Start the periodic tick interrupt.
    fn init_tick(&mut self);

    /// Transfer control to the first task. Never returns.
    ///
    /// # Safety
    /// `sp` must have been produced by `init_stack_frame` and the kernel must
    /// be fully initialized.
    unsafe fn start_first(sp: *mut u32) -> !;
}
