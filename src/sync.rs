//! # Synchronization Primitives
//!
//! Interrupt-safe critical sections for TOS. All shared kernel state is
//! reached only inside a critical section; on a single core with interrupts
//! masked this is the whole of the kernel's mutual exclusion.
//!
//! The implementation comes from the `critical-section` crate: on Cortex-M
//! the `cortex-m` single-core impl saves PRIMASK, disables interrupts and
//! restores the saved state on exit, so sections nest correctly.

pub use critical_section::CriticalSection;

/// Execute a closure within a critical section (interrupts disabled).
///
/// # Usage
/// ```ignore
/// sync::critical_section(|cs| {
///     let heap = HEAP.borrow_ref_mut(cs);
/// });
/// ```
///
/// Keep critical sections short: every tick and switch request waits for the
/// section to end.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    ::critical_section::with(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use critical_section::Mutex;

    #[test]
    fn test_nested_sections() {
        let counter = Mutex::new(Cell::new(0u32));
        let value = critical_section(|outer| {
            counter.borrow(outer).set(1);
            critical_section(|inner| counter.borrow(inner).set(2));
            counter.borrow(outer).get()
        });
        assert_eq!(value, 2);
    }
}
