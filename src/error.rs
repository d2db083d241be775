//! # Kernel Errors
//!
//! Every fallible kernel operation returns [`Result`]. The caller decides
//! whether to retry or give up; the kernel never terminates on a recoverable
//! error.

use core::fmt;

/// Failure reasons reported by the kernel API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KernelError {
    /// A required stack region or pointer was missing.
    NullHandle,
    /// No free TCB, mutex, condition variable or allocator block.
    ResourceExhausted,
    /// Stale or destroyed handle, or an out-of-range argument.
    Invalid,
    /// A blocking call reached its deadline.
    Timeout,
    /// The caller does not own the mutex.
    PermissionDenied,
    /// Unlock of a mutex that is not locked.
    Unlocked,
    /// Destroy attempted while the object is held or waited on.
    Blocking,
    /// Blocking call attempted from interrupt context.
    InterruptContext,
    /// The kernel has not been initialized or started.
    NotStarted,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::NullHandle => "null handle",
            KernelError::ResourceExhausted => "resource exhausted",
            KernelError::Invalid => "invalid handle",
            KernelError::Timeout => "timed out",
            KernelError::PermissionDenied => "not the owner",
            KernelError::Unlocked => "already unlocked",
            KernelError::Blocking => "object in use",
            KernelError::InterruptContext => "called from interrupt context",
            KernelError::NotStarted => "kernel not started",
        };
        f.write_str(msg)
    }
}

/// Kernel result type.
pub type Result<T> = core::result::Result<T, KernelError>;

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use std::string::ToString;

    #[test]
    fn test_display_messages() {
        assert_eq!(KernelError::Timeout.to_string(), "timed out");
        assert_eq!(KernelError::PermissionDenied.to_string(), "not the owner");
        assert_eq!(KernelError::Blocking.to_string(), "object in use");
    }
}
