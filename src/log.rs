//! # Kernel Logging
//!
//! Thin macros over `defmt`. With the `defmt` feature disabled they compile
//! to nothing, so the kernel carries no formatting code on small parts.
//! Arguments are still evaluated by reference to keep call sites warning-free.
//! The warning level is `warning!`, since a bare `warn` clashes with the
//! builtin lint attribute when re-exported.

macro_rules! __klog {
    ($level:ident, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::$level!($fmt $(, $arg)*);
        #[cfg(not(feature = "defmt"))]
        {
            $( let _ = &$arg; )*
        }
    }};
}

macro_rules! trace {
    ($($t:tt)*) => { $crate::log::__klog!(trace, $($t)*) };
}

macro_rules! debug {
    ($($t:tt)*) => { $crate::log::__klog!(debug, $($t)*) };
}

macro_rules! info {
    ($($t:tt)*) => { $crate::log::__klog!(info, $($t)*) };
}

macro_rules! warning {
    ($($t:tt)*) => { $crate::log::__klog!(warn, $($t)*) };
}

macro_rules! error {
    ($($t:tt)*) => { $crate::log::__klog!(error, $($t)*) };
}

pub(crate) use {__klog, debug, error, info, trace, warning};
