//! # TOS Configuration
//!
//! Compile-time constants governing the kernel pools, the scheduler and the
//! small-block allocator. All limits are fixed at compile time; nothing in the
//! kernel grows at runtime.

/// Maximum number of application tasks. The TCB pool holds one extra slot
/// for the idle task.
pub const MAX_TASKS: usize = 8;

/// Size of the TCB pool, idle task included.
pub const TASK_POOL_SIZE: usize = MAX_TASKS + 1;

/// Highest usable priority. Priorities run from 0 (idle) to `MAX_PRIO`;
/// numerically higher means more important.
pub const MAX_PRIO: u8 = 8;

/// Number of per-priority ready lists.
pub const PRIO_LEVELS: usize = MAX_PRIO as usize + 1;

/// Priority of the idle task.
pub const IDLE_PRIO: u8 = 0;

/// Tick interrupt frequency in Hz.
pub const TICK_HZ: u32 = 1000;

/// Milliseconds per tick.
pub const TICK_MS: u32 = 1000 / TICK_HZ;

/// Wait-time sentinel for tasks pending without a deadline. The tick handler
/// never decrements it.
pub const WAIT_INFINITE: u32 = u32::MAX;

/// Core clock in Hz (STM32F103 at 72 MHz from the PLL).
pub const SYSTEM_CLOCK_HZ: u32 = 72_000_000;

/// Idle task stack, in 32-bit words.
pub const IDLE_STACK_WORDS: usize = 128;

/// Smallest stack accepted by `create_task`, in 32-bit words. Must hold the
/// initial register frame (16 words on Cortex-M) with room to spare.
pub const MIN_STACK_WORDS: usize = 32;

/// Size of the mutex pool.
pub const MAX_MUTEXES: usize = 10;

/// Size of the condition variable pool.
pub const MAX_CONDS: usize = 10;

/// Allocator bucket width and smallest block, in bytes.
pub const MEM_BLOCK_MIN: usize = 8;

/// Largest block served by the allocator, in bytes.
pub const MEM_BLOCK_MAX: usize = 128;

/// Number of size buckets (8, 16, ..., 128).
pub const MEM_BUCKETS: usize = MEM_BLOCK_MAX / MEM_BLOCK_MIN;

/// Blocks carved from the arena when a bucket runs dry.
pub const MEM_REFILL_BLOCKS: usize = 5;

const _: () = assert!((MAX_PRIO as u32) < 32, "ready mask is 32 bits wide");
const _: () = assert!(TICK_MS > 0, "TICK_HZ must not exceed 1000");
const _: () = assert!(MEM_BLOCK_MAX % MEM_BLOCK_MIN == 0);
const _: () = assert!(MIN_STACK_WORDS >= 16);
