//! # Small-Block Allocator
//!
//! Segregated free lists over one contiguous arena, for blocks of 1 to 128
//! bytes:
//!
//! ```text
//!   free[0]  ─► 8B ─► 8B ─► ∅
//!   free[1]  ─► 16B ─► ∅
//!   ...
//!   free[15] ─► 128B ─► ∅
//!
//!   arena    [start ............ end)   shrinks as batches are carved off
//! ```
//!
//! A request is rounded up to a multiple of 8 and served from its bucket. An
//! empty bucket is refilled with a batch of `MEM_REFILL_BLOCKS` blocks cut
//! from the front of the arena. When the arena cannot hold even one block,
//! its remainder is pushed onto the bucket of its own size and a free block
//! from a larger bucket becomes the new arena. Blocks never merge.
//!
//! A free block's first word is its free-list link, so the arena must be
//! aligned for a pointer.
//!
//! [`malloc`] and [`free`] prefix each allocation with a 4-byte header: the
//! requested size in the low half and a magic tag in the high half, checked on
//! free. User pointers are therefore 4-byte aligned.

use core::cell::RefCell;
use core::mem::align_of;
use core::ptr::NonNull;

use critical_section::Mutex;

use crate::config::{MEM_BLOCK_MAX, MEM_BLOCK_MIN, MEM_BUCKETS, MEM_REFILL_BLOCKS};
use crate::error::{KernelError, Result};
use crate::log;
use crate::sync::critical_section;

const HEADER_SIZE: usize = core::mem::size_of::<u32>();
const BLOCK_MAGIC: u32 = 0x2048;

/// Link stored in the first word of a free block.
#[repr(C)]
struct FreeBlock {
    next: Option<NonNull<FreeBlock>>,
}

#[inline]
const fn bucket(size: usize) -> usize {
    (size + MEM_BLOCK_MIN - 1) / MEM_BLOCK_MIN - 1
}

#[inline]
const fn bucket_size(bucket: usize) -> usize {
    (bucket + 1) * MEM_BLOCK_MIN
}

#[inline]
const fn round_up(size: usize) -> usize {
    (size + MEM_BLOCK_MIN - 1) & !(MEM_BLOCK_MIN - 1)
}

/// Bucketed allocator over a caller-supplied arena.
pub struct BlockAllocator {
    start: *mut u8,
    end: *mut u8,
    free: [Option<NonNull<FreeBlock>>; MEM_BUCKETS],
    initialized: bool,
}

// Safety: the arena is exclusively owned by the allocator after `init`, and
// the shared instance is only reached inside a critical section.
unsafe impl Send for BlockAllocator {}

impl BlockAllocator {
    pub const fn new() -> Self {
        Self {
            start: core::ptr::null_mut(),
            end: core::ptr::null_mut(),
            free: [None; MEM_BUCKETS],
            initialized: false,
        }
    }

    /// Hand `size` bytes at `start` to the allocator, dropping all free
    /// lists.
    ///
    /// `start` must be pointer-aligned and `size` a multiple of
    /// `MEM_BLOCK_MIN`.
    ///
    /// # Safety
    /// The region must be valid for reads and writes and unused by anything
    /// else for as long as the allocator hands out blocks from it.
    pub unsafe fn init(&mut self, start: *mut u8, size: usize) -> Result<()> {
        if start.is_null() {
            return Err(KernelError::NullHandle);
        }
        if start as usize % align_of::<FreeBlock>() != 0 || size % MEM_BLOCK_MIN != 0 {
            return Err(KernelError::Invalid);
        }
        self.start = start;
        // Safety: the caller guarantees `size` bytes at `start`.
        self.end = unsafe { start.add(size) };
        self.free = [None; MEM_BUCKETS];
        self.initialized = true;
        log::debug!("mem: arena of {} bytes", size);
        Ok(())
    }

    /// Allocate a block of at least `n` bytes, `1 <= n <= 128`.
    ///
    /// Returns `None` when uninitialized, out of range or out of memory.
    pub fn alloc(&mut self, n: usize) -> Option<NonNull<u8>> {
        if !self.initialized || n == 0 || n > MEM_BLOCK_MAX {
            return None;
        }
        let b = bucket(n);
        match self.pop(b) {
            Some(block) => Some(block),
            None => self.refill(bucket_size(b)),
        }
    }

    /// Return a block to the bucket for `size`.
    ///
    /// # Safety
    /// `ptr` must come from [`BlockAllocator::alloc`] on this allocator with
    /// the same size class, and must not be used afterwards.
    pub unsafe fn dealloc(&mut self, ptr: *mut u8, size: usize) -> Result<()> {
        if ptr.is_null() {
            return Err(KernelError::NullHandle);
        }
        if size == 0 || size > MEM_BLOCK_MAX {
            return Err(KernelError::Invalid);
        }
        // Safety: forwarded from the caller.
        unsafe { self.push(bucket(size), ptr) };
        Ok(())
    }

    /// Allocate `n` bytes behind a tagged size header.
    pub fn malloc(&mut self, n: usize) -> Option<NonNull<u8>> {
        if n > MEM_BLOCK_MAX - HEADER_SIZE {
            return None;
        }
        let block = self.alloc(n + HEADER_SIZE)?;
        // Safety: the block holds at least `n + 4` bytes and is 4-aligned.
        unsafe {
            block
                .as_ptr()
                .cast::<u32>()
                .write((BLOCK_MAGIC << 16) | n as u32);
            Some(NonNull::new_unchecked(block.as_ptr().add(HEADER_SIZE)))
        }
    }

    /// Release a block from [`BlockAllocator::malloc`].
    ///
    /// A pointer without a valid header is reported and left alone.
    ///
    /// # Safety
    /// `ptr` must be null or point `HEADER_SIZE` bytes into readable memory.
    pub unsafe fn free(&mut self, ptr: *mut u8) -> Result<()> {
        if ptr.is_null() {
            return Err(KernelError::NullHandle);
        }
        // Safety: forwarded from the caller.
        let (block, header) = unsafe {
            let block = ptr.sub(HEADER_SIZE);
            (block, block.cast::<u32>().read())
        };
        if header >> 16 != BLOCK_MAGIC {
            log::error!("mem: free of an invalid block");
            return Err(KernelError::Invalid);
        }
        let n = (header & 0xFFFF) as usize;
        // Safety: the header proves the block came from `malloc`.
        unsafe { self.dealloc(block, n + HEADER_SIZE) }
    }

    /// Blocks on the free list of the bucket serving `size` bytes.
    /// Zero for sizes no bucket serves.
    pub fn free_list_len(&self, size: usize) -> usize {
        if size == 0 || size > MEM_BLOCK_MAX {
            return 0;
        }
        let mut len = 0;
        let mut cursor = self.free[bucket(size)];
        while let Some(block) = cursor {
            len += 1;
            // Safety: free-list links always point at free blocks.
            cursor = unsafe { block.as_ref().next };
        }
        len
    }

    /// Bytes left in the arena, excluding free lists.
    pub fn remaining(&self) -> usize {
        self.end as usize - self.start as usize
    }

    fn pop(&mut self, b: usize) -> Option<NonNull<u8>> {
        let block = self.free[b]?;
        // Safety: free-list links always point at free blocks.
        self.free[b] = unsafe { block.as_ref().next };
        Some(block.cast())
    }

    /// # Safety
    /// `ptr` must be an unused, pointer-aligned block of the bucket's size.
    unsafe fn push(&mut self, b: usize, ptr: *mut u8) {
        let block = ptr.cast::<FreeBlock>();
        unsafe { block.write(FreeBlock { next: self.free[b] }) };
        self.free[b] = NonNull::new(block);
    }

    /// Carve a batch of `size`-byte blocks, return the first and queue the
    /// rest on the bucket.
    fn refill(&mut self, size: usize) -> Option<NonNull<u8>> {
        let (chunk, count) = self.carve(size)?;
        let b = bucket(size);
        // Pushed back to front so the bucket hands them out in address order
        for i in (1..count).rev() {
            // Safety: block `i` of the batch lies inside the carved chunk.
            unsafe { self.push(b, chunk.as_ptr().add(i * size)) };
        }
        Some(chunk)
    }

    /// Cut up to `MEM_REFILL_BLOCKS` blocks of `size` bytes from the arena,
    /// re-homing a larger free block as the arena if needed.
    fn carve(&mut self, size: usize) -> Option<(NonNull<u8>, usize)> {
        loop {
            let left = self.remaining();
            if left >= size {
                let count = (left / size).min(MEM_REFILL_BLOCKS);
                let chunk = self.start;
                // Safety: `count * size <= left`.
                self.start = unsafe { self.start.add(count * size) };
                return NonNull::new(chunk).map(|chunk| (chunk, count));
            }

            if left > 0 {
                // Safety: the remainder is a multiple of 8 and below 128 bytes.
                unsafe { self.push(bucket(left), self.start) };
                self.start = self.end;
            }

            let (b, block) =
                (bucket(size)..MEM_BUCKETS).find_map(|b| self.pop(b).map(|block| (b, block)))?;
            log::trace!("mem: re-homing a {}-byte block", bucket_size(b));
            self.start = block.as_ptr();
            // Safety: the popped block spans its bucket size.
            self.end = unsafe { self.start.add(bucket_size(b)) };
        }
    }
}

impl Default for BlockAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Shared heap
// ---------------------------------------------------------------------------

static HEAP: Mutex<RefCell<BlockAllocator>> = Mutex::new(RefCell::new(BlockAllocator::new()));

/// Initialize the shared heap over `size` bytes at `start`.
///
/// # Safety
/// See [`BlockAllocator::init`].
pub unsafe fn init(start: *mut u8, size: usize) -> Result<()> {
    critical_section(|cs| unsafe { HEAP.borrow_ref_mut(cs).init(start, size) })
}

/// Allocate from the shared heap without a header.
pub fn alloc(n: usize) -> Option<NonNull<u8>> {
    critical_section(|cs| HEAP.borrow_ref_mut(cs).alloc(n))
}

/// # Safety
/// See [`BlockAllocator::dealloc`].
pub unsafe fn dealloc(ptr: *mut u8, size: usize) -> Result<()> {
    critical_section(|cs| unsafe { HEAP.borrow_ref_mut(cs).dealloc(ptr, size) })
}

/// Allocate `n <= 124` bytes from the shared heap.
pub fn malloc(n: usize) -> Option<NonNull<u8>> {
    critical_section(|cs| HEAP.borrow_ref_mut(cs).malloc(n))
}

/// # Safety
/// See [`BlockAllocator::free`].
pub unsafe fn free(ptr: *mut u8) -> Result<()> {
    critical_section(|cs| unsafe { HEAP.borrow_ref_mut(cs).free(ptr) })
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use std::boxed::Box;

    #[repr(C, align(8))]
    struct Arena<const N: usize>([u8; N]);

    fn arena<const N: usize>() -> *mut u8 {
        Box::leak(Box::new(Arena([0u8; N]))).0.as_mut_ptr()
    }

    fn allocator<const N: usize>() -> (BlockAllocator, *mut u8) {
        let mut a = BlockAllocator::new();
        let start = arena::<N>();
        unsafe { a.init(start, N).unwrap() };
        (a, start)
    }

    #[test]
    fn test_init_validation() {
        let start = arena::<64>();
        let mut a = BlockAllocator::new();
        unsafe {
            assert_eq!(a.init(core::ptr::null_mut(), 64), Err(KernelError::NullHandle));
            assert_eq!(a.init(start.add(1), 56), Err(KernelError::Invalid));
            assert_eq!(a.init(start, 60), Err(KernelError::Invalid));
        }
        assert!(a.alloc(8).is_none());
    }

    #[test]
    fn test_alloc_rejects_out_of_range() {
        let (mut a, _) = allocator::<256>();
        assert!(a.alloc(0).is_none());
        assert!(a.alloc(MEM_BLOCK_MAX + 1).is_none());
        assert!(a.alloc(MEM_BLOCK_MAX).is_some());
        assert_eq!(a.free_list_len(0), 0);
        assert_eq!(a.free_list_len(MEM_BLOCK_MAX + 1), 0);
    }

    #[test]
    fn test_refill_carves_a_batch() {
        let (mut a, start) = allocator::<1024>();
        let p = a.alloc(10).unwrap();
        assert_eq!(p.as_ptr(), start);
        assert_eq!(a.free_list_len(16), MEM_REFILL_BLOCKS - 1);
        assert_eq!(a.remaining(), 1024 - 16 * MEM_REFILL_BLOCKS);

        // The rest of the batch comes out in address order
        let q = a.alloc(16).unwrap();
        assert_eq!(q.as_ptr(), unsafe { start.add(16) });
        assert_eq!(a.free_list_len(16), MEM_REFILL_BLOCKS - 2);
    }

    #[test]
    fn test_round_trip_keeps_bucket_accounting() {
        let (mut a, _) = allocator::<8192>();
        for n in 1..=MEM_BLOCK_MAX {
            let p = a.alloc(n).unwrap();
            let before = a.free_list_len(n);
            unsafe { a.dealloc(p.as_ptr(), n).unwrap() };
            assert_eq!(a.free_list_len(n), before + 1);
            let q = a.alloc(n).unwrap();
            assert_eq!(q, p, "bucket for {} bytes", n);
            assert_eq!(a.free_list_len(n), before);
            unsafe { a.dealloc(q.as_ptr(), n).unwrap() };
        }
    }

    #[test]
    fn test_partial_batch_when_arena_is_short() {
        let (mut a, _) = allocator::<48>();
        a.alloc(16).unwrap();
        assert_eq!(a.free_list_len(16), 2);
        assert_eq!(a.remaining(), 0);
    }

    #[test]
    fn test_exhaustion_salvages_remainder() {
        let (mut a, _) = allocator::<64>();
        a.alloc(24).unwrap();
        assert_eq!(a.free_list_len(24), 1);
        assert_eq!(a.remaining(), 16);

        assert!(a.alloc(32).is_none());
        assert_eq!(a.free_list_len(16), 1);
        assert_eq!(a.remaining(), 0);
    }

    #[test]
    fn test_larger_free_block_becomes_arena() {
        let (mut a, start) = allocator::<64>();
        let big = a.alloc(64).unwrap();
        assert_eq!(a.remaining(), 0);
        unsafe { a.dealloc(big.as_ptr(), 64).unwrap() };

        let small = a.alloc(8).unwrap();
        assert_eq!(small.as_ptr(), start);
        assert_eq!(a.free_list_len(64), 0);
        assert_eq!(a.free_list_len(8), MEM_REFILL_BLOCKS - 1);
        assert_eq!(a.remaining(), 64 - 8 * MEM_REFILL_BLOCKS);
    }

    #[test]
    fn test_dealloc_rejects_bad_arguments() {
        let (mut a, start) = allocator::<64>();
        unsafe {
            assert_eq!(a.dealloc(core::ptr::null_mut(), 8), Err(KernelError::NullHandle));
            assert_eq!(a.dealloc(start, MEM_BLOCK_MAX + 1), Err(KernelError::Invalid));
            assert_eq!(a.dealloc(start, 0), Err(KernelError::Invalid));
        }
    }

    #[test]
    fn test_malloc_free_tags_blocks() {
        let (mut a, start) = allocator::<1024>();
        let p = a.malloc(20).unwrap();
        assert_eq!(p.as_ptr(), unsafe { start.add(HEADER_SIZE) });
        let header = unsafe { start.cast::<u32>().read() };
        assert_eq!(header, (BLOCK_MAGIC << 16) | 20);

        let before = a.free_list_len(24);
        unsafe { a.free(p.as_ptr()).unwrap() };
        assert_eq!(a.free_list_len(24), before + 1);
        assert!(a.malloc(MEM_BLOCK_MAX - HEADER_SIZE + 1).is_none());
    }

    #[test]
    fn test_free_rejects_untagged_and_double_free() {
        let (mut a, start) = allocator::<128>();
        unsafe {
            assert_eq!(a.free(start.add(8)), Err(KernelError::Invalid));
            assert_eq!(a.free(core::ptr::null_mut()), Err(KernelError::NullHandle));

            // One 128-byte block: after free its link is null, not a header
            let p = a.malloc(MEM_BLOCK_MAX - HEADER_SIZE).unwrap();
            a.free(p.as_ptr()).unwrap();
            assert_eq!(a.free(p.as_ptr()), Err(KernelError::Invalid));
            assert_eq!(a.free_list_len(MEM_BLOCK_MAX), 1);
        }
    }

    #[test]
    fn test_shared_heap() {
        let start = arena::<512>();
        unsafe { init(start, 512).unwrap() };
        let p = malloc(40).unwrap();
        unsafe { free(p.as_ptr()).unwrap() };
        let q = alloc(8).unwrap();
        unsafe { dealloc(q.as_ptr(), 8).unwrap() };
    }
}
