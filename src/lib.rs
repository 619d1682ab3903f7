//! Allocator core: a lock-free arena/bitmap block allocator and the
//! size-class binned page queues used by per-thread heaps.
//!
//! - [`bitmap`] claims and releases bit runs with single-word CAS.
//! - [`arena`] carves large OS regions into fixed-size blocks tracked by
//!   bitmaps and falls back to the OS when no arena can serve a request.
//! - [`size_class`] maps byte sizes to bins.
//! - [`page_queue`] keeps per-heap queues of pages by bin, with a direct
//!   lookup table for small sizes.

use core::mem::size_of;

pub mod arena;
pub mod atomic;
pub mod bitmap;
pub mod config;
pub mod error;
pub mod memid;
pub mod os;
pub mod page;
pub mod page_queue;
pub mod size_class;
pub mod stats;

pub use arena::{
  Arena, ArenaAlloc, Arenas, alloc_aligned, free, reserve_huge_pages_at,
  reserve_huge_pages_interleave,
};
pub use config::{Config, CorruptionPolicy};
pub use error::{Corruption, Error, Result};
pub use memid::MemId;
pub use os::{OsMemory, SystemOs};
pub use page::{Delayed, HeapId, Page, PageId, PageSlab};
pub use page_queue::{Heap, PageQueue};
pub use size_class::{BIN_COUNT, BIN_FULL, BIN_HUGE, bin, bin_size, good_size};

// =============================================================================
// Constants
// =============================================================================

pub const WORD_SIZE: usize = size_of::<usize>();
const WORD_SHIFT: usize = WORD_SIZE.trailing_zeros() as usize;

pub const SMALL_PAGE_SHIFT: usize = 13 + WORD_SHIFT; // 64KB on 64-bit
pub const MEDIUM_PAGE_SHIFT: usize = 3 + SMALL_PAGE_SHIFT; // 512KB
pub const LARGE_PAGE_SHIFT: usize = 3 + MEDIUM_PAGE_SHIFT; // 4MB
pub const SEGMENT_SHIFT: usize = LARGE_PAGE_SHIFT;

pub const SEGMENT_SIZE: usize = 1 << SEGMENT_SHIFT;
pub const SEGMENT_ALIGN: usize = SEGMENT_SIZE;
pub const LARGE_PAGE_SIZE: usize = 1 << LARGE_PAGE_SHIFT;

/// Largest object served from a page queue bin; anything above is huge.
pub const LARGE_OBJ_SIZE_MAX: usize = LARGE_PAGE_SIZE / 2;
pub const LARGE_OBJ_WSIZE_MAX: usize = LARGE_OBJ_SIZE_MAX / WORD_SIZE;

/// Sizes up to this many words are resolved through the heap's direct table.
pub const SMALL_WSIZE_MAX: usize = 128;
pub const SMALL_SIZE_MAX: usize = SMALL_WSIZE_MAX * WORD_SIZE;
/// Entries in the direct table (word sizes `0..=SMALL_WSIZE_MAX`).
pub const PAGES_DIRECT: usize = SMALL_WSIZE_MAX + 1;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(WORD_SIZE.is_power_of_two());
const _: () = assert!(SEGMENT_SIZE.is_power_of_two());
const _: () = assert!(SMALL_SIZE_MAX < LARGE_OBJ_SIZE_MAX);
const _: () = assert!(LARGE_OBJ_SIZE_MAX % WORD_SIZE == 0);

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
