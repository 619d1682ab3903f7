//! Arena allocation.
//!
//! An arena is a large region of OS memory (usually huge pages reserved up
//! front) split into fixed-size blocks. Three bitmaps per arena track which
//! blocks are in use, which were ever handed out (dirty) and which are
//! committed. Allocations that cannot be served from an arena go straight to
//! the OS.
//!
//! Arenas are published into a fixed-capacity registry by bumping an atomic
//! count; they are never removed. A memid returned with each allocation
//! records the arena and bitmap position so that `free` can find the bits
//! again.

use core::{
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicPtr, AtomicUsize},
  time::Duration,
};
use std::sync::OnceLock;

use crate::{
  SEGMENT_ALIGN, align_up,
  atomic::{AtomicArith, AtomicCell, MemOrder, null_cell},
  bitmap::{self, BITS_PER_FIELD, BitmapIndex, Field},
  config::Config,
  error::{self, Corruption, Error, Result},
  memid::MemId,
  os::{OsMemory, SystemOs},
  stats::Stats,
};

// =============================================================================
// Constants
// =============================================================================

/// Allocation granularity inside an arena (32MB on 64-bit).
pub const ARENA_BLOCK_SIZE: usize = 8 * SEGMENT_ALIGN;
/// Largest request served by an arena: one full bitmap field of blocks.
pub const ARENA_MAX_OBJ_SIZE: usize = BITS_PER_FIELD * ARENA_BLOCK_SIZE;
/// Smaller requests waste too much of a block and go to the OS.
pub const ARENA_MIN_OBJ_SIZE: usize = ARENA_BLOCK_SIZE / 2;

const _: () = assert!(ARENA_BLOCK_SIZE.is_power_of_two());
const _: () = assert!(ARENA_MIN_OBJ_SIZE <= ARENA_MAX_OBJ_SIZE);

/// Number of blocks covering `size` bytes.
#[inline(always)]
pub const fn block_count_of_size(size: usize) -> usize {
  size.div_ceil(ARENA_BLOCK_SIZE)
}

// =============================================================================
// Arena
// =============================================================================

/// Who gives the arena's memory back when its registry is dropped.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Source {
  /// Provided by the caller; never released here.
  External,
  /// Mapped with `OsMemory::alloc_aligned`.
  Os { committed: bool },
  /// Mapped with `OsMemory::alloc_huge_pages`.
  HugePages,
}

/// Descriptor of one arena.
#[derive(Debug)]
pub struct Arena {
  start: NonNull<u8>,
  block_count: usize,
  numa_node: Option<usize>,
  is_large: bool,
  is_committed: bool,
  is_zero_init: bool,
  source: Source,
  /// Field where the last claim succeeded; next-fit hint.
  search_idx: AtomicUsize,
  blocks_inuse: Box<[Field]>,
  blocks_dirty: Box<[Field]>,
  blocks_committed: Box<[Field]>,
}

// The arena only hands out addresses; all mutable state is atomic.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
  /// Describes `size` bytes at `start` as an arena of whole blocks. Any
  /// trailing partial block is ignored. Returns `None` when not even one
  /// block fits.
  pub fn new(
    start: NonNull<u8>,
    size: usize,
    numa_node: Option<usize>,
    is_large: bool,
    is_committed: bool,
    is_zero_init: bool,
  ) -> Option<Self> {
    Self::with_source(
      start,
      size,
      numa_node,
      is_large,
      is_committed,
      is_zero_init,
      Source::External,
    )
  }

  fn with_source(
    start: NonNull<u8>,
    size: usize,
    numa_node: Option<usize>,
    is_large: bool,
    is_committed: bool,
    is_zero_init: bool,
    source: Source,
  ) -> Option<Self> {
    let block_count = size / ARENA_BLOCK_SIZE;
    if block_count == 0 {
      return None;
    }
    let field_count = bitmap::fields_for(block_count);
    let arena = Self {
      start,
      block_count,
      numa_node,
      is_large,
      is_committed,
      is_zero_init,
      source,
      search_idx: AtomicUsize::new(0),
      blocks_inuse: bitmap::new_bitmap(field_count),
      blocks_dirty: bitmap::new_bitmap(field_count),
      blocks_committed: bitmap::new_bitmap(field_count),
    };

    // Bits past the last block are claimed forever so they are never handed out.
    let padding = field_count * BITS_PER_FIELD - block_count;
    if padding > 0 {
      let index = BitmapIndex::from_bit(block_count);
      bitmap::claim(&arena.blocks_inuse, padding, index);
    }
    if is_committed {
      for field in arena.blocks_committed.iter() {
        field.set(bitmap::FIELD_FULL, MemOrder::Relaxed);
      }
    }
    Some(arena)
  }

  #[inline(always)]
  pub fn start(&self) -> NonNull<u8> {
    self.start
  }

  #[inline(always)]
  pub fn size(&self) -> usize {
    self.block_count * ARENA_BLOCK_SIZE
  }

  #[inline(always)]
  pub fn block_count(&self) -> usize {
    self.block_count
  }

  #[inline(always)]
  pub fn field_count(&self) -> usize {
    self.blocks_inuse.len()
  }

  /// Preferred NUMA node, `None` when the arena serves any node.
  #[inline(always)]
  pub fn numa_node(&self) -> Option<usize> {
    self.numa_node
  }

  #[inline(always)]
  pub fn is_large(&self) -> bool {
    self.is_large
  }

  #[inline(always)]
  pub fn is_committed(&self) -> bool {
    self.is_committed
  }

  #[inline(always)]
  pub fn is_zero_init(&self) -> bool {
    self.is_zero_init
  }

  /// Blocks currently handed out.
  pub fn used_blocks(&self) -> usize {
    let set: usize = self
      .blocks_inuse
      .iter()
      .map(|f| f.get(MemOrder::Relaxed).count_ones() as usize)
      .sum();
    set - (self.field_count() * BITS_PER_FIELD - self.block_count)
  }

  pub fn contains(&self, ptr: *const u8) -> bool {
    let start = self.start.as_ptr() as usize;
    let addr = ptr as usize;
    addr >= start && addr - start < self.size()
  }

  #[inline(always)]
  fn block_ptr(&self, index: BitmapIndex) -> NonNull<u8> {
    let offset = index.bit() * ARENA_BLOCK_SIZE;
    debug_assert!(offset < self.size());
    // Inside a non-null mapping that does not wrap the address space.
    unsafe { NonNull::new_unchecked(self.start.as_ptr().wrapping_add(offset)) }
  }

  /// Claims `blocks` blocks and commits them if asked. Returns `None` when
  /// the arena has no free run or committing failed.
  fn alloc<O: OsMemory>(
    &self,
    arena_index: usize,
    blocks: usize,
    commit: bool,
    os: &O,
    stats: &Stats,
  ) -> Option<ArenaAlloc> {
    let start_field = self.search_idx.get(MemOrder::Acquire);
    let index = bitmap::find_claim_from(&self.blocks_inuse, start_field, blocks)?;
    self.search_idx.set(index.field(), MemOrder::Release);

    let ptr = self.block_ptr(index);
    let (was_clean, _) = bitmap::claim(&self.blocks_dirty, blocks, index);
    let mut is_zero = was_clean && self.is_zero_init;

    let committed = if self.is_committed {
      true
    } else if commit {
      let before = bitmap::claim_previous(&self.blocks_committed, blocks, index);
      match self.commit_runs(ptr, blocks, before, os, stats) {
        Ok(commit_zero) => is_zero |= commit_zero,
        Err(err) => {
          log::warn!(
            "failed to commit {} arena blocks at {:p}: {}",
            blocks,
            ptr.as_ptr(),
            err
          );
          self.release_commit_bits(blocks, index, before);
          bitmap::unclaim(&self.blocks_inuse, blocks, index);
          return None;
        }
      }
      true
    } else {
      bitmap::is_claimed(&self.blocks_committed, blocks, index)
    };

    Some(ArenaAlloc {
      ptr,
      committed,
      large: self.is_large,
      is_zero,
      memid: MemId::arena(arena_index, index),
    })
  }

  /// Commits each run of blocks whose bit in `before` was clear. Returns
  /// true when the whole range was committed just now and reads as zero.
  fn commit_runs<O: OsMemory>(
    &self,
    ptr: NonNull<u8>,
    blocks: usize,
    before: usize,
    os: &O,
    stats: &Stats,
  ) -> std::io::Result<bool> {
    let mut all_zero = before == 0;
    let mut done = 0;
    let mut bit = 0;
    while bit < blocks {
      if (before >> bit) & 1 != 0 {
        bit += 1;
        continue;
      }
      let run_start = bit;
      while bit < blocks && (before >> bit) & 1 == 0 {
        bit += 1;
      }
      let size = (bit - run_start) * ARENA_BLOCK_SIZE;
      let run = unsafe { NonNull::new_unchecked(ptr.as_ptr().wrapping_add(run_start * ARENA_BLOCK_SIZE)) };
      match unsafe { os.commit(run, size) } {
        Ok(zero) => all_zero &= zero,
        Err(err) => {
          // The caller clears every committed bit this call set.
          stats.committed.decrease(done);
          return Err(err);
        }
      }
      stats.committed.increase(size);
      done += size;
    }
    Ok(all_zero)
  }

  /// Clears the committed bits that were set by a failed allocation.
  fn release_commit_bits(&self, blocks: usize, index: BitmapIndex, before: usize) {
    for bit in (0..blocks).filter(|b| (before >> b) & 1 == 0) {
      bitmap::unclaim(
        &self.blocks_committed,
        1,
        BitmapIndex::from_bit(index.bit() + bit),
      );
    }
  }

  /// Unmaps memory the registry obtained itself.
  unsafe fn release<O: OsMemory>(&self, os: &O) {
    match self.source {
      Source::External => {}
      Source::Os { committed } => unsafe { os.free(self.start, self.size(), committed) },
      Source::HugePages => unsafe { os.free_huge_pages(self.start, self.size()) },
    }
  }
}

/// A successful [`Arenas::alloc_aligned`].
#[derive(Clone, Copy, Debug)]
pub struct ArenaAlloc {
  pub ptr: NonNull<u8>,
  /// The whole range is committed.
  pub committed: bool,
  /// Backed by large OS pages.
  pub large: bool,
  /// The range is known to read as zero.
  pub is_zero: bool,
  pub memid: MemId,
}

// =============================================================================
// Registry
// =============================================================================

/// Append-only arena registry plus the OS fallback.
pub struct Arenas<O: OsMemory = SystemOs> {
  os: O,
  config: Config,
  slots: Box<[AtomicPtr<Arena>]>,
  count: AtomicUsize,
  stats: Stats,
}

impl<O: OsMemory> Arenas<O> {
  pub fn new(os: O, config: Config) -> Self {
    let slots = (0..config.arena_capacity()).map(|_| null_cell()).collect();
    Self {
      os,
      config,
      slots,
      count: AtomicUsize::new(0),
      stats: Stats::default(),
    }
  }

  #[inline(always)]
  pub fn os(&self) -> &O {
    &self.os
  }

  #[inline(always)]
  pub fn config(&self) -> &Config {
    &self.config
  }

  #[inline(always)]
  pub fn stats(&self) -> &Stats {
    &self.stats
  }

  #[inline(always)]
  pub fn capacity(&self) -> usize {
    self.slots.len()
  }

  /// Publishes `arena` and returns its index. Gives the arena back when the
  /// registry is full.
  pub fn add_arena(&self, arena: Box<Arena>) -> core::result::Result<usize, Box<Arena>> {
    let index = self.count.add(1, MemOrder::AcqRel);
    if index >= self.slots.len() {
      self.count.sub(1, MemOrder::AcqRel);
      return Err(arena);
    }
    self.slots[index].set(Box::into_raw(arena), MemOrder::Release);
    Ok(index)
  }

  /// Arena at `index`, if published.
  pub fn get(&self, index: usize) -> Option<&Arena> {
    let ptr = self.slots.get(index)?.get(MemOrder::Acquire);
    // Published arenas live as long as the registry.
    unsafe { ptr.as_ref() }
  }

  /// Number of claimed slots. A slot may be claimed but not yet published.
  pub fn len(&self) -> usize {
    self.count.get(MemOrder::Relaxed).min(self.slots.len())
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Published arenas in index order, stopping at the first unpublished slot.
  pub fn iter(&self) -> impl Iterator<Item = (usize, &Arena)> + '_ {
    let len = self.len();
    (0..len).map_while(move |i| self.get(i).map(|a| (i, a)))
  }

  pub fn contains(&self, ptr: *const u8) -> bool {
    self.iter().any(|(_, arena)| arena.contains(ptr))
  }

  // ===========================================================================
  // Allocation
  // ===========================================================================

  /// Allocates `size` bytes aligned to `alignment`.
  ///
  /// Requests of arena-block scale are served from registered arenas, local
  /// NUMA node first; everything else, and anything the arenas cannot fit,
  /// is mapped from the OS.
  pub fn alloc_aligned(
    &self,
    size: usize,
    alignment: usize,
    commit: bool,
    large: bool,
  ) -> Result<ArenaAlloc> {
    if size == 0 {
      return Err(Error::InvalidArgument("size must be non-zero"));
    }
    if !alignment.is_power_of_two() {
      return Err(Error::InvalidArgument("alignment must be a power of two"));
    }

    if alignment <= SEGMENT_ALIGN && (ARENA_MIN_OBJ_SIZE..=ARENA_MAX_OBJ_SIZE).contains(&size) {
      if let Some(alloc) = self.alloc_from_arenas(size, commit, large) {
        return Ok(alloc);
      }
    }

    let alloc = self
      .os
      .alloc_aligned(size, alignment, commit, large)
      .ok_or(Error::OutOfMemory)?;
    self.stats.os_fallbacks.add(1, MemOrder::Relaxed);
    log::trace!(
      "allocated {size:#x} bytes directly from the os at {:p}",
      alloc.ptr.as_ptr()
    );
    Ok(ArenaAlloc {
      ptr: alloc.ptr,
      committed: commit,
      large: alloc.large,
      is_zero: true,
      memid: MemId::Os,
    })
  }

  fn alloc_from_arenas(&self, size: usize, commit: bool, large: bool) -> Option<ArenaAlloc> {
    if self.is_empty() {
      return None;
    }
    let blocks = block_count_of_size(size);
    let node = self.os.current_numa_node();
    let suitable = |arena: &Arena| !large || arena.is_large;

    // Local or unconstrained arenas first, then remote ones.
    let local = self
      .iter()
      .filter(|(_, a)| suitable(a) && a.numa_node.is_none_or(|n| n == node));
    for (i, arena) in local {
      if let Some(alloc) = arena.alloc(i, blocks, commit, &self.os, &self.stats) {
        return Some(alloc);
      }
    }
    let remote = self
      .iter()
      .filter(|(_, a)| suitable(a) && a.numa_node.is_some_and(|n| n != node));
    for (i, arena) in remote {
      if let Some(alloc) = arena.alloc(i, blocks, commit, &self.os, &self.stats) {
        return Some(alloc);
      }
    }
    None
  }

  /// Returns memory obtained from [`Arenas::alloc_aligned`].
  ///
  /// Malformed or repeated frees are reported as corruption and leave the
  /// bitmaps as they were, apart from a double free which has already
  /// cleared the bits it names.
  ///
  /// # Safety
  ///
  /// For `MemId::Os`, `ptr` and `size` must describe a live OS allocation
  /// from this registry that is not used afterwards.
  pub unsafe fn free(
    &self,
    ptr: NonNull<u8>,
    size: usize,
    memid: MemId,
    all_committed: bool,
  ) -> Result<()> {
    if size == 0 {
      return Err(Error::InvalidArgument("size must be non-zero"));
    }
    let (arena_index, index) = match memid {
      MemId::Os => {
        unsafe { self.os.free(ptr, size, all_committed) };
        return Ok(());
      }
      MemId::Arena {
        arena_index,
        bitmap_index,
      } => (arena_index, bitmap_index),
    };

    let corrupt = |c: Corruption| error::report(c, self.config.corruption);
    let Some(arena) = self.get(arena_index) else {
      return Err(corrupt(Corruption::UnknownArena {
        arena_index,
        ptr: ptr.as_ptr() as usize,
        memid: memid.to_raw(),
      }));
    };

    let blocks = block_count_of_size(size);
    // Trailing bits past the last block stay claimed; a memid naming them is corrupt.
    if index.field() >= arena.field_count()
      || index.bit_in_field() + blocks > BITS_PER_FIELD
      || index.bit() + blocks > arena.block_count()
    {
      return Err(corrupt(Corruption::BlockOutOfRange {
        field: index.field(),
        field_count: arena.field_count(),
        ptr: ptr.as_ptr() as usize,
        memid: memid.to_raw(),
      }));
    }

    if !bitmap::unclaim(&arena.blocks_inuse, blocks, index) {
      return Err(corrupt(Corruption::DoubleFree {
        ptr: ptr.as_ptr() as usize,
        size,
      }));
    }
    Ok(())
  }

  // ===========================================================================
  // Reservation
  // ===========================================================================

  fn register(&self, arena: Arena) -> Result<usize> {
    let size = arena.size();
    let start = arena.start;
    match self.add_arena(Box::new(arena)) {
      Ok(index) => {
        self.stats.reserved.increase(size);
        self.stats.arenas.increase(1);
        log::debug!("registered arena {index}: {size:#x} bytes at {:p}", start.as_ptr());
        Ok(index)
      }
      Err(arena) => {
        log::warn!(
          "arena registry is full ({} arenas), releasing {size:#x} bytes",
          self.capacity()
        );
        unsafe { arena.release(&self.os) };
        Err(Error::OutOfMemory)
      }
    }
  }

  /// Reserves `pages` 1GB huge pages preferring `numa_node` (taken modulo
  /// the node count) and registers them as one arena. Fewer pages than
  /// requested may be reserved when the timeout expires first.
  pub fn reserve_huge_pages_at(
    &self,
    pages: usize,
    numa_node: Option<usize>,
    timeout: Duration,
  ) -> Result<()> {
    if pages == 0 {
      return Ok(());
    }
    let node = numa_node.map(|n| n % self.os.numa_node_count().max(1));

    let Some(region) = self.os.alloc_huge_pages(pages, node, timeout) else {
      log::warn!("failed to reserve {pages} huge pages (numa node {node:?})");
      return Err(Error::OutOfMemory);
    };
    if region.pages < pages {
      log::warn!(
        "reserved only {} of {pages} huge pages (numa node {node:?})",
        region.pages
      );
    } else {
      log::debug!("reserved {pages} huge pages (numa node {node:?})");
    }

    let Some(arena) = Arena::with_source(
      region.ptr,
      region.size,
      node,
      true,
      true,
      true,
      Source::HugePages,
    ) else {
      unsafe { self.os.free_huge_pages(region.ptr, region.size) };
      return Err(Error::OutOfMemory);
    };
    self.register(arena).map(|_| ())
  }

  /// Spreads `pages` huge pages over `numa_nodes` nodes (all nodes when 0),
  /// giving the remainder to the lowest nodes. Stops at the first failure.
  pub fn reserve_huge_pages_interleave(
    &self,
    pages: usize,
    numa_nodes: usize,
    timeout: Duration,
  ) -> Result<()> {
    if pages == 0 {
      return Ok(());
    }
    let nodes = if numa_nodes == 0 {
      self.os.numa_node_count()
    } else {
      numa_nodes
    }
    .max(1);

    let per_node = pages / nodes;
    let remainder = pages % nodes;
    let node_timeout = if timeout.is_zero() {
      timeout
    } else {
      timeout / nodes as u32 + self.config.interleave_timeout_slack
    };

    for node in 0..nodes {
      let node_pages = per_node + usize::from(node < remainder);
      if node_pages == 0 {
        break;
      }
      self.reserve_huge_pages_at(node_pages, Some(node), node_timeout)?;
    }
    Ok(())
  }

  /// Registers caller-owned memory as an arena. `start` must be aligned to
  /// `SEGMENT_ALIGN` and `size` must hold at least one block.
  ///
  /// # Safety
  ///
  /// The range must stay valid and otherwise unused for the lifetime of the
  /// registry. `is_committed` and `is_zero` must describe it truthfully.
  pub unsafe fn manage_os_memory(
    &self,
    start: NonNull<u8>,
    size: usize,
    is_committed: bool,
    is_large: bool,
    is_zero: bool,
    numa_node: Option<usize>,
  ) -> Result<usize> {
    if start.as_ptr() as usize % SEGMENT_ALIGN != 0 {
      return Err(Error::InvalidArgument("arena start must be segment aligned"));
    }
    let arena = Arena::new(start, size, numa_node, is_large, is_committed, is_zero)
      .ok_or(Error::InvalidArgument("arena smaller than one block"))?;
    self.register(arena)
  }

  /// Maps `size` bytes (rounded up to whole blocks) from the OS and registers
  /// them as an arena.
  pub fn reserve_os_memory(&self, size: usize, commit: bool, allow_large: bool) -> Result<usize> {
    let size = align_up(size.max(1), ARENA_BLOCK_SIZE);
    let alloc = self
      .os
      .alloc_aligned(size, SEGMENT_ALIGN, commit, allow_large)
      .ok_or(Error::OutOfMemory)?;
    let arena = Arena::with_source(
      alloc.ptr,
      size,
      None,
      alloc.large,
      commit,
      true,
      Source::Os { committed: commit },
    )
    .ok_or(Error::OutOfMemory)?;
    self.register(arena)
  }
}

impl<O: OsMemory> Drop for Arenas<O> {
  fn drop(&mut self) {
    for slot in self.slots.iter() {
      let ptr = slot.replace(null_mut(), MemOrder::Acquire);
      if !ptr.is_null() {
        let arena = unsafe { Box::from_raw(ptr) };
        unsafe { arena.release(&self.os) };
        self.stats.reserved.decrease(arena.size());
        self.stats.arenas.decrease(1);
      }
    }
  }
}

// =============================================================================
// Process-wide registry
// =============================================================================

static ARENAS: OnceLock<Arenas> = OnceLock::new();

/// Creates the process-wide registry with `config`. Returns false when it
/// already exists, in which case `config` is ignored.
pub fn init(config: Config) -> bool {
  let mut created = false;
  ARENAS.get_or_init(|| {
    created = true;
    Arenas::new(SystemOs, config)
  });
  created
}

/// The process-wide registry, created with the default config on first use.
pub fn global() -> &'static Arenas {
  ARENAS.get_or_init(|| Arenas::new(SystemOs, Config::default()))
}

/// [`Arenas::alloc_aligned`] on the process-wide registry.
pub fn alloc_aligned(size: usize, alignment: usize, commit: bool, large: bool) -> Result<ArenaAlloc> {
  global().alloc_aligned(size, alignment, commit, large)
}

/// [`Arenas::free`] on the process-wide registry.
///
/// # Safety
///
/// See [`Arenas::free`].
pub unsafe fn free(ptr: NonNull<u8>, size: usize, memid: MemId, all_committed: bool) -> Result<()> {
  unsafe { global().free(ptr, size, memid, all_committed) }
}

/// [`Arenas::reserve_huge_pages_at`] on the process-wide registry.
pub fn reserve_huge_pages_at(pages: usize, numa_node: Option<usize>, timeout: Duration) -> Result<()> {
  global().reserve_huge_pages_at(pages, numa_node, timeout)
}

/// [`Arenas::reserve_huge_pages_interleave`] on the process-wide registry.
pub fn reserve_huge_pages_interleave(pages: usize, numa_nodes: usize, timeout: Duration) -> Result<()> {
  global().reserve_huge_pages_interleave(pages, numa_nodes, timeout)
}
