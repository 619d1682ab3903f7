//! Page records.
//!
//! Pages live in a [`PageSlab`] and are addressed by [`PageId`]; queues link
//! them by id, so a recycled slot can never be reached through a stale
//! pointer. Slot occupancy is tracked with the bitmap claim engine.
//!
//! Links and flags are atomics so that a slab can be shared between threads,
//! but only the owning heap writes them. The exception is the delayed-free
//! state, which remote threads freeing into a full page update as well.

use core::{
  num::NonZeroUsize,
  sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize},
};

use crate::{
  atomic::{AtomicArith, AtomicCell, MemOrder, yield_now},
  bitmap::{self, BITS_PER_FIELD, BitmapIndex, Field},
  config::CorruptionPolicy,
  error::{self, Corruption, Error, Result},
};

/// Index of a page in its slab.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PageId(u32);

impl PageId {
  const NONE: u32 = u32::MAX;

  #[inline(always)]
  pub const fn new(index: u32) -> Self {
    debug_assert!(index != Self::NONE);
    Self(index)
  }

  #[inline(always)]
  pub const fn index(self) -> usize {
    self.0 as usize
  }

  #[inline(always)]
  fn encode(id: Option<PageId>) -> u32 {
    id.map_or(Self::NONE, |p| p.0)
  }

  #[inline(always)]
  fn decode(raw: u32) -> Option<PageId> {
    (raw != Self::NONE).then_some(PageId(raw))
  }
}

/// Identity of a heap. Never zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct HeapId(NonZeroUsize);

impl HeapId {
  /// A fresh id, unique within the process.
  pub fn next() -> Self {
    static NEXT: AtomicUsize = AtomicUsize::new(1);
    let id = NEXT.add(1, MemOrder::Relaxed);
    Self(NonZeroUsize::new(id).unwrap_or(NonZeroUsize::MIN))
  }

  #[inline(always)]
  pub const fn get(self) -> usize {
    self.0.get()
  }

  #[inline(always)]
  fn from_raw(raw: usize) -> Option<Self> {
    NonZeroUsize::new(raw).map(Self)
  }
}

// =============================================================================
// Delayed free
// =============================================================================

/// How frees from other threads reach a page.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Delayed {
  /// The next remote free also notifies the owning heap.
  UseDelayedFree = 0,
  /// A remote free is notifying the owning heap right now.
  DelayedFreeing = 1,
  /// Remote frees go to the page only.
  NoDelayedFree = 2,
  /// As `NoDelayedFree`, and only an override may change it.
  NeverDelayedFree = 3,
}

impl Delayed {
  #[inline(always)]
  const fn from_bits(bits: u8) -> Self {
    match bits & STATE_MASK {
      0 => Delayed::UseDelayedFree,
      1 => Delayed::DelayedFreeing,
      2 => Delayed::NoDelayedFree,
      _ => Delayed::NeverDelayedFree,
    }
  }
}

const STATE_MASK: u8 = 0b011;
/// Set while the page is moving to another heap; remote frees wait.
const TRANSFER_PENDING: u8 = 0b100;

// =============================================================================
// Page
// =============================================================================

#[derive(Debug)]
pub struct Page {
  prev: AtomicU32,
  next: AtomicU32,
  block_size: AtomicUsize,
  in_full: AtomicBool,
  heap: AtomicUsize,
  delayed: AtomicU8,
}

impl Page {
  fn new() -> Self {
    Self {
      prev: AtomicU32::new(PageId::NONE),
      next: AtomicU32::new(PageId::NONE),
      block_size: AtomicUsize::new(0),
      in_full: AtomicBool::new(false),
      heap: AtomicUsize::new(0),
      delayed: AtomicU8::new(Delayed::UseDelayedFree as u8),
    }
  }

  fn reset(&self, block_size: usize) {
    self.prev.set(PageId::NONE, MemOrder::Relaxed);
    self.next.set(PageId::NONE, MemOrder::Relaxed);
    self.block_size.set(block_size, MemOrder::Relaxed);
    self.in_full.set(false, MemOrder::Relaxed);
    self.heap.set(0, MemOrder::Relaxed);
    self.delayed.set(Delayed::UseDelayedFree as u8, MemOrder::Release);
  }

  #[inline(always)]
  pub fn prev(&self) -> Option<PageId> {
    PageId::decode(self.prev.get(MemOrder::Relaxed))
  }

  #[inline(always)]
  pub fn next(&self) -> Option<PageId> {
    PageId::decode(self.next.get(MemOrder::Relaxed))
  }

  #[inline(always)]
  pub fn block_size(&self) -> usize {
    self.block_size.get(MemOrder::Relaxed)
  }

  /// Whether the page sits in its heap's full queue.
  #[inline(always)]
  pub fn in_full(&self) -> bool {
    self.in_full.get(MemOrder::Relaxed)
  }

  /// Owning heap, if the page was ever queued.
  #[inline(always)]
  pub fn heap(&self) -> Option<HeapId> {
    HeapId::from_raw(self.heap.get(MemOrder::Acquire))
  }

  #[inline(always)]
  pub fn delayed(&self) -> Delayed {
    Delayed::from_bits(self.delayed.get(MemOrder::Acquire))
  }

  #[inline(always)]
  pub fn is_transfer_pending(&self) -> bool {
    self.delayed.get(MemOrder::Acquire) & TRANSFER_PENDING != 0
  }

  #[inline(always)]
  pub(crate) fn set_prev(&self, prev: Option<PageId>) {
    self.prev.set(PageId::encode(prev), MemOrder::Relaxed);
  }

  #[inline(always)]
  pub(crate) fn set_next(&self, next: Option<PageId>) {
    self.next.set(PageId::encode(next), MemOrder::Relaxed);
  }

  #[inline(always)]
  pub(crate) fn set_in_full(&self, in_full: bool) {
    self.in_full.set(in_full, MemOrder::Relaxed);
  }

  #[inline(always)]
  pub(crate) fn set_heap(&self, heap: HeapId) {
    self.heap.set(heap.get(), MemOrder::Release);
  }

  /// Owner side: switches the delayed-free mode to `mode`.
  ///
  /// Waits while a remote free is notifying the heap. A page marked
  /// `NeverDelayedFree` keeps that mode unless `override_never` is set.
  pub fn use_delayed_free(&self, mode: Delayed, override_never: bool) {
    debug_assert!(mode != Delayed::DelayedFreeing);
    let mut cur = self.delayed.get(MemOrder::Acquire);
    loop {
      let state = Delayed::from_bits(cur);
      if state == Delayed::DelayedFreeing || cur & TRANSFER_PENDING != 0 {
        yield_now();
        cur = self.delayed.get(MemOrder::Acquire);
        continue;
      }
      if state == mode || (state == Delayed::NeverDelayedFree && !override_never) {
        return;
      }
      if self.delayed.cas_weak(&mut cur, mode as u8, MemOrder::AcqRel) {
        return;
      }
    }
  }

  /// Free side: called by a thread freeing into this page from outside its
  /// heap. When the page asks for delayed frees, moves it to
  /// `DelayedFreeing` and returns the owning heap, which stays fixed until
  /// [`Page::leave_delayed_free`]. Returns `None` when the free only needs
  /// to touch the page. Waits while the page is moving between heaps.
  pub fn enter_delayed_free(&self) -> Option<HeapId> {
    let mut cur = self.delayed.get(MemOrder::Acquire);
    loop {
      if cur & TRANSFER_PENDING != 0 {
        yield_now();
        cur = self.delayed.get(MemOrder::Acquire);
        continue;
      }
      if Delayed::from_bits(cur) != Delayed::UseDelayedFree {
        return None;
      }
      if self
        .delayed
        .cas_weak(&mut cur, Delayed::DelayedFreeing as u8, MemOrder::AcqRel)
      {
        return self.heap();
      }
    }
  }

  /// Ends a free started by a successful [`Page::enter_delayed_free`].
  pub fn leave_delayed_free(&self) {
    let prev = self
      .delayed
      .replace(Delayed::NoDelayedFree as u8, MemOrder::Release);
    debug_assert_eq!(prev, Delayed::DelayedFreeing as u8);
  }

  /// First phase of a heap transfer: waits out any in-flight remote free and
  /// marks the page so that new ones wait until [`Page::finish_transfer`].
  pub(crate) fn begin_transfer(&self) {
    let mut cur = self.delayed.get(MemOrder::Acquire);
    loop {
      debug_assert!(cur & TRANSFER_PENDING == 0);
      if Delayed::from_bits(cur) == Delayed::DelayedFreeing {
        yield_now();
        cur = self.delayed.get(MemOrder::Acquire);
        continue;
      }
      let pending = cur | TRANSFER_PENDING;
      if self.delayed.cas_weak(&mut cur, pending, MemOrder::AcqRel) {
        return;
      }
    }
  }

  /// Last phase of a heap transfer. Remote frees resume and notify the new
  /// owner, unless the page never uses delayed frees.
  pub(crate) fn finish_transfer(&self) {
    let cur = self.delayed.get(MemOrder::Relaxed);
    debug_assert!(cur & TRANSFER_PENDING != 0);
    let next = match Delayed::from_bits(cur) {
      Delayed::NeverDelayedFree => Delayed::NeverDelayedFree,
      _ => Delayed::UseDelayedFree,
    };
    self.delayed.set(next as u8, MemOrder::Release);
  }
}

// =============================================================================
// Slab
// =============================================================================

/// Fixed-capacity store of page records.
#[derive(Debug)]
pub struct PageSlab {
  pages: Box<[Page]>,
  used: Box<[Field]>,
  policy: CorruptionPolicy,
}

impl PageSlab {
  pub fn new(capacity: u32, policy: CorruptionPolicy) -> Self {
    let capacity = capacity.min(PageId::NONE) as usize;
    let field_count = bitmap::fields_for(capacity);
    let slab = Self {
      pages: (0..capacity).map(|_| Page::new()).collect(),
      used: bitmap::new_bitmap(field_count),
      policy,
    };
    let padding = field_count * BITS_PER_FIELD - capacity;
    if padding > 0 {
      bitmap::claim(&slab.used, padding, BitmapIndex::from_bit(capacity));
    }
    slab
  }

  #[inline(always)]
  pub fn capacity(&self) -> usize {
    self.pages.len()
  }

  /// Takes a free slot for a page of `block_size` bytes.
  pub fn create(&self, block_size: usize) -> Option<PageId> {
    let index = bitmap::find_claim(&self.used, 1)?;
    let page = &self.pages[index.bit()];
    page.reset(block_size);
    Some(PageId::new(index.bit() as u32))
  }

  /// Returns a slot. Releasing a free slot is reported as corruption.
  pub fn release(&self, id: PageId) -> Result<()> {
    if id.index() >= self.capacity() {
      return Err(Error::InvalidArgument("page id out of range"));
    }
    if !bitmap::unclaim(&self.used, 1, BitmapIndex::from_bit(id.index())) {
      return Err(error::report(
        Corruption::PageDoubleRelease { page: id.0 },
        self.policy,
      ));
    }
    Ok(())
  }

  pub fn is_live(&self, id: PageId) -> bool {
    id.index() < self.capacity()
      && bitmap::is_claimed(&self.used, 1, BitmapIndex::from_bit(id.index()))
  }

  /// # Panics
  ///
  /// Panics if `id` is not from this slab.
  #[inline(always)]
  pub fn page(&self, id: PageId) -> &Page {
    &self.pages[id.index()]
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{
    sync::{
      Barrier,
      atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
  };

  #[test]
  fn slab_slots_are_reused() {
    let slab = PageSlab::new(3, CorruptionPolicy::Report);
    let a = slab.create(64).unwrap();
    let b = slab.create(128).unwrap();
    let c = slab.create(256).unwrap();
    assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));
    assert_eq!(slab.create(64), None);
    assert_eq!(slab.page(b).block_size(), 128);

    slab.release(b).unwrap();
    assert!(!slab.is_live(b));
    let d = slab.create(32).unwrap();
    assert_eq!(d, b);
    assert_eq!(slab.page(d).block_size(), 32);
    assert!(slab.page(d).heap().is_none());
  }

  #[test]
  fn double_release_is_corruption() {
    let slab = PageSlab::new(4, CorruptionPolicy::Report);
    let p = slab.create(64).unwrap();
    slab.release(p).unwrap();
    assert_eq!(
      slab.release(p),
      Err(Error::Corruption(Corruption::PageDoubleRelease { page: 0 }))
    );
    assert!(matches!(
      slab.release(PageId::new(9)),
      Err(Error::InvalidArgument(_))
    ));
  }

  #[test]
  fn heap_ids_are_unique() {
    let a = HeapId::next();
    let b = HeapId::next();
    assert_ne!(a, b);
    assert_ne!(a.get(), 0);
  }

  #[test]
  fn delayed_free_modes() {
    let slab = PageSlab::new(1, CorruptionPolicy::Report);
    let id = slab.create(64).unwrap();
    let page = slab.page(id);
    let heap = HeapId::next();
    page.set_heap(heap);

    assert_eq!(page.delayed(), Delayed::UseDelayedFree);
    assert_eq!(page.enter_delayed_free(), Some(heap));
    assert_eq!(page.delayed(), Delayed::DelayedFreeing);
    // Another remote free while the first is in flight touches the page only.
    assert_eq!(page.enter_delayed_free(), None);
    page.leave_delayed_free();
    assert_eq!(page.delayed(), Delayed::NoDelayedFree);
    assert_eq!(page.enter_delayed_free(), None);

    page.use_delayed_free(Delayed::NeverDelayedFree, false);
    page.use_delayed_free(Delayed::UseDelayedFree, false);
    assert_eq!(page.delayed(), Delayed::NeverDelayedFree);
    page.use_delayed_free(Delayed::UseDelayedFree, true);
    assert_eq!(page.delayed(), Delayed::UseDelayedFree);
  }

  #[test]
  fn transfer_keeps_never_mode() {
    let slab = PageSlab::new(1, CorruptionPolicy::Report);
    let page = slab.page(slab.create(64).unwrap());
    page.use_delayed_free(Delayed::NeverDelayedFree, false);
    page.begin_transfer();
    assert!(page.is_transfer_pending());
    assert_eq!(page.delayed(), Delayed::NeverDelayedFree);
    page.finish_transfer();
    assert!(!page.is_transfer_pending());
    assert_eq!(page.delayed(), Delayed::NeverDelayedFree);
  }

  #[test]
  fn remote_free_waits_for_pending_transfer() {
    let slab = PageSlab::new(1, CorruptionPolicy::Report);
    let page = slab.page(slab.create(64).unwrap());
    let old = HeapId::next();
    let new = HeapId::next();
    page.set_heap(old);
    page.begin_transfer();

    let entered = AtomicBool::new(false);
    let barrier = Barrier::new(2);
    thread::scope(|s| {
      let freer = s.spawn(|| {
        barrier.wait();
        let heap = page.enter_delayed_free();
        entered.store(true, Ordering::Release);
        page.leave_delayed_free();
        heap
      });

      barrier.wait();
      thread::sleep(Duration::from_millis(50));
      assert!(!entered.load(Ordering::Acquire));

      page.set_heap(new);
      page.finish_transfer();
      assert_eq!(freer.join().unwrap(), Some(new));
    });
  }

  #[test]
  fn transfer_waits_for_inflight_remote_free() {
    let slab = PageSlab::new(1, CorruptionPolicy::Report);
    let page = slab.page(slab.create(64).unwrap());
    page.set_heap(HeapId::next());
    assert!(page.enter_delayed_free().is_some());

    let began = AtomicBool::new(false);
    thread::scope(|s| {
      let owner = s.spawn(|| {
        page.begin_transfer();
        began.store(true, Ordering::Release);
        page.finish_transfer();
      });

      thread::sleep(Duration::from_millis(50));
      assert!(!began.load(Ordering::Acquire));
      page.leave_delayed_free();
      owner.join().unwrap();
    });
    assert!(began.load(Ordering::Acquire));
    assert_eq!(page.delayed(), Delayed::UseDelayedFree);
  }
}
