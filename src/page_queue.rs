//! Per-heap page queues.
//!
//! A heap keeps one doubly linked queue of pages per size class, plus two
//! special queues: huge pages and full pages. For small sizes a direct table
//! maps each word size to the first page of the matching queue, so the
//! allocation fast path finds a page with one load.
//!
//! Queues are owned by one thread at a time. The only cross-thread hazard is
//! absorbing another heap's pages while remote threads free into them; see
//! [`Heap::append`].

use crate::{
  LARGE_OBJ_SIZE_MAX, PAGES_DIRECT, SMALL_SIZE_MAX, WORD_SIZE,
  page::{HeapId, PageId, PageSlab},
  size_class::{BIN_COUNT, BIN_FULL, BIN_HUGE, bin, bin_size, wsize_from_size},
};

#[derive(Clone, Copy, Debug)]
pub struct PageQueue {
  first: Option<PageId>,
  last: Option<PageId>,
  block_size: usize,
}

impl PageQueue {
  const fn new(block_size: usize) -> Self {
    Self {
      first: None,
      last: None,
      block_size,
    }
  }

  #[inline(always)]
  pub fn first(&self) -> Option<PageId> {
    self.first
  }

  #[inline(always)]
  pub fn last(&self) -> Option<PageId> {
    self.last
  }

  /// Largest block size this queue serves.
  #[inline(always)]
  pub fn block_size(&self) -> usize {
    self.block_size
  }

  #[inline(always)]
  pub fn is_empty(&self) -> bool {
    self.first.is_none()
  }

  #[inline(always)]
  pub fn is_huge(&self) -> bool {
    self.block_size == LARGE_OBJ_SIZE_MAX + WORD_SIZE
  }

  #[inline(always)]
  pub fn is_full(&self) -> bool {
    self.block_size == LARGE_OBJ_SIZE_MAX + 2 * WORD_SIZE
  }

  /// Huge or full: pages here are not found through the size class.
  #[inline(always)]
  pub fn is_special(&self) -> bool {
    self.is_huge() || self.is_full()
  }

  /// Pages from first to last.
  pub fn iter<'a>(&self, slab: &'a PageSlab) -> impl Iterator<Item = PageId> + use<'a> {
    core::iter::successors(self.first, move |&id| slab.page(id).next())
  }

  pub fn len(&self, slab: &PageSlab) -> usize {
    self.iter(slab).count()
  }
}

/// The queues of one heap.
#[derive(Debug)]
pub struct Heap {
  id: HeapId,
  queues: [PageQueue; BIN_COUNT],
  /// First page for each small word size; `None` is the empty page.
  direct: [Option<PageId>; PAGES_DIRECT],
  page_count: usize,
}

impl Default for Heap {
  fn default() -> Self {
    Self::new()
  }
}

impl Heap {
  pub fn new() -> Self {
    Self {
      id: HeapId::next(),
      queues: core::array::from_fn(|b| PageQueue::new(bin_size(b as u8))),
      direct: [None; PAGES_DIRECT],
      page_count: 0,
    }
  }

  #[inline(always)]
  pub fn id(&self) -> HeapId {
    self.id
  }

  /// Pages across all queues.
  #[inline(always)]
  pub fn page_count(&self) -> usize {
    self.page_count
  }

  #[inline(always)]
  pub fn queue(&self, bin: u8) -> &PageQueue {
    &self.queues[bin as usize]
  }

  /// Page serving `size` bytes through the direct table. `None` for empty
  /// bins and for sizes above `SMALL_SIZE_MAX`.
  #[inline(always)]
  pub fn direct_page(&self, size: usize) -> Option<PageId> {
    if size > SMALL_SIZE_MAX {
      return None;
    }
    self.direct[wsize_from_size(size)]
  }

  /// Queue a page belongs in: the full queue if flagged, else its size class.
  pub fn queue_of(&self, slab: &PageSlab, page: PageId) -> u8 {
    let page = slab.page(page);
    if page.in_full() {
      BIN_FULL
    } else {
      bin(page.block_size())
    }
  }

  // ===========================================================================
  // Queue operations
  // ===========================================================================

  /// Inserts `page` at the head of queue `bin`.
  pub fn push(&mut self, slab: &PageSlab, bin: u8, page: PageId) {
    #[cfg(feature = "debug-tripwire")]
    debug_assert!(!self.contains(slab, page), "page {page:?} is already queued");

    let queue = &mut self.queues[bin as usize];
    let p = slab.page(page);
    p.set_in_full(queue.is_full());
    p.set_heap(self.id);
    p.set_prev(None);
    p.set_next(queue.first);
    match queue.first {
      Some(first) => slab.page(first).set_prev(Some(page)),
      None => queue.last = Some(page),
    }
    queue.first = Some(page);

    self.update_direct(bin);
    self.page_count += 1;
  }

  /// Unlinks `page` from queue `bin`.
  pub fn remove(&mut self, slab: &PageSlab, bin: u8, page: PageId) {
    #[cfg(feature = "debug-tripwire")]
    debug_assert!(self.queue_contains(slab, bin, page), "page {page:?} is not in queue {bin}");

    self.unlink(slab, bin, page);
    debug_assert!(self.page_count > 0);
    self.page_count -= 1;
    slab.page(page).set_in_full(false);
  }

  /// Moves `page` from queue `from` to the tail of queue `to`, e.g. when it
  /// becomes full or stops being full.
  pub fn enqueue_from(&mut self, slab: &PageSlab, to: u8, from: u8, page: PageId) {
    #[cfg(feature = "debug-tripwire")]
    debug_assert!(self.queue_contains(slab, from, page), "page {page:?} is not in queue {from}");

    self.unlink(slab, from, page);

    let queue = &mut self.queues[to as usize];
    let p = slab.page(page);
    p.set_prev(queue.last);
    p.set_next(None);
    match queue.last {
      Some(last) => {
        slab.page(last).set_next(Some(page));
        queue.last = Some(page);
      }
      None => {
        queue.first = Some(page);
        queue.last = Some(page);
        self.update_direct(to);
      }
    }
    p.set_in_full(self.queues[to as usize].is_full());
  }

  /// Moves every page of `from`'s queue `bin` to the tail of this heap's
  /// queue `bin` and makes this heap their owner. Returns the number of
  /// pages moved.
  ///
  /// Remote threads may be freeing into the moved pages. Each page is first
  /// marked transfer-pending, which waits out a free that is notifying the
  /// old heap and holds back new ones; the page is then relinked and
  /// re-tagged, and finally released to notify its new owner.
  pub fn append(&mut self, slab: &PageSlab, bin: u8, from: &mut Heap) -> usize {
    debug_assert_ne!(self.id, from.id);
    let source = from.queues[bin as usize];
    let Some(first) = source.first else {
      return 0;
    };

    for page in source.iter(slab) {
      slab.page(page).begin_transfer();
    }

    let mut moved = 0;
    for page in source.iter(slab) {
      slab.page(page).set_heap(self.id);
      moved += 1;
    }

    let queue = &mut self.queues[bin as usize];
    match queue.last {
      Some(last) => {
        slab.page(last).set_next(Some(first));
        slab.page(first).set_prev(Some(last));
        queue.last = source.last;
      }
      None => {
        queue.first = Some(first);
        queue.last = source.last;
        self.update_direct(bin);
      }
    }
    self.page_count += moved;

    from.queues[bin as usize].first = None;
    from.queues[bin as usize].last = None;
    from.update_direct(bin);
    from.page_count -= moved;

    for page in self.queues[bin as usize].iter(slab).skip_while(|&p| p != first) {
      slab.page(page).finish_transfer();
    }
    moved
  }

  /// Takes over all pages of `from`, leaving it empty.
  pub fn absorb(&mut self, slab: &PageSlab, from: &mut Heap) -> usize {
    (0..BIN_COUNT as u8)
      .map(|bin| self.append(slab, bin, from))
      .sum()
  }

  fn unlink(&mut self, slab: &PageSlab, bin: u8, page: PageId) {
    let p = slab.page(page);
    let (prev, next) = (p.prev(), p.next());
    if let Some(prev) = prev {
      slab.page(prev).set_next(next);
    }
    if let Some(next) = next {
      slab.page(next).set_prev(prev);
    }

    let queue = &mut self.queues[bin as usize];
    if queue.last == Some(page) {
      queue.last = prev;
    }
    if queue.first == Some(page) {
      queue.first = next;
      self.update_direct(bin);
    }
    p.set_prev(None);
    p.set_next(None);
  }

  /// Points the direct-table slots served by queue `bin` at its first page.
  ///
  /// The slots run from just past the block size of the nearest smaller
  /// queue that maps to a different size class up to this queue's own word
  /// size. Neighbouring queues can share a size class once sizes are rounded,
  /// hence the walk back.
  fn update_direct(&mut self, bin: u8) {
    let size = self.queues[bin as usize].block_size;
    if size > SMALL_SIZE_MAX {
      return;
    }
    let page = self.queues[bin as usize].first;
    let idx = wsize_from_size(size);
    if self.direct[idx] == page {
      return;
    }

    let start = if idx <= 1 {
      0
    } else {
      let class = crate::size_class::bin(size);
      let mut prev = bin as usize - 1;
      while prev > 0 && crate::size_class::bin(self.queues[prev].block_size) == class {
        prev -= 1;
      }
      (1 + wsize_from_size(self.queues[prev].block_size)).min(idx)
    };

    for slot in &mut self.direct[start..=idx] {
      *slot = page;
    }
  }

  #[cfg(feature = "debug-tripwire")]
  fn queue_contains(&self, slab: &PageSlab, bin: u8, page: PageId) -> bool {
    self.queues[bin as usize].iter(slab).any(|p| p == page)
  }

  #[cfg(feature = "debug-tripwire")]
  fn contains(&self, slab: &PageSlab, page: PageId) -> bool {
    (0..BIN_COUNT as u8).any(|b| self.queue_contains(slab, b, page))
  }
}

const _: () = assert!(BIN_HUGE < BIN_FULL && (BIN_FULL as usize) < BIN_COUNT);
