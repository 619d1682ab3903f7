//! Lock-free claiming of contiguous bit ranges.
//!
//! A bitmap is a slice of word-sized fields. Each bit tracks one block; a
//! claim sets a run of `count` bits inside a single field with one CAS and
//! never spans two fields. Successful claims use acquire-release ordering so
//! writes made by the owner of a range are visible to whoever later observes
//! the range being released.

use core::sync::atomic::AtomicUsize;

use crate::atomic::{AtomicArith, AtomicCell, MemOrder};

/// One bitmap word.
pub type Field = AtomicUsize;

pub const BITS_PER_FIELD: usize = usize::BITS as usize;
pub const FIELD_FULL: usize = usize::MAX;

/// Position of a bit across all fields: `field * BITS_PER_FIELD + bit`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct BitmapIndex(usize);

impl BitmapIndex {
  #[inline(always)]
  pub const fn new(field: usize, bit: usize) -> Self {
    debug_assert!(bit < BITS_PER_FIELD);
    Self(field * BITS_PER_FIELD + bit)
  }

  #[inline(always)]
  pub const fn from_bit(bit: usize) -> Self {
    Self(bit)
  }

  #[inline(always)]
  pub const fn field(self) -> usize {
    self.0 / BITS_PER_FIELD
  }

  #[inline(always)]
  pub const fn bit_in_field(self) -> usize {
    self.0 % BITS_PER_FIELD
  }

  /// Bit position across the whole bitmap.
  #[inline(always)]
  pub const fn bit(self) -> usize {
    self.0
  }
}

/// Allocates `field_count` zeroed fields.
pub fn new_bitmap(field_count: usize) -> Box<[Field]> {
  (0..field_count).map(|_| Field::new(0)).collect()
}

/// Number of fields needed to track `bits` bits.
#[inline(always)]
pub const fn fields_for(bits: usize) -> usize {
  bits.div_ceil(BITS_PER_FIELD)
}

/// `count` ones starting at `bit`. A full-width run is special-cased so the
/// shift never reaches the word width.
#[inline(always)]
const fn mask(count: usize, bit: usize) -> usize {
  debug_assert!(count + bit <= BITS_PER_FIELD);
  if count >= BITS_PER_FIELD {
    FIELD_FULL
  } else if count == 0 {
    0
  } else {
    ((1usize << count) - 1) << bit
  }
}

#[inline(always)]
const fn highest_bit(x: usize) -> usize {
  debug_assert!(x != 0);
  BITS_PER_FIELD - 1 - x.leading_zeros() as usize
}

// =============================================================================
// Claiming
// =============================================================================

/// One strong CAS that sets `count` bits at `bit_index` of `fields[field_index]`.
///
/// Returns false without touching the field when any target bit is already
/// set or when the CAS loses a race; retrying is up to the caller.
pub fn try_claim_field(
  fields: &[Field],
  field_index: usize,
  count: usize,
  bit_index: usize,
) -> bool {
  debug_assert!(count > 0 && bit_index + count <= BITS_PER_FIELD);
  let field = &fields[field_index];
  let m = mask(count, bit_index);
  let mut map = field.get(MemOrder::Relaxed);
  if map & m != 0 {
    return false;
  }
  let desired = map | m;
  field.cas_strong(&mut map, desired, MemOrder::AcqRel)
}

/// Finds and claims the first free run of `count` bits in one field.
pub fn find_claim_in_field(
  fields: &[Field],
  field_index: usize,
  count: usize,
) -> Option<BitmapIndex> {
  if count == 0 || count > BITS_PER_FIELD {
    return None;
  }

  let field = &fields[field_index];
  let mut map = field.get(MemOrder::Relaxed);
  if map == FIELD_FULL {
    return None;
  }

  let run = mask(count, 0);
  let last_start = BITS_PER_FIELD - count;
  // The first zero bit is the earliest place a run can begin.
  let mut bit = (!map).trailing_zeros() as usize;

  while bit <= last_start {
    let m = run << bit;
    if map & m == 0 {
      let desired = map | m;
      if field.cas_weak(&mut map, desired, MemOrder::AcqRel) {
        return Some(BitmapIndex::new(field_index, bit));
      }
      // Lost a race; `map` now holds the fresh value, retry at the same spot.
      continue;
    }

    // Skip past the highest conflicting bit inside the window.
    let shift = if count == 1 {
      1
    } else {
      highest_bit(map & m) - bit + 1
    };
    debug_assert!(shift > 0 && shift <= count);
    bit += shift;
  }

  None
}

/// Claims `count` bits in the first field that has room, scanning fields in
/// order. Never returns a run that crosses a field boundary.
pub fn find_claim(fields: &[Field], count: usize) -> Option<BitmapIndex> {
  find_claim_from(fields, 0, count)
}

/// Like [`find_claim`] but starts at `start_field` and wraps around.
pub fn find_claim_from(fields: &[Field], start_field: usize, count: usize) -> Option<BitmapIndex> {
  let field_count = fields.len();
  if field_count == 0 {
    return None;
  }
  let start = start_field % field_count;
  (0..field_count).find_map(|i| {
    let mut idx = start + i;
    if idx >= field_count {
      idx -= field_count;
    }
    find_claim_in_field(fields, idx, count)
  })
}

/// Clears `count` bits at `index`.
///
/// Returns true when every cleared bit was previously set. False means the
/// range was (partly) free already: a double release.
///
/// # Panics
///
/// Panics if `index` lies outside `fields`.
pub fn unclaim(fields: &[Field], count: usize, index: BitmapIndex) -> bool {
  let m = mask(count, index.bit_in_field());
  let prev = fields[index.field()].and(!m, MemOrder::AcqRel);
  prev & m == m
}

/// Sets `count` bits at `index` regardless of their state.
///
/// Returns `(all_were_zero, any_was_zero)` describing the bits before the
/// update. Used for auxiliary maps where overlap with a prior state is
/// information rather than an error.
///
/// # Panics
///
/// Panics if `index` lies outside `fields`.
pub fn claim(fields: &[Field], count: usize, index: BitmapIndex) -> (bool, bool) {
  let prev = claim_previous(fields, count, index);
  (prev == 0, prev != mask(count, 0))
}

/// Sets `count` bits at `index` and returns their previous state, shifted so
/// that bit 0 of the result is the bit at `index`.
///
/// # Panics
///
/// Panics if `index` lies outside `fields`.
pub fn claim_previous(fields: &[Field], count: usize, index: BitmapIndex) -> usize {
  let bit = index.bit_in_field();
  let m = mask(count, bit);
  let prev = fields[index.field()].or(m, MemOrder::AcqRel);
  (prev & m) >> bit
}

/// True if all `count` bits at `index` are set.
pub fn is_claimed(fields: &[Field], count: usize, index: BitmapIndex) -> bool {
  let m = mask(count, index.bit_in_field());
  fields[index.field()].get(MemOrder::Relaxed) & m == m
}

/// True if any of the `count` bits at `index` is set.
pub fn is_any_claimed(fields: &[Field], count: usize, index: BitmapIndex) -> bool {
  let m = mask(count, index.bit_in_field());
  fields[index.field()].get(MemOrder::Relaxed) & m != 0
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{
    sync::{Arc, Barrier},
    thread,
  };

  fn value(fields: &[Field], i: usize) -> usize {
    fields[i].get(MemOrder::Relaxed)
  }

  #[test]
  fn claim_then_unclaim_restores_field() {
    let fields = new_bitmap(2);
    fields[1].set(0b1000_0001, MemOrder::Relaxed);
    for (bit, count) in [(1, 3), (8, 8), (0, 1), (BITS_PER_FIELD - 4, 4)] {
      let before = value(&fields, 1);
      let hit = fields[1].get(MemOrder::Relaxed) & mask(count, bit) != 0;
      let claimed = try_claim_field(&fields, 1, count, bit);
      assert_eq!(claimed, !hit);
      if claimed {
        assert!(unclaim(&fields, count, BitmapIndex::new(1, bit)));
      }
      assert_eq!(value(&fields, 1), before);
    }
  }

  #[test]
  fn try_claim_rejects_overlap_without_mutation() {
    let fields = new_bitmap(1);
    assert!(try_claim_field(&fields, 0, 2, 4));
    assert!(!try_claim_field(&fields, 0, 3, 3));
    assert_eq!(value(&fields, 0), 0b11_0000);
  }

  #[test]
  fn find_claim_skips_past_conflicting_bits() {
    let fields = new_bitmap(1);
    // free: bit 1, bits 3..5, bits 6..
    fields[0].set(0b0010_0101, MemOrder::Relaxed);
    let idx = find_claim_in_field(&fields, 0, 2).unwrap();
    assert_eq!(idx.bit(), 3);
    let idx = find_claim_in_field(&fields, 0, 3).unwrap();
    assert_eq!(idx.bit(), 6);
    let idx = find_claim_in_field(&fields, 0, 1).unwrap();
    assert_eq!(idx.bit(), 1);
    assert_eq!(value(&fields, 0), 0b1_1111_1111);
  }

  #[test]
  fn full_width_claim() {
    let fields = new_bitmap(2);
    fields[0].set(1 << 17, MemOrder::Relaxed);
    let idx = find_claim(&fields, BITS_PER_FIELD).unwrap();
    assert_eq!(idx, BitmapIndex::new(1, 0));
    assert_eq!(value(&fields, 1), FIELD_FULL);
    assert!(find_claim_in_field(&fields, 1, 1).is_none());
    assert!(unclaim(&fields, BITS_PER_FIELD, idx));
    assert_eq!(value(&fields, 1), 0);
  }

  #[test]
  fn find_claim_never_crosses_fields() {
    let fields = new_bitmap(2);
    // Only the top three bits of field 0 are free.
    fields[0].set(FIELD_FULL >> 3, MemOrder::Relaxed);
    let idx = find_claim(&fields, 4).unwrap();
    assert_eq!(idx, BitmapIndex::new(1, 0));
    let idx = find_claim(&fields, 3).unwrap();
    assert_eq!(idx, BitmapIndex::new(0, BITS_PER_FIELD - 3));
    assert_eq!(value(&fields, 0), FIELD_FULL);
  }

  #[test]
  fn find_claim_from_wraps() {
    let fields = new_bitmap(3);
    let idx = find_claim_from(&fields, 2, 5).unwrap();
    assert_eq!(idx.field(), 2);
    fields[2].set(FIELD_FULL, MemOrder::Relaxed);
    let idx = find_claim_from(&fields, 2, 5).unwrap();
    assert_eq!(idx.field(), 0);
    assert!(find_claim_from(&[], 0, 1).is_none());
  }

  #[test]
  fn unclaim_reports_double_release() {
    let fields = new_bitmap(1);
    let idx = find_claim(&fields, 3).unwrap();
    assert!(unclaim(&fields, 3, idx));
    assert!(!unclaim(&fields, 3, idx));
    let idx = find_claim(&fields, 3).unwrap();
    assert!(unclaim(&fields, 1, idx));
    assert!(!unclaim(&fields, 3, idx));
  }

  #[test]
  fn claim_reports_prior_state() {
    let fields = new_bitmap(1);
    let idx = BitmapIndex::new(0, 4);
    assert_eq!(claim(&fields, 2, idx), (true, true));
    assert_eq!(claim(&fields, 2, idx), (false, false));
    assert_eq!(claim(&fields, 4, idx), (false, true));
    assert!(is_claimed(&fields, 4, idx));
    assert!(!is_claimed(&fields, 5, idx));
    assert!(is_any_claimed(&fields, 8, BitmapIndex::new(0, 0)));
    assert!(!is_any_claimed(&fields, 4, BitmapIndex::new(0, 0)));

    // Bits 4..8 are set; the run 6..10 saw 6 and 7 set, 8 and 9 clear.
    assert_eq!(claim_previous(&fields, 4, BitmapIndex::new(0, 6)), 0b0011);
  }

  #[test]
  fn racing_claims_on_disjoint_ranges_each_succeed_once() {
    const THREADS: usize = 8;
    const WIDTH: usize = BITS_PER_FIELD / THREADS;
    let fields: Arc<Box<[Field]>> = Arc::new(new_bitmap(1));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
      .map(|t| {
        let fields = Arc::clone(&fields);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
          barrier.wait();
          // A lost CAS race is retried; nobody else ever owns this range.
          while !try_claim_field(&fields, 0, WIDTH, t * WIDTH) {
            assert!(!is_any_claimed(&fields, WIDTH, BitmapIndex::new(0, t * WIDTH)));
          }
          assert!(!try_claim_field(&fields, 0, WIDTH, t * WIDTH));
          1usize
        })
      })
      .collect();

    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, THREADS);
    assert_eq!(value(&fields, 0), FIELD_FULL);
  }

  #[test]
  fn racing_find_claims_are_disjoint() {
    const THREADS: usize = 4;
    let fields: Arc<Box<[Field]>> = Arc::new(new_bitmap(4));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
      .map(|_| {
        let fields = Arc::clone(&fields);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
          barrier.wait();
          let mut got = Vec::new();
          while let Some(idx) = find_claim(&fields, 4) {
            got.push(idx.bit());
          }
          got
        })
      })
      .collect();

    let mut all: Vec<usize> = handles
      .into_iter()
      .flat_map(|h| h.join().unwrap())
      .collect();
    all.sort_unstable();
    let expected: Vec<usize> = (0..4 * BITS_PER_FIELD).step_by(4).collect();
    assert_eq!(all, expected);
  }
}
