//! Mapping from byte sizes to bins (size classes).
//!
//! Sizes up to eight words round up to an even word count. Above that, the
//! highest set bit of `wsize - 1` together with the two bits below it picks
//! the bin, so each doubling is split into four bins and the worst-case
//! internal fragmentation stays around 12.5%.

use crate::{LARGE_OBJ_SIZE_MAX, LARGE_OBJ_WSIZE_MAX, WORD_SIZE, align_up, os};

/// Bin for objects above [`LARGE_OBJ_SIZE_MAX`].
pub const BIN_HUGE: u8 = 73;
/// Bin of the queue holding pages that have no free blocks.
pub const BIN_FULL: u8 = BIN_HUGE + 1;
/// Number of page queues in a heap (bins `0..=BIN_FULL`).
pub const BIN_COUNT: usize = BIN_FULL as usize + 1;

const _: () = assert!(bin(LARGE_OBJ_SIZE_MAX) < BIN_HUGE);
const _: () = assert!(bin(LARGE_OBJ_SIZE_MAX + 1) == BIN_HUGE);
const _: () = assert!(bin(WORD_SIZE) == 1);
const _: () = assert!(bin_size(BIN_HUGE) == LARGE_OBJ_SIZE_MAX + WORD_SIZE);

/// Size in machine words, rounded up.
#[inline(always)]
pub const fn wsize_from_size(size: usize) -> usize {
  size.div_ceil(WORD_SIZE)
}

/// Bin for an allocation of `size` bytes.
#[inline]
pub const fn bin(size: usize) -> u8 {
  let wsize = wsize_from_size(size);
  if wsize <= 1 {
    1
  } else if wsize <= 8 {
    ((wsize + 1) & !1) as u8
  } else if wsize > LARGE_OBJ_WSIZE_MAX {
    BIN_HUGE
  } else {
    let w = wsize - 1;
    let b = (usize::BITS - 1 - w.leading_zeros()) as usize;
    // b >= 3 here; the first eight bins are exact so shift down by 3.
    ((b << 2) + ((w >> (b - 2)) & 0x03) - 3) as u8
  }
}

/// Largest block size (in bytes) served by `bin`.
///
/// Bins 3, 5 and 7 are never produced by [`bin`] but keep their exact word
/// size so that queue sizes stay strictly increasing.
pub const fn bin_size(bin: u8) -> usize {
  let wsize = match bin {
    0 => 1,
    1..=8 => bin as usize,
    b if b < BIN_HUGE => {
      let t = b as usize + 3;
      let high = t >> 2;
      let sub = t & 0x03;
      (5 + sub) << (high - 2)
    }
    BIN_HUGE => LARGE_OBJ_WSIZE_MAX + 1,
    _ => LARGE_OBJ_WSIZE_MAX + 2,
  };
  wsize * WORD_SIZE
}

/// Size that an allocation of `size` bytes actually occupies.
pub fn good_size(size: usize) -> usize {
  if size <= LARGE_OBJ_SIZE_MAX {
    bin_size(bin(size))
  } else {
    align_up(size, os::page_size())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn small_sizes() {
    assert_eq!(bin(0), 1);
    assert_eq!(bin(1), 1);
    assert_eq!(bin(WORD_SIZE), 1);
    assert_eq!(bin(WORD_SIZE + 1), 2);
    assert_eq!(bin(2 * WORD_SIZE), 2);
    assert_eq!(bin(3 * WORD_SIZE), 4);
    assert_eq!(bin(8 * WORD_SIZE), 8);
    assert_eq!(bin(9 * WORD_SIZE), 9);
    assert_eq!(bin(10 * WORD_SIZE), 9);
    assert_eq!(bin(11 * WORD_SIZE), 10);
  }

  #[cfg(target_pointer_width = "64")]
  #[test]
  fn sixty_four_bit_reference_points() {
    assert_eq!(bin(8), 1);
    assert_eq!(bin(16), 2);
    assert_eq!(bin(1024), 24);
    assert_eq!(bin(LARGE_OBJ_SIZE_MAX), 68);
    assert_eq!(bin(LARGE_OBJ_SIZE_MAX + 1), BIN_HUGE);
    assert_eq!(bin(usize::MAX), BIN_HUGE);
  }

  #[test]
  fn monotonic() {
    let sizes = (1..1 << 16)
      .chain((1 << 16..LARGE_OBJ_SIZE_MAX).step_by(97))
      .chain([
        LARGE_OBJ_SIZE_MAX,
        LARGE_OBJ_SIZE_MAX + 1,
        LARGE_OBJ_SIZE_MAX + 4 * WORD_SIZE,
      ]);
    let mut prev = bin(0);
    for size in sizes {
      let b = bin(size);
      assert!(b >= prev, "bin({size}) = {b} < {prev}");
      prev = b;
    }
    assert!(bin(LARGE_OBJ_SIZE_MAX) < BIN_HUGE);
    assert_eq!(prev, BIN_HUGE);
  }

  #[test]
  fn bin_size_is_the_largest_member() {
    for b in [1u8, 2, 4, 6, 8].into_iter().chain(9..=bin(LARGE_OBJ_SIZE_MAX)) {
      let top = bin_size(b);
      assert_eq!(bin(top), b, "bin {b}");
      assert!(bin(top + 1) > b, "bin {b}");
    }
  }

  #[test]
  fn bin_sizes_strictly_increase() {
    for b in 2..BIN_HUGE {
      assert!(bin_size(b) > bin_size(b - 1), "bin {b}");
    }
    assert!(bin_size(BIN_HUGE) > LARGE_OBJ_SIZE_MAX);
    assert_eq!(bin_size(BIN_FULL), LARGE_OBJ_SIZE_MAX + 2 * WORD_SIZE);
  }

  #[test]
  fn good_size_rounds_up() {
    assert_eq!(good_size(1), WORD_SIZE);
    assert_eq!(good_size(3 * WORD_SIZE), 4 * WORD_SIZE);
    assert_eq!(good_size(9 * WORD_SIZE), 10 * WORD_SIZE);
    let big = LARGE_OBJ_SIZE_MAX + 1;
    assert!(good_size(big) >= big);
    assert_eq!(good_size(big) % os::page_size(), 0);
  }
}
