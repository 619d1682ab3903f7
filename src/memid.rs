//! Provenance tag of a block allocation.

use crate::bitmap::BitmapIndex;

/// Arena indices must stay below this to fit the one-byte tag.
pub const ARENA_INDEX_LIMIT: usize = 0xFE;

const ARENA_TAG_BITS: u32 = 8;
const ARENA_TAG_MASK: usize = (1 << ARENA_TAG_BITS) - 1;

/// Where an allocation's memory came from.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MemId {
  /// Mapped directly from the OS.
  Os,
  /// A block range inside a registered arena.
  Arena {
    arena_index: usize,
    bitmap_index: BitmapIndex,
  },
}

impl MemId {
  #[inline]
  pub const fn arena(arena_index: usize, bitmap_index: BitmapIndex) -> Self {
    debug_assert!(arena_index < ARENA_INDEX_LIMIT);
    MemId::Arena {
      arena_index,
      bitmap_index,
    }
  }

  #[inline]
  pub const fn is_os(self) -> bool {
    matches!(self, MemId::Os)
  }

  /// Packs the id into one word: zero for the OS, otherwise the bitmap
  /// index shifted above a one-byte `arena_index + 1`.
  pub const fn to_raw(self) -> usize {
    match self {
      MemId::Os => 0,
      MemId::Arena {
        arena_index,
        bitmap_index,
      } => {
        let bit = bitmap_index.bit();
        debug_assert!((bit << ARENA_TAG_BITS) >> ARENA_TAG_BITS == bit);
        (bit << ARENA_TAG_BITS) | ((arena_index + 1) & ARENA_TAG_MASK)
      }
    }
  }

  /// Inverse of [`MemId::to_raw`]. `None` for words no arena id encodes to.
  pub const fn from_raw(raw: usize) -> Option<Self> {
    if raw == 0 {
      return Some(MemId::Os);
    }
    let tag = raw & ARENA_TAG_MASK;
    if tag == 0 || tag > ARENA_INDEX_LIMIT {
      return None;
    }
    Some(MemId::Arena {
      arena_index: tag - 1,
      bitmap_index: BitmapIndex::from_bit(raw >> ARENA_TAG_BITS),
    })
  }
}
