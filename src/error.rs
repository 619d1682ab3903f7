//! Error types.

use thiserror::Error;

use crate::config::CorruptionPolicy;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
  #[error("invalid argument: {0}")]
  InvalidArgument(&'static str),

  /// Neither an arena nor the OS could satisfy the request.
  #[error("out of memory")]
  OutOfMemory,

  #[error("heap corruption: {0}")]
  Corruption(#[from] Corruption),
}

/// Detected misuse that leaves allocator metadata untrustworthy.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
  #[error("free from non-existent arena {arena_index} (ptr {ptr:#x}, memid {memid:#x})")]
  UnknownArena {
    arena_index: usize,
    ptr: usize,
    memid: usize,
  },

  #[error(
    "free of non-existent arena block: field {field} of {field_count} (ptr {ptr:#x}, memid {memid:#x})"
  )]
  BlockOutOfRange {
    field: usize,
    field_count: usize,
    ptr: usize,
    memid: usize,
  },

  #[error("double free of arena block (ptr {ptr:#x}, size {size})")]
  DoubleFree { ptr: usize, size: usize },

  #[error("page {page} released twice")]
  PageDoubleRelease { page: u32 },
}

/// Hands `corruption` to the diagnostics sink, then applies `policy`.
#[cold]
pub(crate) fn report(corruption: Corruption, policy: CorruptionPolicy) -> Error {
  log::error!("{corruption}");
  if policy == CorruptionPolicy::Abort {
    std::process::abort();
  }
  Error::Corruption(corruption)
}
