//! Runtime configuration.

use core::time::Duration;

use crate::memid::ARENA_INDEX_LIMIT;

/// Default arena registry capacity.
pub const MAX_ARENAS: usize = 64;

/// What to do after detecting corrupted allocator metadata.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum CorruptionPolicy {
  /// Log the corruption and return it to the caller.
  #[default]
  Report,
  /// Log the corruption and abort the process.
  Abort,
}

#[derive(Clone, Debug)]
pub struct Config {
  /// Capacity of the arena registry. Clamped to what a memid can encode.
  pub max_arenas: usize,
  pub corruption: CorruptionPolicy,
  /// Extra time given to each node when an interleaved huge page
  /// reservation splits its timeout across NUMA nodes.
  pub interleave_timeout_slack: Duration,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      max_arenas: MAX_ARENAS,
      corruption: CorruptionPolicy::Report,
      interleave_timeout_slack: Duration::from_millis(50),
    }
  }
}

impl Config {
  pub(crate) fn arena_capacity(&self) -> usize {
    self.max_arenas.clamp(1, ARENA_INDEX_LIMIT)
  }
}
