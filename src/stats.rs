//! Counters fed by the arena layer. Never consulted for control flow.

use crate::atomic::{Counter64, MemOrder};

/// Current, peak and cumulative totals of one quantity.
#[derive(Debug, Default)]
pub struct StatCount {
  current: Counter64,
  peak: Counter64,
  allocated: Counter64,
  freed: Counter64,
}

impl StatCount {
  pub const fn new() -> Self {
    Self {
      current: Counter64::new(0),
      peak: Counter64::new(0),
      allocated: Counter64::new(0),
      freed: Counter64::new(0),
    }
  }

  pub fn increase(&self, amount: usize) {
    let amount = amount as i64;
    let current = self.current.add(amount, MemOrder::Relaxed) + amount;
    self.peak.max(current, MemOrder::Relaxed);
    self.allocated.add(amount, MemOrder::Relaxed);
  }

  pub fn decrease(&self, amount: usize) {
    let amount = amount as i64;
    self.current.sub(amount, MemOrder::Relaxed);
    self.freed.add(amount, MemOrder::Relaxed);
  }

  pub fn current(&self) -> i64 {
    self.current.get(MemOrder::Relaxed)
  }

  pub fn peak(&self) -> i64 {
    self.peak.get(MemOrder::Relaxed)
  }

  pub fn allocated(&self) -> i64 {
    self.allocated.get(MemOrder::Relaxed)
  }

  pub fn freed(&self) -> i64 {
    self.freed.get(MemOrder::Relaxed)
  }
}

#[derive(Debug, Default)]
pub struct Stats {
  /// Bytes of address space held by registered arenas.
  pub reserved: StatCount,
  /// Bytes committed on demand inside arenas.
  pub committed: StatCount,
  pub arenas: StatCount,
  /// Requests that bypassed the arenas and went to the OS.
  pub os_fallbacks: Counter64,
}
