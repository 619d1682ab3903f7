//! Atomic primitives with an explicit memory-ordering argument.
//!
//! Every operation takes a [`MemOrder`], which is translated into the
//! strongest `core::sync::atomic::Ordering` that is legal for that kind of
//! access. A release load is therefore a relaxed load and an acquire store is
//! a relaxed store, so none of these calls can panic on an ordering mismatch.

use core::{
  hint,
  ptr,
  sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicU8, AtomicU32, AtomicUsize, Ordering},
};

/// Ordering requested by the caller.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MemOrder {
  Relaxed,
  Acquire,
  Release,
  AcqRel,
}

impl MemOrder {
  /// Ordering for a plain load.
  #[inline(always)]
  pub const fn for_load(self) -> Ordering {
    match self {
      MemOrder::Relaxed | MemOrder::Release => Ordering::Relaxed,
      MemOrder::Acquire | MemOrder::AcqRel => Ordering::Acquire,
    }
  }

  /// Ordering for a plain store.
  #[inline(always)]
  pub const fn for_store(self) -> Ordering {
    match self {
      MemOrder::Relaxed | MemOrder::Acquire => Ordering::Relaxed,
      MemOrder::Release | MemOrder::AcqRel => Ordering::Release,
    }
  }

  /// Ordering for a read-modify-write, including the success side of a CAS.
  #[inline(always)]
  pub const fn for_rmw(self) -> Ordering {
    match self {
      MemOrder::Relaxed => Ordering::Relaxed,
      MemOrder::Acquire => Ordering::Acquire,
      MemOrder::Release => Ordering::Release,
      MemOrder::AcqRel => Ordering::AcqRel,
    }
  }

  /// Ordering for the failure side of a CAS (a load).
  #[inline(always)]
  pub const fn for_failure(self) -> Ordering {
    self.for_load()
  }
}

// =============================================================================
// Load / store / exchange / CAS
// =============================================================================

/// Word-sized cell with load, store, exchange and compare-and-swap.
///
/// The CAS methods follow the C convention: on failure `expected` is
/// overwritten with the value that was observed, so retry loops do not need a
/// separate reload.
pub trait AtomicCell {
  type Value: Copy + PartialEq;

  fn get(&self, order: MemOrder) -> Self::Value;
  fn set(&self, value: Self::Value, order: MemOrder);
  fn replace(&self, value: Self::Value, order: MemOrder) -> Self::Value;
  fn cas_weak(&self, expected: &mut Self::Value, desired: Self::Value, order: MemOrder) -> bool;
  fn cas_strong(&self, expected: &mut Self::Value, desired: Self::Value, order: MemOrder)
  -> bool;
}

/// Integer cells: arithmetic and bitwise read-modify-write. All return the
/// previous value.
pub trait AtomicArith: AtomicCell {
  fn add(&self, value: Self::Value, order: MemOrder) -> Self::Value;
  fn sub(&self, value: Self::Value, order: MemOrder) -> Self::Value;
  fn and(&self, value: Self::Value, order: MemOrder) -> Self::Value;
  fn or(&self, value: Self::Value, order: MemOrder) -> Self::Value;
}

macro_rules! atomic_cell {
  ($atomic:ty, $value:ty) => {
    impl AtomicCell for $atomic {
      type Value = $value;

      #[inline(always)]
      fn get(&self, order: MemOrder) -> $value {
        self.load(order.for_load())
      }

      #[inline(always)]
      fn set(&self, value: $value, order: MemOrder) {
        self.store(value, order.for_store())
      }

      #[inline(always)]
      fn replace(&self, value: $value, order: MemOrder) -> $value {
        self.swap(value, order.for_rmw())
      }

      #[inline(always)]
      fn cas_weak(&self, expected: &mut $value, desired: $value, order: MemOrder) -> bool {
        match self.compare_exchange_weak(*expected, desired, order.for_rmw(), order.for_failure()) {
          Ok(_) => true,
          Err(seen) => {
            *expected = seen;
            false
          }
        }
      }

      #[inline(always)]
      fn cas_strong(&self, expected: &mut $value, desired: $value, order: MemOrder) -> bool {
        match self.compare_exchange(*expected, desired, order.for_rmw(), order.for_failure()) {
          Ok(_) => true,
          Err(seen) => {
            *expected = seen;
            false
          }
        }
      }
    }
  };
}

macro_rules! atomic_arith {
  ($atomic:ty, $value:ty) => {
    atomic_cell!($atomic, $value);

    impl AtomicArith for $atomic {
      #[inline(always)]
      fn add(&self, value: $value, order: MemOrder) -> $value {
        self.fetch_add(value, order.for_rmw())
      }

      #[inline(always)]
      fn sub(&self, value: $value, order: MemOrder) -> $value {
        self.fetch_sub(value, order.for_rmw())
      }

      #[inline(always)]
      fn and(&self, value: $value, order: MemOrder) -> $value {
        self.fetch_and(value, order.for_rmw())
      }

      #[inline(always)]
      fn or(&self, value: $value, order: MemOrder) -> $value {
        self.fetch_or(value, order.for_rmw())
      }
    }
  };
}

atomic_arith!(AtomicUsize, usize);
atomic_arith!(AtomicU32, u32);
atomic_arith!(AtomicU8, u8);
atomic_cell!(AtomicBool, bool);

impl<T> AtomicCell for AtomicPtr<T> {
  type Value = *mut T;

  #[inline(always)]
  fn get(&self, order: MemOrder) -> *mut T {
    self.load(order.for_load())
  }

  #[inline(always)]
  fn set(&self, value: *mut T, order: MemOrder) {
    self.store(value, order.for_store())
  }

  #[inline(always)]
  fn replace(&self, value: *mut T, order: MemOrder) -> *mut T {
    self.swap(value, order.for_rmw())
  }

  #[inline(always)]
  fn cas_weak(&self, expected: &mut *mut T, desired: *mut T, order: MemOrder) -> bool {
    match self.compare_exchange_weak(*expected, desired, order.for_rmw(), order.for_failure()) {
      Ok(_) => true,
      Err(seen) => {
        *expected = seen;
        false
      }
    }
  }

  #[inline(always)]
  fn cas_strong(&self, expected: &mut *mut T, desired: *mut T, order: MemOrder) -> bool {
    match self.compare_exchange(*expected, desired, order.for_rmw(), order.for_failure()) {
      Ok(_) => true,
      Err(seen) => {
        *expected = seen;
        false
      }
    }
  }
}

/// Address held by a pointer cell, reinterpreted as a word.
#[inline(always)]
pub fn addr_of<T>(cell: &AtomicPtr<T>, order: MemOrder) -> usize {
  cell.get(order) as usize
}

/// Null-initialised pointer cell.
#[inline(always)]
pub const fn null_cell<T>() -> AtomicPtr<T> {
  AtomicPtr::new(ptr::null_mut())
}

// =============================================================================
// 64-bit counters
// =============================================================================

#[cfg(not(target_has_atomic = "64"))]
compile_error!("Counter64 needs a target with 64-bit atomics");

/// Signed 64-bit counter usable on both 32- and 64-bit targets.
///
/// Needs a 64-bit atomic, which common 32-bit targets (x86, ARMv7) provide
/// through double-word compare-and-swap; there `fetch_add` compiles to a CAS
/// retry loop that recomputes the sum from the value the winning thread left
/// behind. Targets without any 64-bit atomic are rejected at compile time.
#[derive(Debug, Default)]
pub struct Counter64 {
  value: AtomicI64,
}

impl Counter64 {
  pub const fn new(value: i64) -> Self {
    Self {
      value: AtomicI64::new(value),
    }
  }

  #[inline]
  pub fn get(&self, order: MemOrder) -> i64 {
    self.value.load(order.for_load())
  }

  #[inline]
  pub fn set(&self, value: i64, order: MemOrder) {
    self.value.store(value, order.for_store())
  }

  /// Adds `delta` and returns the previous value.
  #[inline]
  pub fn add(&self, delta: i64, order: MemOrder) -> i64 {
    self.value.fetch_add(delta, order.for_rmw())
  }

  #[inline]
  pub fn sub(&self, delta: i64, order: MemOrder) -> i64 {
    self.add(delta.wrapping_neg(), order)
  }

  /// Raises the counter to `value` if it is currently lower. Returns the
  /// previous value.
  pub fn max(&self, value: i64, order: MemOrder) -> i64 {
    let mut current = self.value.load(Ordering::Relaxed);
    while current < value {
      match self.value.compare_exchange_weak(
        current,
        value,
        order.for_rmw(),
        order.for_failure(),
      ) {
        Ok(prev) => return prev,
        Err(seen) => current = seen,
      }
    }
    current
  }
}

/// Back off inside a CAS retry or wait loop.
#[inline(always)]
pub fn yield_now() {
  hint::spin_loop();
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{sync::Arc, thread};

  #[test]
  fn orderings_never_mix_load_and_store_kinds() {
    for order in [
      MemOrder::Relaxed,
      MemOrder::Acquire,
      MemOrder::Release,
      MemOrder::AcqRel,
    ] {
      assert!(matches!(
        order.for_load(),
        Ordering::Relaxed | Ordering::Acquire
      ));
      assert!(matches!(
        order.for_store(),
        Ordering::Relaxed | Ordering::Release
      ));
    }
    assert_eq!(MemOrder::AcqRel.for_rmw(), Ordering::AcqRel);
    assert_eq!(MemOrder::Release.for_failure(), Ordering::Relaxed);
  }

  #[test]
  fn cas_reports_observed_value_on_failure() {
    let cell = AtomicUsize::new(5);
    let mut expected = 3;
    assert!(!cell.cas_strong(&mut expected, 9, MemOrder::AcqRel));
    assert_eq!(expected, 5);
    assert!(cell.cas_strong(&mut expected, 9, MemOrder::AcqRel));
    assert_eq!(cell.get(MemOrder::Acquire), 9);
  }

  #[test]
  fn weak_cas_eventually_succeeds() {
    let cell = AtomicU32::new(1);
    let mut expected = 1;
    while !cell.cas_weak(&mut expected, 2, MemOrder::Release) {
      assert_eq!(expected, 1);
    }
    assert_eq!(cell.get(MemOrder::Relaxed), 2);
  }

  #[test]
  fn bitwise_ops_return_previous() {
    let cell = AtomicUsize::new(0b1100);
    assert_eq!(cell.or(0b0011, MemOrder::AcqRel), 0b1100);
    assert_eq!(cell.and(!0b0100, MemOrder::AcqRel), 0b1111);
    assert_eq!(cell.get(MemOrder::Relaxed), 0b1011);
    assert_eq!(cell.add(1, MemOrder::Relaxed), 0b1011);
    assert_eq!(cell.sub(2, MemOrder::Relaxed), 0b1100);
    assert_eq!(cell.replace(7, MemOrder::AcqRel), 0b1010);
  }

  #[test]
  fn pointer_cells_reinterpret_address() {
    let mut slot = 0u64;
    let cell: AtomicPtr<u64> = null_cell();
    assert_eq!(addr_of(&cell, MemOrder::Acquire), 0);
    cell.set(&mut slot, MemOrder::Release);
    assert_eq!(addr_of(&cell, MemOrder::Acquire), &slot as *const u64 as usize);
  }

  #[test]
  fn counter_is_linearizable_under_contention() {
    let counter = Arc::new(Counter64::new(0));
    let handles: Vec<_> = (0..4)
      .map(|_| {
        let counter = Arc::clone(&counter);
        thread::spawn(move || {
          for _ in 0..10_000 {
            counter.add(3, MemOrder::Relaxed);
            counter.sub(1, MemOrder::Relaxed);
          }
        })
      })
      .collect();
    for handle in handles {
      handle.join().unwrap();
    }
    assert_eq!(counter.get(MemOrder::Relaxed), 4 * 10_000 * 2);
  }

  #[test]
  fn counter_max_only_raises() {
    let counter = Counter64::new(10);
    assert_eq!(counter.max(4, MemOrder::Relaxed), 10);
    assert_eq!(counter.get(MemOrder::Relaxed), 10);
    assert_eq!(counter.max(40, MemOrder::Relaxed), 10);
    assert_eq!(counter.get(MemOrder::Relaxed), 40);
    assert_eq!(counter.add(1i64 << 40, MemOrder::Relaxed), 40);
    assert_eq!(counter.get(MemOrder::Relaxed), 40 + (1i64 << 40));
  }
}
