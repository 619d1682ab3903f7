//! OS memory collaborator.
//!
//! The arena layer only talks to the OS through [`OsMemory`]; [`SystemOs`]
//! implements it with `mmap` and friends.

use core::{
  ptr::{NonNull, null_mut},
  time::Duration,
};
use std::{io, sync::OnceLock, time::Instant};

use crate::align_up;

/// Size of one huge OS page handed out by [`OsMemory::alloc_huge_pages`].
pub const HUGE_OS_PAGE_SIZE: usize = 1 << 30; // 1GB

/// Size of a large OS page (transparent or explicit 2MB pages).
pub const LARGE_OS_PAGE_SIZE: usize = 1 << 21; // 2MB

/// Result of a plain OS allocation.
#[derive(Clone, Copy, Debug)]
pub struct OsAlloc {
  pub ptr: NonNull<u8>,
  /// Backed by large OS pages.
  pub large: bool,
}

/// A run of huge OS pages. `pages` may be less than requested.
#[derive(Clone, Copy, Debug)]
pub struct HugeRegion {
  pub ptr: NonNull<u8>,
  pub pages: usize,
  pub size: usize,
}

pub trait OsMemory: Send + Sync {
  /// Maps `size` bytes aligned to `alignment`. Without `commit` the range is
  /// only reserved. `allow_large` permits large OS pages.
  fn alloc_aligned(
    &self,
    size: usize,
    alignment: usize,
    commit: bool,
    allow_large: bool,
  ) -> Option<OsAlloc>;

  /// Unmaps a range returned by [`OsMemory::alloc_aligned`].
  ///
  /// # Safety
  ///
  /// `ptr` and `size` must describe a live range from `alloc_aligned` on this
  /// object that nobody accesses afterwards.
  unsafe fn free(&self, ptr: NonNull<u8>, size: usize, was_committed: bool);

  /// Makes a reserved range accessible. Returns whether it reads as zero.
  ///
  /// # Safety
  ///
  /// The range must lie inside memory obtained from this object.
  unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> io::Result<bool>;

  /// Maps up to `pages` huge OS pages, preferring `numa_node`. Gives up
  /// between pages once `timeout` (zero: no limit) is exceeded.
  fn alloc_huge_pages(
    &self,
    pages: usize,
    numa_node: Option<usize>,
    timeout: Duration,
  ) -> Option<HugeRegion>;

  /// # Safety
  ///
  /// `ptr` and `size` must describe a region from `alloc_huge_pages`.
  unsafe fn free_huge_pages(&self, ptr: NonNull<u8>, size: usize);

  fn numa_node_count(&self) -> usize;

  /// Node of the calling thread, always below [`OsMemory::numa_node_count`].
  fn current_numa_node(&self) -> usize;
}

// =============================================================================
// Platform
// =============================================================================

/// OS page size.
pub fn page_size() -> usize {
  static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
  *PAGE_SIZE.get_or_init(|| {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
  })
}

unsafe fn os_mmap(addr: *mut u8, size: usize, prot: i32, flags: i32) -> *mut u8 {
  let ptr = unsafe { libc::mmap(addr.cast(), size, prot, flags, -1, 0) };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  if size == 0 {
    return;
  }
  if unsafe { libc::munmap(ptr.cast(), size) } != 0 {
    log::warn!(
      "munmap failed: {} (addr {:p}, size {:#x})",
      io::Error::last_os_error(),
      ptr,
      size
    );
  }
}

const PROT_RW: i32 = libc::PROT_READ | libc::PROT_WRITE;
const MAP_ANON: i32 = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;

#[cfg(target_os = "linux")]
const MAP_LARGE: i32 = libc::MAP_HUGETLB;
#[cfg(target_os = "linux")]
const MAP_HUGE_1GB: i32 = libc::MAP_HUGETLB | libc::MAP_HUGE_1GB;

/// Memory from the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemOs;

impl SystemOs {
  /// Maps `size + alignment` bytes and trims the ends so that exactly `size`
  /// aligned bytes remain.
  unsafe fn map_aligned(size: usize, alignment: usize, prot: i32, flags: i32) -> *mut u8 {
    if alignment <= page_size() {
      return unsafe { os_mmap(null_mut(), size, prot, flags) };
    }
    let Some(total) = size.checked_add(alignment) else {
      return null_mut();
    };
    let raw = unsafe { os_mmap(null_mut(), total, prot, flags) };
    if raw.is_null() {
      return raw;
    }
    let aligned = align_up(raw as usize, alignment);
    let pre = aligned - raw as usize;
    let post = total - pre - size;
    unsafe {
      os_munmap(raw, pre);
      os_munmap((aligned + size) as *mut u8, post);
    }
    aligned as *mut u8
  }

  #[cfg(target_os = "linux")]
  fn bind_to_node(ptr: *mut u8, size: usize, numa_node: usize) {
    const MPOL_PREFERRED: libc::c_long = 1;
    if numa_node >= usize::BITS as usize {
      return;
    }
    let mask: libc::c_ulong = 1 << numa_node;
    let err = unsafe {
      libc::syscall(
        libc::SYS_mbind,
        ptr,
        size,
        MPOL_PREFERRED,
        &mask as *const libc::c_ulong,
        usize::BITS as libc::c_ulong,
        0 as libc::c_uint,
      )
    };
    if err != 0 {
      log::warn!(
        "failed to bind huge pages to numa node {numa_node}: {}",
        io::Error::last_os_error()
      );
    }
  }
}

impl OsMemory for SystemOs {
  fn alloc_aligned(
    &self,
    size: usize,
    alignment: usize,
    commit: bool,
    allow_large: bool,
  ) -> Option<OsAlloc> {
    let size = align_up(size, page_size());
    let prot = if commit { PROT_RW } else { libc::PROT_NONE };

    #[cfg(target_os = "linux")]
    if allow_large
      && commit
      && size % LARGE_OS_PAGE_SIZE == 0
      && alignment <= LARGE_OS_PAGE_SIZE
    {
      let ptr = unsafe { os_mmap(null_mut(), size, prot, MAP_ANON | MAP_LARGE) };
      if let Some(ptr) = NonNull::new(ptr) {
        return Some(OsAlloc { ptr, large: true });
      }
      log::trace!("large page mmap of {size:#x} bytes failed, using regular pages");
    }
    #[cfg(not(target_os = "linux"))]
    let _ = allow_large;

    let ptr = unsafe { Self::map_aligned(size, alignment, prot, MAP_ANON) };
    match NonNull::new(ptr) {
      Some(ptr) => Some(OsAlloc { ptr, large: false }),
      None => {
        log::warn!(
          "mmap of {size:#x} bytes failed: {}",
          io::Error::last_os_error()
        );
        None
      }
    }
  }

  unsafe fn free(&self, ptr: NonNull<u8>, size: usize, _was_committed: bool) {
    unsafe { os_munmap(ptr.as_ptr(), align_up(size, page_size())) };
  }

  unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> io::Result<bool> {
    let err = unsafe { libc::mprotect(ptr.as_ptr().cast(), size, PROT_RW) };
    if err != 0 {
      return Err(io::Error::last_os_error());
    }
    Ok(false)
  }

  #[cfg(target_os = "linux")]
  fn alloc_huge_pages(
    &self,
    pages: usize,
    numa_node: Option<usize>,
    timeout: Duration,
  ) -> Option<HugeRegion> {
    let size = pages.checked_mul(HUGE_OS_PAGE_SIZE)?;
    if size == 0 {
      return None;
    }

    // Reserve an aligned address range, then replace it page by page.
    let start = unsafe { Self::map_aligned(size, HUGE_OS_PAGE_SIZE, libc::PROT_NONE, MAP_ANON) };
    if start.is_null() {
      return None;
    }

    let began = Instant::now();
    let mut reserved = 0;
    while reserved < pages {
      let addr = unsafe { start.add(reserved * HUGE_OS_PAGE_SIZE) };
      let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED | MAP_HUGE_1GB;
      let p = unsafe { os_mmap(addr, HUGE_OS_PAGE_SIZE, PROT_RW, flags) };
      if p != addr {
        log::debug!(
          "huge page {reserved} could not be mapped: {}",
          io::Error::last_os_error()
        );
        break;
      }
      if let Some(node) = numa_node {
        Self::bind_to_node(p, HUGE_OS_PAGE_SIZE, node);
      }
      reserved += 1;

      if !timeout.is_zero() {
        let elapsed = began.elapsed();
        if elapsed > timeout {
          break;
        }
        // Stop early when the remaining pages will clearly not make it.
        let estimate = elapsed / reserved as u32 * pages as u32;
        if estimate > 2 * timeout {
          break;
        }
      }
    }

    unsafe {
      os_munmap(
        start.add(reserved * HUGE_OS_PAGE_SIZE),
        (pages - reserved) * HUGE_OS_PAGE_SIZE,
      )
    };
    let ptr = NonNull::new(start)?;
    (reserved > 0).then_some(HugeRegion {
      ptr,
      pages: reserved,
      size: reserved * HUGE_OS_PAGE_SIZE,
    })
  }

  #[cfg(not(target_os = "linux"))]
  fn alloc_huge_pages(
    &self,
    _pages: usize,
    _numa_node: Option<usize>,
    _timeout: Duration,
  ) -> Option<HugeRegion> {
    None
  }

  unsafe fn free_huge_pages(&self, ptr: NonNull<u8>, size: usize) {
    unsafe { os_munmap(ptr.as_ptr(), size) };
  }

  #[cfg(target_os = "linux")]
  fn numa_node_count(&self) -> usize {
    static NODES: OnceLock<usize> = OnceLock::new();
    *NODES.get_or_init(|| {
      let mut count = 0;
      while count < 256
        && std::path::Path::new(&format!("/sys/devices/system/node/node{count}")).exists()
      {
        count += 1;
      }
      count.max(1)
    })
  }

  #[cfg(not(target_os = "linux"))]
  fn numa_node_count(&self) -> usize {
    1
  }

  #[cfg(target_os = "linux")]
  fn current_numa_node(&self) -> usize {
    let count = self.numa_node_count();
    if count <= 1 {
      return 0;
    }
    let mut cpu: libc::c_uint = 0;
    let mut node: libc::c_uint = 0;
    let err = unsafe {
      libc::syscall(
        libc::SYS_getcpu,
        &mut cpu as *mut libc::c_uint,
        &mut node as *mut libc::c_uint,
        null_mut::<libc::c_void>(),
      )
    };
    if err != 0 { 0 } else { node as usize % count }
  }

  #[cfg(not(target_os = "linux"))]
  fn current_numa_node(&self) -> usize {
    0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn page_size_is_power_of_two() {
    assert!(page_size().is_power_of_two());
  }

  #[test]
  fn aligned_alloc_commit_free() {
    let os = SystemOs;
    let align = 1 << 22;
    let alloc = os.alloc_aligned(1 << 20, align, false, false).unwrap();
    assert_eq!(alloc.ptr.as_ptr() as usize % align, 0);
    assert!(!alloc.large);
    unsafe {
      os.commit(alloc.ptr, 1 << 20).unwrap();
      alloc.ptr.as_ptr().write(7);
      assert_eq!(alloc.ptr.as_ptr().read(), 7);
      os.free(alloc.ptr, 1 << 20, true);
    }
  }

  #[test]
  fn numa_node_in_range() {
    let os = SystemOs;
    assert!(os.numa_node_count() >= 1);
    assert!(os.current_numa_node() < os.numa_node_count());
  }
}
