//! Page provider. Hands out zeroed regions rounded up to the allocation
//! granularity and returns them to the OS when dropped.

use core::{
  ptr::NonNull,
  sync::atomic::{AtomicUsize, Ordering},
};

/// Allocation granularity, queried once.
static GRANULARITY: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn granularity() -> usize {
  let cached = GRANULARITY.load(Ordering::Relaxed);
  if cached != 0 {
    return cached;
  }
  let queried = os_granularity();
  GRANULARITY.store(queried, Ordering::Relaxed);
  queried
}

/// A reserved, committed and zeroed span of address space.
pub(crate) struct Region {
  base: NonNull<u8>,
  len: usize,
}

// The region is plain memory owned by whoever holds the `Region`.
unsafe impl Send for Region {}

impl Region {
  /// Reserves at least `bytes` bytes. Returns `None` if the OS refuses or the
  /// rounded length overflows.
  pub(crate) fn reserve(bytes: usize) -> Option<Self> {
    let granularity = granularity();
    let len = bytes.max(1).checked_add(granularity - 1)? & !(granularity - 1);
    let base = unsafe { os_map(len) };
    NonNull::new(base).map(|base| Self { base, len })
  }

  #[inline]
  pub(crate) fn base(&self) -> NonNull<u8> {
    self.base
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.len
  }
}

impl Drop for Region {
  fn drop(&mut self) {
    unsafe { os_unmap(self.base.as_ptr(), self.len) };
  }
}

// =============================================================================
// Platform
// =============================================================================

#[cfg(unix)]
unsafe fn os_map(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      core::ptr::null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    core::ptr::null_mut()
  } else {
    ptr as *mut u8
  }
}

#[cfg(unix)]
unsafe fn os_unmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

#[cfg(unix)]
fn os_granularity() -> usize {
  let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if page > 0 { page as usize } else { 4096 }
}

// Without mmap, borrow granule-aligned memory from the system allocator. It is
// never the global allocator, so this cannot recurse into us.
#[cfg(not(unix))]
const FALLBACK_GRANULARITY: usize = 1 << 16;

#[cfg(not(unix))]
unsafe fn os_map(size: usize) -> *mut u8 {
  use std::alloc::{GlobalAlloc, Layout, System};
  match Layout::from_size_align(size, FALLBACK_GRANULARITY) {
    Ok(layout) => unsafe { System.alloc_zeroed(layout) },
    Err(_) => core::ptr::null_mut(),
  }
}

#[cfg(not(unix))]
unsafe fn os_unmap(ptr: *mut u8, size: usize) {
  use std::alloc::{GlobalAlloc, Layout, System};
  unsafe { System.dealloc(ptr, Layout::from_size_align_unchecked(size, FALLBACK_GRANULARITY)) };
}

#[cfg(not(unix))]
fn os_granularity() -> usize {
  FALLBACK_GRANULARITY
}
