#![allow(clippy::missing_safety_doc)]
//! Boundary-tag `malloc` for multithreaded programs.
//!
//! An [`Allocator`] owns a fixed ring of pools. Each pool is one reserved
//! region carved front to back, with exact-size free lists for small blocks,
//! best-fit tries for large ones and a wilderness block at the end. Threads
//! are bound to a home pool on first use; a pool that is locked or full hands
//! the request to the next one in the ring instead of blocking.
//!
//! [`RingAlloc`] is the process-wide instance for `#[global_allocator]`.

use core::{
  alloc::{GlobalAlloc, Layout},
  ptr::{self, null_mut},
};
use std::sync::OnceLock;

mod allocator;
mod arena;
mod block;
mod error;
mod large;
mod platform;
mod pool;
mod small;

pub use allocator::Allocator;
pub use block::HEADER_SIZE;
pub use error::{AllocError, Corruption};
pub use pool::PoolStats;
pub use small::SMALL_LIMIT;

use arena::WORD;
use block::ALIGN;

// =============================================================================
// Constants
// =============================================================================

/// Pools per allocator unless another count is named.
pub const MAX_POOLS: usize = 64;

/// Per-pool capacity used by [`Allocator::new`] and [`RingAlloc`].
pub const DEFAULT_POOL_CAPACITY: usize = 16 << 20; // 16MB

/// Largest per-pool capacity the large size classes can index.
pub const MAX_POOL_CAPACITY: usize = 1 << 31; // 2GB

// =============================================================================
// Compile-time assertions
// =============================================================================

const _: () = assert!(MAX_POOLS <= u32::MAX as usize);
const _: () = assert!(DEFAULT_POOL_CAPACITY <= MAX_POOL_CAPACITY);
const _: () = assert!((MAX_POOL_CAPACITY.ilog2() as usize) < large::LARGE_CLASSES);
const _: () = assert!(block::MIN_BLOCK_SIZE < SMALL_LIMIT);
const _: () = assert!(block::TREE_LINKS_END <= SMALL_LIMIT); // large blocks hold trie links
const _: () = assert!(small::SENTINELS_END % ALIGN == 0);

// =============================================================================
// GlobalAlloc
// =============================================================================

/// Alignments above 8 bytes over-allocate by `align` and keep the pointer
/// `malloc` returned in the word just below the aligned address.
unsafe impl<const POOLS: usize> GlobalAlloc for Allocator<POOLS> {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() <= ALIGN {
      return self.malloc(layout.size());
    }

    let Some(padded) = layout.size().checked_add(layout.align()) else {
      return null_mut();
    };
    let raw = self.malloc(padded);
    if raw.is_null() {
      return raw;
    }

    let shift = align_up(raw as usize + WORD, layout.align()) - raw as usize;
    unsafe {
      let aligned = raw.add(shift);
      aligned.cast::<*mut u8>().sub(1).write(raw);
      aligned
    }
  }

  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    unsafe { self.free(unaligned(ptr, layout)) }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    let raw = unsafe { unaligned(ptr, layout) };
    let usable = unsafe { self.usable_size(raw) }.saturating_sub(ptr as usize - raw as usize);
    if usable >= new_size {
      return ptr;
    }

    let new_ptr =
      unsafe { self.alloc(Layout::from_size_align_unchecked(new_size, layout.align())) };

    if !new_ptr.is_null() {
      unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size)) };
      unsafe { self.dealloc(ptr, layout) };
    }

    new_ptr
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}

/// Pointer that `malloc` returned for an allocation made with `layout`.
#[inline]
unsafe fn unaligned(ptr: *mut u8, layout: Layout) -> *mut u8 {
  if ptr.is_null() || layout.align() <= ALIGN {
    ptr
  } else {
    unsafe { ptr.cast::<*mut u8>().sub(1).read() }
  }
}

// =============================================================================
// Process-wide instance
// =============================================================================

static GLOBAL: OnceLock<Option<Allocator>> = OnceLock::new();

/// The process-wide [`Allocator`], built with [`DEFAULT_POOL_CAPACITY`] on the
/// first allocation.
///
/// ```ignore
/// #[global_allocator]
/// static A: ringalloc::RingAlloc = ringalloc::RingAlloc;
/// ```
pub struct RingAlloc;

impl RingAlloc {
  fn get() -> Option<&'static Allocator> {
    GLOBAL
      .get_or_init(|| Allocator::build(DEFAULT_POOL_CAPACITY).ok())
      .as_ref()
  }

  /// Bytes usable behind `ptr`. Null gives 0.
  pub unsafe fn usable_size(ptr: *mut u8) -> usize {
    match GLOBAL.get() {
      Some(Some(a)) => unsafe { a.usable_size(ptr) },
      _ => 0,
    }
  }
}

unsafe impl GlobalAlloc for RingAlloc {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    Self::get().map_or(null_mut(), |a| unsafe { a.alloc(layout) })
  }

  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    // Nothing was ever handed out without the instance.
    if let Some(Some(a)) = GLOBAL.get() {
      unsafe { a.dealloc(ptr, layout) }
    }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    Self::get().map_or(null_mut(), |a| unsafe { a.realloc(ptr, layout, new_size) })
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    Self::get().map_or(null_mut(), |a| unsafe { a.alloc_zeroed(layout) })
  }
}

pub unsafe fn ring_malloc(size: usize) -> *mut u8 {
  unsafe { RingAlloc.alloc(Layout::from_size_align_unchecked(size.max(1), ALIGN)) }
}

pub unsafe fn ring_free(ptr: *mut u8) {
  unsafe { RingAlloc.dealloc(ptr, Layout::from_size_align_unchecked(1, 1)) }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  unsafe { ring_malloc(size) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  unsafe { ring_free(ptr) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  let Some(total) = nmemb.checked_mul(size) else {
    return null_mut();
  };
  unsafe { RingAlloc.alloc_zeroed(Layout::from_size_align_unchecked(total.max(1), ALIGN)) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  if ptr.is_null() {
    return unsafe { ring_malloc(size) };
  }

  if size == 0 {
    unsafe { ring_free(ptr) };
    return null_mut();
  }

  // C realloc lacks the old size: everything usable is live.
  let old = unsafe { RingAlloc::usable_size(ptr) };
  unsafe { RingAlloc.realloc(ptr, Layout::from_size_align_unchecked(old, ALIGN), size) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  unsafe { RingAlloc::usable_size(ptr) }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
