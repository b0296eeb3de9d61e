//! Word-level access to a pool's memory by byte offset.
//!
//! This is the only module that turns offsets into loads and stores. The block
//! engine above it never holds a raw pointer: blocks, list links and tree links
//! are all offsets from the arena base, and user pointers are converted at the
//! edge with [`Arena::user_pointer`] and [`Arena::offset_of`].

use core::{mem::size_of, ptr::NonNull};

use crate::platform::Region;

pub(crate) const WORD: usize = size_of::<usize>();

pub(crate) struct Arena {
  region: Region,
}

impl Arena {
  pub(crate) fn new(region: Region) -> Self {
    debug_assert_eq!(region.base().as_ptr() as usize % WORD, 0);
    Self { region }
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.region.len()
  }

  #[inline]
  fn word_ptr(&self, at: usize) -> *mut usize {
    // Kept in release builds: a corrupt offset must not become a wild access.
    assert!(
      at % WORD == 0 && at <= self.len() - WORD,
      "bad arena offset {at:#x}, end {:#x}",
      self.len()
    );
    unsafe { self.region.base().as_ptr().add(at).cast::<usize>() }
  }

  /// Reads the word at byte offset `at`.
  #[inline]
  pub(crate) fn load(&self, at: usize) -> usize {
    unsafe { self.word_ptr(at).read() }
  }

  /// Writes the word at byte offset `at`.
  #[inline]
  pub(crate) fn store(&mut self, at: usize, value: usize) {
    unsafe { self.word_ptr(at).write(value) }
  }

  /// Address of byte offset `at`.
  #[inline]
  pub(crate) fn user_pointer(&self, at: usize) -> NonNull<u8> {
    assert!(at < self.len(), "arena offset {at:#x} past end {:#x}", self.len());
    unsafe { self.region.base().add(at) }
  }

  /// Byte offset of `ptr`, which must point into this arena.
  #[inline]
  pub(crate) fn offset_of(&self, ptr: NonNull<u8>) -> usize {
    debug_assert!(self.contains(ptr), "{ptr:p} is not inside this arena");
    ptr.as_ptr() as usize - self.region.base().as_ptr() as usize
  }

  #[inline]
  pub(crate) fn contains(&self, ptr: NonNull<u8>) -> bool {
    let base = self.region.base().as_ptr() as usize;
    let addr = ptr.as_ptr() as usize;
    addr >= base && addr < base + self.len()
  }
}

#[cfg(test)]
pub(crate) fn scratch(bytes: usize) -> Arena {
  Arena::new(Region::reserve(bytes).unwrap())
}
