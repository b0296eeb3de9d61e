//! Segregated free lists for small blocks.
//!
//! One circular doubly linked list per 8-byte size class. Each list is headed
//! by a sentinel whose link words sit in the arena prefix, before the first
//! block, so the directory itself needs no memory outside the arena.

use crate::{
  align_up,
  arena::{Arena, WORD},
  block::{ALIGN, Block, HEADER_SIZE},
};

pub(crate) const SMALL_CLASSES: usize = 32;

/// Blocks strictly below this size are small.
pub const SMALL_LIMIT: usize = SMALL_CLASSES * ALIGN;

/// End of the sentinel prefix: the first block of every arena starts here.
pub(crate) const SENTINELS_END: usize =
  align_up(sentinel(SMALL_CLASSES - 1).offset() + HEADER_SIZE + 2 * WORD, ALIGN);

/// Pseudo-block whose `next`/`prev` words head the list of `class`. Only the
/// link words of a sentinel are ever touched.
#[inline]
const fn sentinel(class: usize) -> Block {
  Block::at(class * 2 * WORD)
}

#[inline]
pub(crate) const fn is_small(size: usize) -> bool {
  size < SMALL_LIMIT
}

#[inline]
pub(crate) const fn class_of(size: usize) -> usize {
  size >> 3
}

pub(crate) struct SmallBins {
  /// Bit `k` is set while class `k` is non-empty.
  bits: u32,
}

impl SmallBins {
  /// Writes empty sentinels into the arena prefix.
  pub(crate) fn new(arena: &mut Arena) -> Self {
    for class in 0..SMALL_CLASSES {
      let head = sentinel(class);
      arena.set_next(head, head);
      arena.set_prev(head, head);
    }
    Self { bits: 0 }
  }

  #[inline]
  pub(crate) fn has(&self, class: usize) -> bool {
    debug_assert!(class < SMALL_CLASSES);
    (self.bits >> class) & 1 != 0
  }

  /// Inserts a free block at the head of its class.
  pub(crate) fn push(&mut self, arena: &mut Arena, block: Block) {
    let class = class_of(arena.size(block));
    debug_assert!(class < SMALL_CLASSES);

    let head = sentinel(class);
    let next = arena.next(head);
    arena.set_next(head, block);
    arena.set_prev(next, block);
    arena.set_next(block, next);
    arena.set_prev(block, head);

    self.bits |= 1 << class;
  }

  /// Takes the most recently pushed block of `class`.
  pub(crate) fn pop(&mut self, arena: &mut Arena, class: usize) -> Option<Block> {
    if !self.has(class) {
      return None;
    }
    let block = arena.next(sentinel(class));
    debug_assert_ne!(block, sentinel(class));
    self.unlink(arena, block);
    Some(block)
  }

  /// Removes `block` from whichever position of its list it occupies.
  pub(crate) fn unlink(&mut self, arena: &mut Arena, block: Block) {
    let class = class_of(arena.size(block));
    debug_assert!(self.has(class));

    let next = arena.next(block);
    let prev = arena.prev(block);

    // Both neighbours are the sentinel: the list is now empty.
    if next == prev {
      self.bits &= !(1 << class);
    }

    arena.set_prev(next, prev);
    arena.set_next(prev, next);
  }

  /// Walks the list of `class`, giving up after `limit` members.
  pub(crate) fn walk(&self, arena: &Arena, class: usize, limit: usize, mut f: impl FnMut(Block)) -> usize {
    let head = sentinel(class);
    let mut at = arena.next(head);
    let mut count = 0;
    while at != head && count < limit {
      f(at);
      count += 1;
      at = arena.next(at);
    }
    count
  }
}
