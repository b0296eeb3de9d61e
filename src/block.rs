//! Boundary-tag block header.
//!
//! Every block starts with three words:
//!
//! ```text
//! +-----------------------------+  <- block offset
//! | prev_size                   |     valid only while the previous block is free
//! +-----------------------------+
//! | size | PREV_IN_USE | IN_USE |     size is a multiple of 8, flags in the low bits
//! +-----------------------------+
//! | owner pool index            |
//! +-----------------------------+  <- user pointer
//! | next | prev                 |     free blocks only: list / duplicate ring links
//! | class | left | right | parent |   free large blocks only: trie links
//! +-----------------------------+
//! ```
//!
//! The link words live in what is the user payload while the block is
//! allocated, so they cost nothing for live blocks.

use core::ptr::NonNull;

use crate::{
  align_up,
  arena::{Arena, WORD},
};

/// All block sizes are multiples of this.
pub(crate) const ALIGN: usize = 8;

/// Per-block overhead in bytes.
pub const HEADER_SIZE: usize = 3 * WORD;

/// Smallest block that can hold the free-list links.
pub(crate) const MIN_BLOCK_SIZE: usize = align_up(HEADER_SIZE + 2 * WORD, ALIGN);

/// The block is allocated.
pub(crate) const CURR_IN_USE: usize = 1 << 0;
/// The physically preceding block is allocated.
pub(crate) const PREV_IN_USE: usize = 1 << 1;
const FLAGS: usize = CURR_IN_USE | PREV_IN_USE;

// Header words.
const PREV_SIZE: usize = 0;
const SIZE: usize = WORD;
const OWNER: usize = 2 * WORD;

// Link words, meaningful only while the block is free.
const NEXT: usize = HEADER_SIZE;
const PREV: usize = HEADER_SIZE + WORD;
const CLASS: usize = HEADER_SIZE + 2 * WORD;
const LIMBS: usize = HEADER_SIZE + 3 * WORD;
const PARENT: usize = HEADER_SIZE + 5 * WORD;

/// Bytes a free large block needs for its trie links.
pub(crate) const TREE_LINKS_END: usize = PARENT + WORD;

pub(crate) const LEFT: usize = 0;
pub(crate) const RIGHT: usize = 1;

const _: () = assert!(ALIGN >= 4, "flag bits must fit below the alignment");
const _: () = assert!(HEADER_SIZE % WORD == 0);

/// A block, named by the byte offset of its header inside its arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub(crate) struct Block(usize);

impl Block {
  /// Empty link. Offset 0 is inside the directory prefix, never a block.
  pub(crate) const NIL: Block = Block(0);

  #[inline]
  pub(crate) const fn at(offset: usize) -> Self {
    Self(offset)
  }

  #[inline]
  pub(crate) const fn offset(self) -> usize {
    self.0
  }

  #[inline]
  pub(crate) const fn is_nil(self) -> bool {
    self.0 == Self::NIL.0
  }
}

/// Block size needed to serve a request of `requested` bytes, or `None` if it
/// does not fit in a `usize`.
#[inline]
pub(crate) fn block_size(requested: usize) -> Option<usize> {
  let padded = requested.checked_add(HEADER_SIZE + ALIGN - 1)?;
  Some((padded & !(ALIGN - 1)).max(MIN_BLOCK_SIZE))
}

/// Reads the owner word of the live block behind `ptr`.
///
/// # Safety
///
/// `ptr` must be a user pointer handed out by a pool and not yet reused.
#[inline]
pub(crate) unsafe fn owner_of(ptr: NonNull<u8>) -> usize {
  unsafe { ptr.as_ptr().sub(HEADER_SIZE - OWNER).cast::<usize>().read() }
}

// =============================================================================
// Header access
// =============================================================================

impl Arena {
  #[inline]
  pub(crate) fn size(&self, block: Block) -> usize {
    self.load(block.0 + SIZE) & !FLAGS
  }

  /// Replaces the size, keeping both flags.
  #[inline]
  pub(crate) fn set_size(&mut self, block: Block, size: usize) {
    debug_assert_eq!(size % ALIGN, 0);
    let flags = self.load(block.0 + SIZE) & FLAGS;
    self.store(block.0 + SIZE, size | flags);
  }

  /// Overwrites size and flags at once, for headers whose old contents are
  /// stale.
  #[inline]
  pub(crate) fn set_tag(&mut self, block: Block, size: usize, flags: usize) {
    debug_assert_eq!(size % ALIGN, 0);
    debug_assert_eq!(flags & !FLAGS, 0);
    self.store(block.0 + SIZE, size | flags);
  }

  #[inline]
  pub(crate) fn prev_size(&self, block: Block) -> usize {
    self.load(block.0 + PREV_SIZE)
  }

  #[inline]
  pub(crate) fn set_prev_size(&mut self, block: Block, size: usize) {
    self.store(block.0 + PREV_SIZE, size);
  }

  #[inline]
  pub(crate) fn owner(&self, block: Block) -> usize {
    self.load(block.0 + OWNER)
  }

  #[inline]
  pub(crate) fn set_owner(&mut self, block: Block, pool: usize) {
    self.store(block.0 + OWNER, pool);
  }

  #[inline]
  pub(crate) fn in_use(&self, block: Block) -> bool {
    self.load(block.0 + SIZE) & CURR_IN_USE != 0
  }

  #[inline]
  pub(crate) fn prev_in_use(&self, block: Block) -> bool {
    self.load(block.0 + SIZE) & PREV_IN_USE != 0
  }

  #[inline]
  pub(crate) fn turn(&mut self, block: Block, flag: usize) {
    let word = self.load(block.0 + SIZE);
    self.store(block.0 + SIZE, word | flag);
  }

  #[inline]
  pub(crate) fn drop_flag(&mut self, block: Block, flag: usize) {
    let word = self.load(block.0 + SIZE);
    self.store(block.0 + SIZE, word & !flag);
  }

  #[inline]
  pub(crate) fn next_block(&self, block: Block) -> Block {
    Block(block.0 + self.size(block))
  }

  /// Only meaningful when `prev_in_use(block)` is false.
  #[inline]
  pub(crate) fn prev_block(&self, block: Block) -> Block {
    debug_assert!(!self.prev_in_use(block));
    Block(block.0 - self.prev_size(block))
  }

  #[inline]
  pub(crate) fn block_user_pointer(&self, block: Block) -> NonNull<u8> {
    self.user_pointer(block.0 + HEADER_SIZE)
  }

  #[inline]
  pub(crate) fn block_of(&self, ptr: NonNull<u8>) -> Block {
    Block(self.offset_of(ptr) - HEADER_SIZE)
  }

  // ===========================================================================
  // Free-block links
  // ===========================================================================

  #[inline]
  pub(crate) fn next(&self, block: Block) -> Block {
    Block(self.load(block.0 + NEXT))
  }

  #[inline]
  pub(crate) fn set_next(&mut self, block: Block, next: Block) {
    self.store(block.0 + NEXT, next.0);
  }

  #[inline]
  pub(crate) fn prev(&self, block: Block) -> Block {
    Block(self.load(block.0 + PREV))
  }

  #[inline]
  pub(crate) fn set_prev(&mut self, block: Block, prev: Block) {
    self.store(block.0 + PREV, prev.0);
  }

  #[inline]
  pub(crate) fn class(&self, block: Block) -> usize {
    self.load(block.0 + CLASS)
  }

  #[inline]
  pub(crate) fn set_class(&mut self, block: Block, class: usize) {
    self.store(block.0 + CLASS, class);
  }

  #[inline]
  pub(crate) fn child(&self, block: Block, side: usize) -> Block {
    debug_assert!(side <= RIGHT);
    Block(self.load(block.0 + LIMBS + side * WORD))
  }

  #[inline]
  pub(crate) fn set_child(&mut self, block: Block, side: usize, child: Block) {
    debug_assert!(side <= RIGHT);
    self.store(block.0 + LIMBS + side * WORD, child.0);
  }

  /// Left child if present, else right child.
  #[inline]
  pub(crate) fn leftmost_limb(&self, block: Block) -> Block {
    let left = self.child(block, LEFT);
    if left.is_nil() { self.child(block, RIGHT) } else { left }
  }

  #[inline]
  pub(crate) fn parent(&self, block: Block) -> Block {
    Block(self.load(block.0 + PARENT))
  }

  #[inline]
  pub(crate) fn set_parent(&mut self, block: Block, parent: Block) {
    self.store(block.0 + PARENT, parent.0);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arena::scratch;

  #[test]
  fn requests_round_up_to_aligned_blocks() {
    assert_eq!(block_size(0), Some(MIN_BLOCK_SIZE));
    assert_eq!(block_size(1), Some(MIN_BLOCK_SIZE));
    assert_eq!(block_size(17), Some(align_up(17 + HEADER_SIZE, ALIGN).max(MIN_BLOCK_SIZE)));
    assert_eq!(block_size(1000 - HEADER_SIZE), Some(1000));
    assert_eq!(block_size(1001 - HEADER_SIZE), Some(1008));
    assert_eq!(block_size(usize::MAX), None);
    assert_eq!(block_size(usize::MAX - HEADER_SIZE), None);
  }

  #[test]
  fn flags_do_not_leak_into_size() {
    let mut arena = scratch(4096);
    let block = Block::at(64);

    arena.set_tag(block, 48, PREV_IN_USE);
    assert_eq!(arena.size(block), 48);
    assert!(arena.prev_in_use(block));
    assert!(!arena.in_use(block));

    arena.turn(block, CURR_IN_USE);
    arena.set_size(block, 128);
    assert_eq!(arena.size(block), 128);
    assert!(arena.in_use(block));
    assert!(arena.prev_in_use(block));

    arena.drop_flag(block, PREV_IN_USE);
    assert!(!arena.prev_in_use(block));
    assert!(arena.in_use(block));
    assert_eq!(arena.size(block), 128);
  }

  #[test]
  fn neighbours_follow_boundary_tags() {
    let mut arena = scratch(4096);
    let first = Block::at(64);
    arena.set_tag(first, 96, PREV_IN_USE);

    let second = arena.next_block(first);
    assert_eq!(second.offset(), 160);

    arena.set_tag(second, 64, 0);
    arena.set_prev_size(second, 96);
    assert_eq!(arena.prev_block(second), first);
  }

  #[test]
  fn user_pointer_sits_right_after_the_header() {
    let mut arena = scratch(4096);
    let block = Block::at(128);
    arena.set_owner(block, 5);

    let ptr = arena.block_user_pointer(block);
    assert_eq!(arena.offset_of(ptr), 128 + HEADER_SIZE);
    assert_eq!(arena.block_of(ptr), block);
    assert_eq!(ptr.as_ptr() as usize % ALIGN, 0);
    assert_eq!(unsafe { owner_of(ptr) }, 5);
  }

  #[test]
  fn links_live_after_the_header() {
    let mut arena = scratch(4096);
    let block = Block::at(256);
    arena.set_tag(block, 96, CURR_IN_USE | PREV_IN_USE);
    arena.set_owner(block, 3);

    arena.set_next(block, Block::at(512));
    arena.set_prev(block, Block::at(1024));
    arena.set_class(block, 9);
    arena.set_child(block, RIGHT, Block::at(2048));
    arena.set_parent(block, Block::at(8));

    assert_eq!(arena.size(block), 96);
    assert_eq!(arena.owner(block), 3);
    assert_eq!(arena.next(block), Block::at(512));
    assert_eq!(arena.prev(block), Block::at(1024));
    assert_eq!(arena.class(block), 9);
    assert_eq!(arena.child(block, LEFT), Block::NIL);
    assert_eq!(arena.leftmost_limb(block), Block::at(2048));
    assert_eq!(arena.parent(block), Block::at(8));
  }
}
