//! Size-class tries for large blocks.
//!
//! Class `k` holds blocks whose size has its most significant bit at `k`.
//! Within a class, blocks form a binary trie keyed on the bits below the
//! leading one: at depth `d` a lookup branches on bit `k - 1 - d`. Blocks of
//! identical size are not repeated in the trie; the first one becomes the node
//! and later ones join a circular ring hanging off it, with the node itself
//! acting as the ring's sentinel.
//!
//! Parent links encode a node's role:
//!
//! - [`TREE_ROOT`] for the root of a class,
//! - [`Block::NIL`] for ring members that are not trie nodes,
//! - the parent node otherwise.

use crate::{
  arena::Arena,
  block::{Block, LEFT, RIGHT},
};

pub(crate) const LARGE_CLASSES: usize = 32;

/// Parent marker of a class root. Odd, so never a block offset.
const TREE_ROOT: Block = Block::at(1);

/// Index of the most significant set bit of `size`.
#[inline]
pub(crate) const fn class_of(size: usize) -> usize {
  debug_assert!(size != 0);
  (usize::BITS - 1 - size.leading_zeros()) as usize
}

pub(crate) struct LargeBins {
  /// Bit `k` is set while class `k` has a root.
  bits: u32,
  roots: [Block; LARGE_CLASSES],
}

impl LargeBins {
  pub(crate) const fn new() -> Self {
    Self {
      bits: 0,
      roots: [Block::NIL; LARGE_CLASSES],
    }
  }

  #[inline]
  pub(crate) fn has(&self, class: usize) -> bool {
    class < LARGE_CLASSES && (self.bits >> class) & 1 != 0
  }

  pub(crate) fn push(&mut self, arena: &mut Arena, block: Block) {
    let size = arena.size(block);
    let class = class_of(size);
    debug_assert!(class < LARGE_CLASSES, "block of {size} bytes has no class");

    arena.set_class(block, class);
    arena.set_child(block, LEFT, Block::NIL);
    arena.set_child(block, RIGHT, Block::NIL);
    arena.set_next(block, block);
    arena.set_prev(block, block);

    if !self.has(class) {
      self.bits |= 1 << class;
      self.roots[class] = block;
      arena.set_parent(block, TREE_ROOT);
      return;
    }

    let mut node = self.roots[class];
    // Leading bit at the top; each shift exposes the next branching bit.
    let mut path = size << (usize::BITS as usize - 1 - class);
    loop {
      if arena.size(node) == size {
        let next = arena.next(node);
        arena.set_next(node, block);
        arena.set_prev(next, block);
        arena.set_next(block, next);
        arena.set_prev(block, node);
        arena.set_parent(block, Block::NIL);
        return;
      }

      path <<= 1;
      let side = path >> (usize::BITS - 1);
      let child = arena.child(node, side);
      if child.is_nil() {
        arena.set_child(node, side, block);
        arena.set_parent(block, node);
        return;
      }
      node = child;
    }
  }

  /// Removes and returns the block with the smallest leftover among the nodes
  /// on the leftmost descent from the class root of `size`. Nodes smaller
  /// than `size` are skipped; `None` if nothing on the path fits.
  pub(crate) fn best_fit(&mut self, arena: &mut Arena, size: usize) -> Option<Block> {
    let class = class_of(size);
    if !self.has(class) {
      return None;
    }

    let mut node = self.roots[class];
    let mut best = None;
    let mut best_rest = usize::MAX;
    while !node.is_nil() {
      if let Some(rest) = arena.size(node).checked_sub(size)
        && rest < best_rest
      {
        best = Some(node);
        best_rest = rest;
        if rest == 0 {
          break;
        }
      }
      node = arena.leftmost_limb(node);
    }

    let best = best?;
    self.pull(arena, best);
    Some(best)
  }

  /// Removes `block` from the directory.
  pub(crate) fn pull(&mut self, arena: &mut Arena, block: Block) {
    let parent = arena.parent(block);
    let next = arena.next(block);

    let replacement = if next != block {
      let prev = arena.prev(block);
      arena.set_prev(next, prev);
      arena.set_next(prev, next);
      if parent.is_nil() {
        // Plain ring member, the trie is untouched.
        return;
      }
      next
    } else {
      detach_leaf(arena, block)
    };

    let class = arena.class(block);
    if parent == TREE_ROOT {
      debug_assert_eq!(self.roots[class], block);
      self.roots[class] = replacement;
      if replacement.is_nil() {
        self.bits &= !(1 << class);
      }
    } else if arena.child(parent, LEFT) == block {
      arena.set_child(parent, LEFT, replacement);
    } else {
      debug_assert_eq!(arena.child(parent, RIGHT), block);
      arena.set_child(parent, RIGHT, replacement);
    }

    if !replacement.is_nil() {
      arena.set_parent(replacement, parent);
      for side in [LEFT, RIGHT] {
        let child = arena.child(block, side);
        arena.set_child(replacement, side, child);
        if !child.is_nil() {
          arena.set_parent(child, replacement);
        }
      }
    }
  }

  /// Visits every block in every class, ring members included.
  pub(crate) fn walk(&self, arena: &Arena, mut f: impl FnMut(usize, Block)) {
    for class in 0..LARGE_CLASSES {
      if self.has(class) {
        visit(arena, self.roots[class], class, &mut f);
      }
    }
  }

  /// Whether the bitmap and the roots agree for every class.
  pub(crate) fn consistent_bits(&self) -> Result<(), usize> {
    (0..LARGE_CLASSES)
      .find(|&class| self.has(class) == self.roots[class].is_nil())
      .map_or(Ok(()), Err)
  }
}

/// Cuts the deepest right-preferring leaf out of `block`'s subtree and returns
/// it, or `NIL` if `block` has no children.
fn detach_leaf(arena: &mut Arena, block: Block) -> Block {
  let mut holder = block;
  let mut side = if !arena.child(block, RIGHT).is_nil() {
    RIGHT
  } else if !arena.child(block, LEFT).is_nil() {
    LEFT
  } else {
    return Block::NIL;
  };

  let mut leaf = arena.child(holder, side);
  loop {
    let next_side = if !arena.child(leaf, RIGHT).is_nil() {
      RIGHT
    } else if !arena.child(leaf, LEFT).is_nil() {
      LEFT
    } else {
      break;
    };
    holder = leaf;
    side = next_side;
    leaf = arena.child(leaf, side);
  }

  arena.set_child(holder, side, Block::NIL);
  leaf
}

// Depth is bounded by the class index, so recursion stays shallow.
fn visit(arena: &Arena, node: Block, class: usize, f: &mut impl FnMut(usize, Block)) {
  f(class, node);
  let mut member = arena.next(node);
  while member != node {
    f(class, member);
    member = arena.next(member);
  }
  for side in [LEFT, RIGHT] {
    let child = arena.child(node, side);
    if !child.is_nil() {
      visit(arena, child, class, f);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{arena::scratch, block::PREV_IN_USE};

  /// Lays out free blocks of the given sizes back to back from offset 4096.
  fn blocks(arena: &mut Arena, sizes: &[usize]) -> Vec<Block> {
    let mut at = 4096;
    sizes
      .iter()
      .map(|&size| {
        let block = Block::at(at);
        arena.set_tag(block, size, PREV_IN_USE);
        at += size;
        block
      })
      .collect()
  }

  fn contents(bins: &LargeBins, arena: &Arena) -> Vec<Block> {
    let mut out = Vec::new();
    bins.walk(arena, |_, b| out.push(b));
    out.sort();
    out
  }

  #[test]
  fn class_is_the_leading_bit() {
    assert_eq!(class_of(256), 8);
    assert_eq!(class_of(511), 8);
    assert_eq!(class_of(512), 9);
    assert_eq!(class_of(170_024), 17);
  }

  #[test]
  fn first_block_becomes_root_and_children_follow_the_next_bit() {
    let mut arena = scratch(1 << 16);
    let mut bins = LargeBins::new();
    let b = blocks(&mut arena, &[1000, 904, 760]);
    for &block in &b {
      bins.push(&mut arena, block);
    }

    assert!(bins.has(9));
    assert_eq!(bins.roots[9], b[0]);
    assert_eq!(arena.parent(b[0]), TREE_ROOT);
    // 904 has bit 8 set, 760 does not.
    assert_eq!(arena.child(b[0], RIGHT), b[1]);
    assert_eq!(arena.child(b[0], LEFT), b[2]);
    assert_eq!(arena.parent(b[1]), b[0]);
    assert_eq!(arena.parent(b[2]), b[0]);
  }

  #[test]
  fn best_fit_prefers_smallest_leftover_on_the_path() {
    let mut arena = scratch(1 << 16);
    let mut bins = LargeBins::new();
    let b = blocks(&mut arena, &[1000, 904, 760]);
    for &block in &b {
      bins.push(&mut arena, block);
    }

    assert_eq!(bins.best_fit(&mut arena, 752), Some(b[2]));
    assert_eq!(contents(&bins, &arena), vec![b[0], b[1]]);
    assert_eq!(bins.consistent_bits(), Ok(()));
  }

  #[test]
  fn best_fit_never_returns_a_smaller_block() {
    let mut arena = scratch(1 << 16);
    let mut bins = LargeBins::new();
    let b = blocks(&mut arena, &[600, 520]);
    for &block in &b {
      bins.push(&mut arena, block);
    }

    assert_eq!(bins.best_fit(&mut arena, 1000), None);
    assert_eq!(bins.best_fit(&mut arena, 560), Some(b[0]));
    assert_eq!(bins.best_fit(&mut arena, 560), None);
    assert_eq!(bins.best_fit(&mut arena, 520), Some(b[1]));
    assert!(!bins.has(9));
  }

  #[test]
  fn duplicates_ride_the_ring_and_get_promoted() {
    let mut arena = scratch(1 << 16);
    let mut bins = LargeBins::new();
    let b = blocks(&mut arena, &[512, 768, 768, 768, 776]);
    for &block in &b {
      bins.push(&mut arena, block);
    }

    let node = b[1];
    assert_eq!(arena.child(b[0], RIGHT), node);
    assert!(arena.parent(b[2]).is_nil());
    assert!(arena.parent(b[3]).is_nil());
    // 776 branches right at bit 8, then left at bit 7 below the 768 node.
    assert_eq!(arena.child(node, LEFT), b[4]);

    // Pulling the node promotes a ring member into its slot.
    bins.pull(&mut arena, node);
    let promoted = arena.child(b[0], RIGHT);
    assert!(promoted == b[2] || promoted == b[3]);
    assert_eq!(arena.parent(promoted), b[0]);
    assert_eq!(arena.child(promoted, LEFT), b[4]);
    assert_eq!(arena.parent(b[4]), promoted);
    assert_eq!(contents(&bins, &arena), vec![b[0], b[2], b[3], b[4]]);

    // Pulling a plain ring member leaves the trie alone.
    let other = if promoted == b[2] { b[3] } else { b[2] };
    bins.pull(&mut arena, other);
    assert_eq!(arena.child(b[0], RIGHT), promoted);
    assert_eq!(contents(&bins, &arena), vec![b[0], promoted, b[4]]);
  }

  #[test]
  fn pulling_an_inner_node_splices_a_leaf_from_its_subtree() {
    let mut arena = scratch(1 << 16);
    let mut bins = LargeBins::new();
    // Root 1024, then a subtree under its left slot.
    let b = blocks(&mut arena, &[1024, 1280, 1088, 1408, 1152]);
    for &block in &b {
      bins.push(&mut arena, block);
    }

    bins.pull(&mut arena, b[0]);
    assert_eq!(bins.consistent_bits(), Ok(()));
    let root = bins.roots[10];
    assert!(!root.is_nil());
    assert_eq!(arena.parent(root), TREE_ROOT);
    assert_eq!(contents(&bins, &arena), vec![b[1], b[2], b[3], b[4]]);

    for &block in &b[1..] {
      bins.pull(&mut arena, block);
    }
    assert!(!bins.has(10));
    assert!(contents(&bins, &arena).is_empty());
  }

  #[test]
  fn classes_do_not_mix() {
    let mut arena = scratch(1 << 16);
    let mut bins = LargeBins::new();
    let b = blocks(&mut arena, &[304, 3000]);
    for &block in &b {
      bins.push(&mut arena, block);
    }

    assert_eq!(bins.best_fit(&mut arena, 2100), Some(b[1]));
    assert_eq!(bins.best_fit(&mut arena, 290), Some(b[0]));
    assert_eq!(bins.consistent_bits(), Ok(()));
  }
}
