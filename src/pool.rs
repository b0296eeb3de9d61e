//! A pool owns one arena behind one lock, both free-block directories and the
//! wilderness: the always-free trailing block that new blocks are carved from.

use core::ptr::NonNull;

use parking_lot::Mutex;
#[cfg(test)]
use parking_lot::MutexGuard;

use crate::{
  arena::Arena,
  block::{ALIGN, Block, CURR_IN_USE, HEADER_SIZE, MIN_BLOCK_SIZE, PREV_IN_USE, block_size},
  error::Corruption,
  large::{self, LargeBins},
  platform::Region,
  small::{self, SENTINELS_END, SMALL_CLASSES, SmallBins},
};

/// Offset of the first block in every arena.
pub(crate) const FIRST_BLOCK: usize = SENTINELS_END;

/// Why a pool did not serve a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolMiss {
  /// Another thread holds the lock.
  Contended,
  /// Neither directory nor wilderness can fit the request.
  Exhausted,
}

/// Snapshot produced by the invariant walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
  /// Allocated blocks.
  pub used_blocks: usize,
  /// Bytes held by allocated blocks, headers included.
  pub used_bytes: usize,
  /// Free blocks cached in the directories.
  pub free_blocks: usize,
  /// Bytes held by cached free blocks.
  pub free_bytes: usize,
  /// Size of the wilderness block.
  pub wilderness: usize,
}

impl PoolStats {
  pub(crate) fn absorb(&mut self, other: PoolStats) {
    self.used_blocks += other.used_blocks;
    self.used_bytes += other.used_bytes;
    self.free_blocks += other.free_blocks;
    self.free_bytes += other.free_bytes;
    self.wilderness += other.wilderness;
  }
}

// =============================================================================
// Pool
// =============================================================================

pub(crate) struct Pool {
  index: usize,
  /// Next pool in the allocator's ring.
  next: usize,
  heap: Mutex<Heap>,
}

impl Pool {
  /// Reserves an arena with room for `capacity` bytes of blocks.
  pub(crate) fn reserve(index: usize, next: usize, capacity: usize) -> Option<Self> {
    let region = Region::reserve(capacity.checked_add(FIRST_BLOCK)?)?;
    Some(Self {
      index,
      next,
      heap: Mutex::new(Heap::new(region, index)),
    })
  }

  #[inline]
  pub(crate) fn index(&self) -> usize {
    self.index
  }

  #[inline]
  pub(crate) fn next(&self) -> usize {
    self.next
  }

  /// Never blocks: a contended pool is reported, not waited on.
  pub(crate) fn malloc(&self, bytes: usize) -> Result<NonNull<u8>, PoolMiss> {
    let Some(mut heap) = self.heap.try_lock() else {
      return Err(PoolMiss::Contended);
    };
    heap.malloc(bytes).ok_or(PoolMiss::Exhausted)
  }

  pub(crate) fn free(&self, ptr: NonNull<u8>) {
    let mut heap = self.heap.lock();
    heap.free(ptr);

    #[cfg(all(debug_assertions, feature = "debug-tripwire"))]
    if let Err(corruption) = heap.verify() {
      panic!("pool {} corrupted by free of {ptr:p}: {corruption}", self.index);
    }
  }

  pub(crate) fn usable_size(&self, ptr: NonNull<u8>) -> usize {
    let heap = self.heap.lock();
    heap.arena.size(heap.arena.block_of(ptr)) - HEADER_SIZE
  }

  pub(crate) fn verify(&self) -> Result<PoolStats, Corruption> {
    self.heap.lock().verify()
  }

  /// Total bytes blocks can occupy in this pool.
  pub(crate) fn capacity(&self) -> usize {
    let heap = self.heap.lock();
    heap.end - FIRST_BLOCK
  }

  #[cfg(test)]
  pub(crate) fn hold(&self) -> MutexGuard<'_, Heap> {
    self.heap.lock()
  }
}

// =============================================================================
// Heap (everything the pool lock protects)
// =============================================================================

pub(crate) struct Heap {
  arena: Arena,
  /// Index stamped into every block carved here.
  owner: usize,
  /// End of the block area; the wilderness always reaches it.
  end: usize,
  wilderness: Block,
  small: SmallBins,
  large: LargeBins,
}

impl Heap {
  fn new(region: Region, owner: usize) -> Self {
    let mut arena = Arena::new(region);
    let small = SmallBins::new(&mut arena);
    let end = arena.len() & !(ALIGN - 1);
    debug_assert!(end >= FIRST_BLOCK + MIN_BLOCK_SIZE);

    let wilderness = Block::at(FIRST_BLOCK);
    arena.set_tag(wilderness, end - FIRST_BLOCK, PREV_IN_USE);
    arena.set_prev_size(wilderness, 0);
    arena.set_owner(wilderness, owner);

    Self {
      arena,
      owner,
      end,
      wilderness,
      small,
      large: LargeBins::new(),
    }
  }

  fn malloc(&mut self, bytes: usize) -> Option<NonNull<u8>> {
    let size = block_size(bytes)?;

    // Small requests only ever look at their exact class.
    let cached = if small::is_small(size) {
      self.small.pop(&mut self.arena, small::class_of(size))
    } else {
      self.large.best_fit(&mut self.arena, size)
    };

    let block = match cached {
      Some(block) => block,
      None => self.carve(size)?,
    };

    self.arena.set_owner(block, self.owner);
    self.arena.turn(block, CURR_IN_USE);
    let next = self.arena.next_block(block);
    self.arena.turn(next, PREV_IN_USE);

    Some(self.arena.block_user_pointer(block))
  }

  /// Splits `size` bytes off the front of the wilderness. The wilderness never
  /// shrinks below `MIN_BLOCK_SIZE`.
  fn carve(&mut self, size: usize) -> Option<Block> {
    let block = self.wilderness;
    let available = self.arena.size(block);
    if size.checked_add(MIN_BLOCK_SIZE)? > available {
      return None;
    }

    self.arena.set_size(block, size);

    let rest = self.arena.next_block(block);
    self.arena.set_tag(rest, available - size, PREV_IN_USE);
    self.arena.set_prev_size(rest, size);
    self.arena.set_owner(rest, self.owner);
    self.wilderness = rest;

    Some(block)
  }

  fn free(&mut self, ptr: NonNull<u8>) {
    let mut block = self.arena.block_of(ptr);
    debug_assert_eq!(self.arena.owner(block), self.owner, "{ptr:p} freed into the wrong pool");

    // A block that is already free is left alone.
    if !self.arena.in_use(block) {
      return;
    }

    let mut size = self.arena.size(block);
    let next = self.arena.next_block(block);

    if !self.arena.prev_in_use(block) {
      let prev = self.arena.prev_block(block);
      debug_assert_eq!(self.arena.size(prev), self.arena.prev_size(block));
      self.unindex(prev);
      size += self.arena.size(prev);
      block = prev;
    }

    if !self.arena.in_use(next) {
      size += self.arena.size(next);
      if next == self.wilderness {
        self.arena.set_tag(block, size, PREV_IN_USE);
        self.arena.set_owner(block, self.owner);
        self.wilderness = block;
        return;
      }
      self.unindex(next);
    }

    // Neighbours on both sides are now in use.
    self.arena.set_tag(block, size, PREV_IN_USE);
    let after = self.arena.next_block(block);
    self.arena.drop_flag(after, PREV_IN_USE);
    self.arena.set_prev_size(after, size);
    self.index(block);
  }

  fn index(&mut self, block: Block) {
    if small::is_small(self.arena.size(block)) {
      self.small.push(&mut self.arena, block);
    } else {
      self.large.push(&mut self.arena, block);
    }
  }

  fn unindex(&mut self, block: Block) {
    if small::is_small(self.arena.size(block)) {
      self.small.unlink(&mut self.arena, block);
    } else {
      self.large.pull(&mut self.arena, block);
    }
  }

  /// Walks every block of the arena and both directories, checking the
  /// boundary-tag and indexing invariants.
  fn verify(&self) -> Result<PoolStats, Corruption> {
    let arena = &self.arena;
    let mut stats = PoolStats::default();
    let mut small_free = 0;
    let mut large_free = 0;

    let mut block = Block::at(FIRST_BLOCK);
    let mut prev_in_use = true;
    let mut prev_size = 0;
    loop {
      let at = block.offset();
      let size = arena.size(block);
      if size < MIN_BLOCK_SIZE || size % ALIGN != 0 {
        return Err(Corruption::BadSize { block: at, size });
      }
      if size > self.end - at {
        return Err(Corruption::Overrun {
          block: at,
          size,
          end: self.end,
        });
      }
      if arena.prev_in_use(block) != prev_in_use {
        return Err(Corruption::PrevInUse { block: at });
      }
      if !prev_in_use && arena.prev_size(block) != prev_size {
        return Err(Corruption::PrevSize {
          block: at,
          expected: prev_size,
          found: arena.prev_size(block),
        });
      }
      if arena.owner(block) != self.owner {
        return Err(Corruption::Owner {
          block: at,
          expected: self.owner,
          found: arena.owner(block),
        });
      }

      let in_use = arena.in_use(block);
      if !in_use && !prev_in_use {
        return Err(Corruption::Uncoalesced { block: at });
      }

      if block == self.wilderness {
        if in_use {
          return Err(Corruption::WildernessInUse { block: at });
        }
        if at + size != self.end {
          return Err(Corruption::WildernessMisplaced { block: at });
        }
        stats.wilderness = size;
        break;
      }

      if in_use {
        stats.used_blocks += 1;
        stats.used_bytes += size;
      } else {
        stats.free_blocks += 1;
        stats.free_bytes += size;
        if small::is_small(size) {
          small_free += 1;
        } else {
          large_free += 1;
        }
      }

      prev_in_use = in_use;
      prev_size = size;
      block = arena.next_block(block);
      if block.offset() >= self.end {
        return Err(Corruption::WildernessMisplaced {
          block: self.wilderness.offset(),
        });
      }
    }

    let limit = self.end / MIN_BLOCK_SIZE;
    let mut indexed = 0;
    for class in 0..SMALL_CLASSES {
      let mut misfiled = None;
      let count = self.small.walk(arena, class, limit, |member| {
        if arena.in_use(member) || small::class_of(arena.size(member)) != class {
          misfiled.get_or_insert(member);
        }
      });
      if let Some(member) = misfiled {
        return Err(Corruption::Misfiled {
          directory: "small",
          class,
          block: member.offset(),
        });
      }
      if self.small.has(class) != (count > 0) {
        return Err(Corruption::Bitmap {
          directory: "small",
          class,
        });
      }
      indexed += count;
    }
    if indexed != small_free {
      return Err(Corruption::Unindexed {
        directory: "small",
        free: small_free,
        indexed,
      });
    }

    self
      .large
      .consistent_bits()
      .map_err(|class| Corruption::Bitmap {
        directory: "large",
        class,
      })?;
    let mut indexed = 0;
    let mut misfiled = None;
    self.large.walk(arena, |class, member| {
      indexed += 1;
      let size = arena.size(member);
      if arena.in_use(member) || small::is_small(size) || large::class_of(size) != class {
        misfiled.get_or_insert((class, member));
      }
    });
    if let Some((class, member)) = misfiled {
      return Err(Corruption::Misfiled {
        directory: "large",
        class,
        block: member.offset(),
      });
    }
    if indexed != large_free {
      return Err(Corruption::Unindexed {
        directory: "large",
        free: large_free,
        indexed,
      });
    }

    Ok(stats)
  }
}

impl Drop for Heap {
  fn drop(&mut self) {
    if self.wilderness.offset() != FIRST_BLOCK {
      log::debug!(
        "pool {} released with {} bytes still carved",
        self.owner,
        self.wilderness.offset() - FIRST_BLOCK
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const CAPACITY: usize = 1 << 20;

  fn heap() -> Heap {
    Heap::new(Region::reserve(CAPACITY + FIRST_BLOCK).unwrap(), 0)
  }

  fn offset(heap: &Heap, ptr: NonNull<u8>) -> usize {
    heap.arena.block_of(ptr).offset()
  }

  fn stats(heap: &Heap) -> PoolStats {
    heap.verify().unwrap()
  }

  /// User request that produces a block of exactly `size` bytes.
  fn request(size: usize) -> usize {
    size - HEADER_SIZE
  }

  #[test]
  fn fresh_pool_is_one_wilderness() {
    let heap = heap();
    let stats = stats(&heap);
    assert_eq!(stats.used_blocks, 0);
    assert_eq!(stats.free_blocks, 0);
    assert_eq!(stats.wilderness, heap.end - FIRST_BLOCK);
    assert!(stats.wilderness >= CAPACITY);
  }

  #[test]
  fn carving_walks_forward_and_shrinks_the_wilderness() {
    let mut heap = heap();
    let before = stats(&heap).wilderness;

    let a = heap.malloc(request(64)).unwrap();
    let b = heap.malloc(request(512)).unwrap();
    assert_eq!(offset(&heap, a), FIRST_BLOCK);
    assert_eq!(offset(&heap, b), FIRST_BLOCK + 64);

    let stats = stats(&heap);
    assert_eq!(stats.used_blocks, 2);
    assert_eq!(stats.used_bytes, 64 + 512);
    assert_eq!(stats.wilderness, before - 64 - 512);
  }

  #[test]
  fn small_block_is_reused_from_its_exact_class() {
    let mut heap = heap();
    let p = heap.malloc(17).unwrap();
    let _guard = heap.malloc(17).unwrap();

    heap.free(p);
    assert_eq!(stats(&heap).free_blocks, 1);
    assert_eq!(heap.malloc(17), Some(p));
    assert_eq!(stats(&heap).free_blocks, 0);
  }

  #[test]
  fn small_requests_do_not_touch_large_blocks() {
    let mut heap = heap();
    let big = heap.malloc(170_000).unwrap();
    let _guard = heap.malloc(17).unwrap();
    heap.free(big);

    let small = heap.malloc(17).unwrap();
    assert!(offset(&heap, small) > offset(&heap, big) + 170_000);
    let stats = stats(&heap);
    assert_eq!(stats.free_blocks, 1);
    assert!(stats.free_bytes >= 170_000);
  }

  #[test]
  fn freeing_next_to_the_wilderness_extends_it() {
    let mut heap = heap();
    let _a = heap.malloc(100).unwrap();
    let b = heap.malloc(100).unwrap();
    let before = stats(&heap).wilderness;
    let b_size = heap.arena.size(heap.arena.block_of(b));

    heap.free(b);
    let after = stats(&heap);
    assert_eq!(after.wilderness, before + b_size);
    assert_eq!(after.free_blocks, 0);
    assert_eq!(heap.wilderness, heap.arena.block_of(b));
  }

  #[test]
  fn freeing_everything_restores_the_fresh_wilderness() {
    let mut heap = heap();
    let fresh = stats(&heap);
    let sizes = [17, 300, 4000, 64, 170_000, 1, 255, 256, 1024];
    let ptrs: Vec<_> = sizes.iter().map(|&s| heap.malloc(s).unwrap()).collect();

    for (i, &ptr) in ptrs.iter().enumerate().filter(|(i, _)| i % 2 == 0) {
      heap.free(ptr);
      assert!(heap.verify().is_ok(), "after freeing #{i}");
    }
    for &ptr in ptrs.iter().skip(1).step_by(2) {
      heap.free(ptr);
    }

    assert_eq!(stats(&heap), fresh);
    assert_eq!(heap.wilderness.offset(), FIRST_BLOCK);
  }

  #[test]
  fn every_free_order_of_four_neighbours_coalesces() {
    let orders = permutations(4);
    assert_eq!(orders.len(), 24);

    for order in orders {
      let mut heap = heap();
      let blocks: Vec<_> = (0..4).map(|_| heap.malloc(request(64)).unwrap()).collect();
      let _guard = heap.malloc(8).unwrap();
      let wilderness = stats(&heap).wilderness;

      for &i in &order {
        heap.free(blocks[i]);
        heap.verify().unwrap_or_else(|e| panic!("order {order:?}: {e}"));
      }
      let merged = stats(&heap);
      assert_eq!(merged.free_blocks, 1, "order {order:?}");
      assert_eq!(merged.free_bytes, 4 * 64, "order {order:?}");

      assert_eq!(heap.malloc(request(4 * 64)), Some(blocks[0]), "order {order:?}");
      assert_eq!(stats(&heap).wilderness, wilderness, "order {order:?}");
    }
  }

  #[test]
  fn reused_block_protects_itself_from_its_neighbour() {
    let mut heap = heap();
    let a = heap.malloc(request(64)).unwrap();
    let b = heap.malloc(request(64)).unwrap();
    let _guard = heap.malloc(8).unwrap();

    heap.free(a);
    assert_eq!(heap.malloc(request(64)), Some(a));
    unsafe { a.as_ptr().write_bytes(0x5A, request(64)) };

    // `b` must see `a` as live again and stay unmerged.
    heap.free(b);
    let stats = stats(&heap);
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.free_bytes, 64);
    let contents = unsafe { core::slice::from_raw_parts(a.as_ptr(), request(64)) };
    assert!(contents.iter().all(|&byte| byte == 0x5A));
  }

  #[test]
  fn repeated_free_is_ignored() {
    let mut heap = heap();
    let a = heap.malloc(40).unwrap();
    let b = heap.malloc(40).unwrap();
    let _guard = heap.malloc(40).unwrap();

    heap.free(a);
    let once = stats(&heap);
    heap.free(a);
    assert_eq!(stats(&heap), once);

    heap.free(b);
    let stats = stats(&heap);
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.used_blocks, 1);
  }

  #[test]
  fn wilderness_keeps_a_minimum_block() {
    let mut heap = heap();
    let available = stats(&heap).wilderness;

    assert_eq!(heap.malloc(request(available)), None);
    assert_eq!(heap.malloc(request(available - MIN_BLOCK_SIZE + ALIGN)), None);
    assert!(heap.malloc(request(available - MIN_BLOCK_SIZE)).is_some());
    assert_eq!(stats(&heap).wilderness, MIN_BLOCK_SIZE);
    assert_eq!(heap.malloc(1), None);
  }

  #[test]
  fn absurd_requests_fail_cleanly() {
    let mut heap = heap();
    assert_eq!(heap.malloc(usize::MAX), None);
    assert_eq!(heap.malloc(usize::MAX - HEADER_SIZE - MIN_BLOCK_SIZE), None);
    assert!(heap.verify().is_ok());
  }

  #[test]
  fn verify_reports_a_clobbered_header() {
    let mut heap = heap();
    let a = heap.malloc(100).unwrap();
    let _b = heap.malloc(100).unwrap();

    let block = heap.arena.block_of(a);
    heap.arena.drop_flag(block, CURR_IN_USE);
    assert_eq!(
      heap.verify(),
      Err(Corruption::PrevInUse {
        block: block.offset() + 128
      })
    );

    heap.arena.turn(block, CURR_IN_USE);
    heap.arena.set_owner(block, 9);
    assert!(matches!(heap.verify(), Err(Corruption::Owner { found: 9, .. })));
  }

  fn permutations(n: usize) -> Vec<Vec<usize>> {
    if n == 0 {
      return vec![Vec::new()];
    }
    let mut out = Vec::new();
    for rest in permutations(n - 1) {
      for slot in 0..=rest.len() {
        let mut order = rest.clone();
        order.insert(slot, n - 1);
        out.push(order);
      }
    }
    out
  }
}
