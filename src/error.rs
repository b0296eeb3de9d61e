use thiserror::Error;

/// Why an allocation or allocator construction failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  /// Every pool was either contended or too full for the request.
  #[error("out of memory: no pool could serve {size} bytes")]
  OutOfMemory { size: usize },

  /// More threads called into the allocator than it has pools.
  #[error("provisioning exceeded: all {pools} pools are already assigned to threads")]
  ProvisioningExceeded { pools: usize },

  /// The page provider refused to reserve a pool's arena.
  #[error("failed to reserve {bytes} bytes for a pool")]
  Reserve { bytes: usize },

  /// Requested pool capacity is beyond what the size classes can index.
  #[error("pool capacity of {bytes} bytes exceeds the {max} byte limit")]
  CapacityTooLarge { bytes: usize, max: usize },
}

/// A broken heap invariant found by the pool invariant walk. Offsets are
/// relative to the start of the pool's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Corruption {
  #[error("block at {block:#x} has invalid size {size}")]
  BadSize { block: usize, size: usize },

  #[error("block at {block:#x} of {size} bytes runs past the arena end {end:#x}")]
  Overrun { block: usize, size: usize, end: usize },

  #[error("block at {block:#x} disagrees with its predecessor about PREV_IN_USE")]
  PrevInUse { block: usize },

  #[error("block at {block:#x} records prev_size {found}, predecessor is {expected} bytes")]
  PrevSize { block: usize, expected: usize, found: usize },

  #[error("free blocks at {block:#x} and its predecessor were never merged")]
  Uncoalesced { block: usize },

  #[error("block at {block:#x} belongs to pool {found}, expected {expected}")]
  Owner { block: usize, expected: usize, found: usize },

  #[error("wilderness at {block:#x} is marked in use")]
  WildernessInUse { block: usize },

  #[error("wilderness at {block:#x} is not the last block of the arena")]
  WildernessMisplaced { block: usize },

  #[error("{directory} directory class {class} holds a block at {block:#x} that does not belong there")]
  Misfiled { directory: &'static str, class: usize, block: usize },

  #[error("{directory} directory bitmap disagrees with class {class}")]
  Bitmap { directory: &'static str, class: usize },

  #[error("{directory} directory indexes {indexed} blocks, the arena has {free} free ones")]
  Unindexed { directory: &'static str, free: usize, indexed: usize },
}
