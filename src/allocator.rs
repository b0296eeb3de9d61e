use core::{
  array,
  cell::Cell,
  ptr::NonNull,
  sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

use crate::{
  DEFAULT_POOL_CAPACITY, MAX_POOL_CAPACITY, MAX_POOLS,
  block::owner_of,
  error::{AllocError, Corruption},
  pool::{Pool, PoolStats},
};

// =============================================================================
// Thread homes
// =============================================================================

/// Slots in each thread's home table, probed linearly from `id % HOME_SLOTS`.
/// Entries are never evicted: a thread that meets more allocators than this
/// is sent to pool 0 of the extra ones without spending their counter.
const HOME_SLOTS: usize = 16;

/// Home of a thread whose table has no room left.
const OVERFLOW_HOME: usize = 0;

#[derive(Clone, Copy)]
struct Home {
  allocator: u32,
  pool: u32,
}

impl Home {
  const VACANT: Home = Home { allocator: 0, pool: 0 };
}

thread_local! {
  static HOMES: [Cell<Home>; HOME_SLOTS] = const { [const { Cell::new(Home::VACANT) }; HOME_SLOTS] };
}

// Start at 1; 0 = Home::VACANT
static NEXT_ALLOCATOR_ID: AtomicU32 = AtomicU32::new(1);

// =============================================================================
// Allocator
// =============================================================================

/// A ring of `POOLS` pools. Each calling thread is bound to a home pool on
/// first use and tries it first; a pool that is busy or full passes the
/// request on to the next one in the ring.
pub struct Allocator<const POOLS: usize = MAX_POOLS> {
  pools: [Pool; POOLS],
  /// Next home index to hand out.
  next_home: AtomicUsize,
  id: u32,
}

impl<const POOLS: usize> Allocator<POOLS> {
  /// Reserves `POOLS` pools of [`DEFAULT_POOL_CAPACITY`] bytes each.
  pub fn new() -> Result<Self, AllocError> {
    Self::with_capacity(DEFAULT_POOL_CAPACITY)
  }

  /// Reserves `POOLS` pools of `capacity` bytes each. Address space is
  /// reserved up front; pages are only committed as blocks are carved.
  pub fn with_capacity(capacity: usize) -> Result<Self, AllocError> {
    let allocator = Self::build(capacity);
    match &allocator {
      Ok(allocator) => log::debug!(
        "reserved {} pools of {} bytes for allocator {}",
        POOLS,
        allocator.pool_capacity(),
        allocator.id
      ),
      Err(AllocError::Reserve { bytes }) => {
        log::warn!("page provider refused {bytes} bytes, released the pools reserved so far")
      }
      Err(_) => {}
    }
    allocator
  }

  /// Same as [`Self::with_capacity`] but never logs, so it can run while the
  /// process-wide instance is being initialized from inside an allocation.
  pub(crate) fn build(capacity: usize) -> Result<Self, AllocError> {
    const { assert!(POOLS > 0 && POOLS <= MAX_POOLS) };

    if capacity > MAX_POOL_CAPACITY {
      return Err(AllocError::CapacityTooLarge {
        bytes: capacity,
        max: MAX_POOL_CAPACITY,
      });
    }

    let mut refused = false;
    let pools: [Option<Pool>; POOLS] = array::from_fn(|index| {
      if refused {
        return None;
      }
      let pool = Pool::reserve(index, (index + 1) % POOLS, capacity);
      refused = pool.is_none();
      pool
    });
    // Dropping `pools` here unmaps whatever was reserved.
    if refused {
      return Err(AllocError::Reserve { bytes: capacity });
    }

    Ok(Self {
      pools: pools.map(|pool| pool.unwrap_or_else(|| unreachable!())),
      next_home: AtomicUsize::new(0),
      id: NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed),
    })
  }

  /// Home pool of the calling thread, assigned once on first use.
  fn home(&self) -> Result<usize, AllocError> {
    HOMES
      .try_with(|homes| {
        let start = self.id as usize % HOME_SLOTS;
        let mut vacant = None;
        for probe in 0..HOME_SLOTS {
          let slot = &homes[(start + probe) % HOME_SLOTS];
          let home = slot.get();
          if home.allocator == self.id {
            return Ok(home.pool as usize);
          }
          if home.allocator == Home::VACANT.allocator {
            vacant = Some(slot);
            break;
          }
        }

        let Some(slot) = vacant else {
          return Ok(OVERFLOW_HOME);
        };
        let pool = self
          .next_home
          .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
            (next < POOLS).then_some(next + 1)
          })
          .map_err(|_| AllocError::ProvisioningExceeded { pools: POOLS })?;
        slot.set(Home {
          allocator: self.id,
          pool: pool as u32,
        });
        Ok(pool)
      })
      // Thread-locals are gone during thread teardown; share the first pool.
      .unwrap_or(Ok(OVERFLOW_HOME))
  }

  /// Allocates at least `size` bytes, 8-byte aligned.
  ///
  /// Starting at the caller's home pool, every pool of the ring is offered the
  /// request exactly once. A pool whose lock is held elsewhere is skipped
  /// rather than waited on, so this fails with [`AllocError::OutOfMemory`]
  /// when every pool is either full or busy at the moment it is tried.
  pub fn try_malloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
    let home = self.home()?;
    let mut index = home;
    loop {
      let pool = &self.pools[index];
      if let Ok(ptr) = pool.malloc(size) {
        return Ok(ptr);
      }
      index = pool.next();
      if index == home {
        return Err(AllocError::OutOfMemory { size });
      }
    }
  }

  /// Like [`Self::try_malloc`], returning null on failure.
  #[inline]
  pub fn malloc(&self, size: usize) -> *mut u8 {
    self
      .try_malloc(size)
      .map_or(core::ptr::null_mut(), NonNull::as_ptr)
  }

  /// Returns a block to the pool that carved it. Null is ignored.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or come from this allocator. Freeing a block twice
  /// in a row is ignored; freeing it after it was merged or reused is not.
  pub unsafe fn free(&self, ptr: *mut u8) {
    let Some(ptr) = NonNull::new(ptr) else {
      return;
    };
    let owner = unsafe { owner_of(ptr) };
    match self.pools.get(owner) {
      Some(pool) => pool.free(ptr),
      None => debug_assert!(false, "{ptr:p} names pool {owner}, allocator has {}", POOLS),
    }
  }

  /// Index of the pool that carved `ptr`.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation of this allocator.
  #[inline]
  pub unsafe fn owner_of(&self, ptr: NonNull<u8>) -> usize {
    unsafe { owner_of(ptr) }
  }

  /// Bytes usable behind `ptr`, at least what was asked for. Null gives 0.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation of this allocator.
  pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
    let Some(ptr) = NonNull::new(ptr) else {
      return 0;
    };
    self
      .pools
      .get(unsafe { owner_of(ptr) })
      .map_or(0, |pool| pool.usable_size(ptr))
  }

  /// Runs the invariant walk over one pool.
  pub fn pool_stats(&self, index: usize) -> Option<Result<PoolStats, Corruption>> {
    self.pools.get(index).map(Pool::verify)
  }

  /// Runs the invariant walk over every pool and sums the results.
  pub fn verify(&self) -> Result<PoolStats, Corruption> {
    let mut total = PoolStats::default();
    for pool in &self.pools {
      let stats = pool.verify().inspect_err(|corruption| {
        log::warn!("pool {} failed verification: {corruption}", pool.index())
      })?;
      total.absorb(stats);
    }
    Ok(total)
  }

  #[inline]
  pub const fn pool_count(&self) -> usize {
    POOLS
  }

  /// Bytes of blocks each pool can hold, after rounding to the page size.
  pub fn pool_capacity(&self) -> usize {
    self.pools[0].capacity()
  }
}
