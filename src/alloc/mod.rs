//! Allocators over the memory pools
//!
//! A size-class allocator reused for every pool flavor: freed blocks go to
//! per-size free lists, allocation pops a matching block or reserves fresh
//! bytes from the pool, growing it once on exhaustion. The per-pointer size
//! map makes `free` and array deletion work without a size argument.
//!
//! Allocation parameters ([`AllocParams`]) control whether typed
//! construction initializes, deinitializes and synchronizes; the collective
//! and dynamic entry points apply their different defaults.

pub mod pools;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::types::{DsmError, DsmResult};

pub use pools::{DynamicPool, GlobalMemoryPool, GrowthMode, MemoryPool};

#[derive(Debug, Default)]
struct AllocatorState {
    /// Size of every live allocation
    sizes: HashMap<usize, usize>,
    /// Freed blocks by size
    free_lists: BTreeMap<usize, Vec<usize>>,
}

/// Size-class allocator over a memory pool
pub struct GenericAllocator {
    pool: Arc<dyn MemoryPool>,
    state: Mutex<AllocatorState>,
}

impl GenericAllocator {
    pub fn new(pool: Arc<dyn MemoryPool>) -> Self {
        Self {
            pool,
            state: Mutex::new(AllocatorState::default()),
        }
    }

    /// Allocate `size` bytes of global memory
    pub fn allocate(&self, size: usize) -> DsmResult<usize> {
        let mut guard = self.state.lock().expect("allocator poisoned");
        let state = &mut *guard;
        if let Some(list) = state.free_lists.get_mut(&size) {
            if let Some(addr) = list.pop() {
                state.sizes.insert(addr, size);
                return Ok(addr);
            }
        }
        let addr = match self.pool.reserve(size) {
            Ok(addr) => addr,
            Err(DsmError::PoolExhausted) => {
                self.pool.grow(size)?;
                self.pool.reserve(size)?
            }
            Err(err) => return Err(err),
        };
        state.sizes.insert(addr, size);
        Ok(addr)
    }

    /// Return an allocation to its size class
    pub fn free(&self, addr: usize) {
        let mut state = self.state.lock().expect("allocator poisoned");
        match state.sizes.remove(&addr) {
            Some(size) => state.free_lists.entry(size).or_default().push(addr),
            None => log::warn!("freeing unknown global allocation {:#x}", addr),
        }
    }

    /// Size of a live allocation, if this allocator made it
    pub fn size_of(&self, addr: usize) -> Option<usize> {
        self.state
            .lock()
            .expect("allocator poisoned")
            .sizes
            .get(&addr)
            .copied()
    }

    /// Drop all bookkeeping, used by `reset`
    pub fn reset(&self) {
        *self.state.lock().expect("allocator poisoned") = AllocatorState::default();
    }
}

impl std::fmt::Debug for GenericAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("allocator poisoned");
        f.debug_struct("GenericAllocator")
            .field("live", &state.sizes.len())
            .field("size_classes", &state.free_lists.len())
            .finish()
    }
}

/// Parameters for the typed allocation entry points
///
/// `None` fields take the entry point's default: collective construction
/// initializes on the home node and synchronizes, collective deletion
/// deinitializes and synchronizes, dynamic allocation never synchronizes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocParams {
    pub initialize: Option<bool>,
    pub deinitialize: Option<bool>,
    pub synchronize: Option<bool>,
}

impl AllocParams {
    pub fn initialize(mut self) -> Self {
        self.initialize = Some(true);
        self
    }

    pub fn no_initialize(mut self) -> Self {
        self.initialize = Some(false);
        self
    }

    pub fn deinitialize(mut self) -> Self {
        self.deinitialize = Some(true);
        self
    }

    pub fn no_deinitialize(mut self) -> Self {
        self.deinitialize = Some(false);
        self
    }

    pub fn synchronize(mut self) -> Self {
        self.synchronize = Some(true);
        self
    }

    pub fn no_synchronize(mut self) -> Self {
        self.synchronize = Some(false);
        self
    }
}
