//! Memory pools over the global address space
//!
//! The global pool owns the whole global range: a cursor word and a
//! test-and-set lock word in a reserved metadata prefix, manipulated through
//! remote atomics so no mapping is required to allocate. Dynamic pools are
//! per-node growable arenas carved out of the global pool; the collective
//! flavor grows on node 0 only and broadcasts the new base so every node's
//! pool stays identical.

use std::sync::{Arc, Mutex};

use crate::distribution::GlobalPtr;
use crate::runtime::Engine;
use crate::sync::atomics::MemoryOrder;
use crate::sync::global_tas_lock::GlobalTasLock;
use crate::types::{align_forwards, DsmError, DsmResult, PAGE_SIZE};

/// A source of raw global-memory ranges
pub trait MemoryPool: Send + Sync {
    /// Reserve `size` bytes; returns the virtual address of the range
    fn reserve(&self, size: usize) -> DsmResult<usize>;

    /// Make room for at least `size` more bytes, if the pool can grow
    fn grow(&self, size: usize) -> DsmResult<()>;
}

/// The process-wide pool over the full global range
#[derive(Debug)]
pub struct GlobalMemoryPool {
    engine: Arc<Engine>,
    lock: GlobalTasLock,
    cursor: GlobalPtr<u64>,
}

impl GlobalMemoryPool {
    /// Metadata prefix at the start of the global range: the allocation
    /// cursor and the lock word
    pub const RESERVED: usize = PAGE_SIZE;

    /// Collective constructor; the cursor and lock word live at the start
    /// of global memory and are initialized by node 0
    pub fn new(engine: Arc<Engine>) -> DsmResult<Self> {
        let base = engine.global_base() as usize;
        let cursor = engine.global_ptr(base as *mut u64)?;
        let lock_word = engine.global_ptr((base + 8) as *mut u64)?;

        if engine.node_id() == 0 {
            engine.atomic_store(cursor, Self::RESERVED as u64)?;
        }
        GlobalTasLock::initialize_word(&engine, lock_word)?;
        engine.barrier(1)?;

        let lock = GlobalTasLock::new(Arc::clone(&engine), lock_word);
        Ok(Self { engine, lock, cursor })
    }

    /// Remaining bytes
    pub fn available(&self) -> DsmResult<usize> {
        self.lock.lock()?;
        let cursor = self.engine.atomic_load(self.cursor, MemoryOrder::Relaxed)?;
        self.lock.unlock()?;
        Ok(self.engine.global_size() - cursor as usize)
    }

    /// Collectively reset the pool to its initial state
    ///
    /// Anything previously allocated from it becomes invalid.
    pub fn reset(&self) -> DsmResult<()> {
        self.engine.barrier(1)?;
        if self.engine.node_id() == 0 {
            self.engine
                .atomic_store(self.cursor, Self::RESERVED as u64)?;
        }
        self.engine.barrier(1)?;
        Ok(())
    }
}

impl MemoryPool for GlobalMemoryPool {
    fn reserve(&self, size: usize) -> DsmResult<usize> {
        // Word-align every reservation so typed allocations stay usable
        let size = align_forwards(size, 8);
        self.lock.lock()?;
        let cursor = self.engine.atomic_load(self.cursor, MemoryOrder::Relaxed)? as usize;
        if cursor + size > self.engine.global_size() {
            self.lock.unlock()?;
            return Err(DsmError::PoolExhausted);
        }
        self.engine
            .atomic_store(self.cursor, (cursor + size) as u64)?;
        self.lock.unlock()?;
        Ok(self.engine.global_base() as usize + cursor)
    }

    fn grow(&self, _size: usize) -> DsmResult<()> {
        // The global pool is the whole address space; it cannot grow
        Err(DsmError::PoolExhausted)
    }
}

/// How a dynamic pool refills itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthMode {
    /// Every node grows its own pool independently
    EveryNode,
    /// Node 0 grows and broadcasts the new base (collective pools)
    NodeZeroOnly,
}

#[derive(Debug, Default)]
struct DynamicPoolState {
    /// Base as an offset from the global base, identical on all nodes for
    /// collective pools
    base_offset: usize,
    size: usize,
    used: usize,
}

/// Growable pool backed by global-pool allocations
pub struct DynamicPool {
    engine: Arc<Engine>,
    backing: Arc<dyn MemoryPool>,
    mode: GrowthMode,
    chunk_size: usize,
    state: Mutex<DynamicPoolState>,
}

impl DynamicPool {
    pub fn new(
        engine: Arc<Engine>,
        backing: Arc<dyn MemoryPool>,
        mode: GrowthMode,
        chunk_size: usize,
    ) -> Self {
        Self {
            engine,
            backing,
            mode,
            chunk_size,
            state: Mutex::new(DynamicPoolState::default()),
        }
    }

    /// Collectively discard the pool's current arena
    pub fn reset(&self) {
        *self.state.lock().expect("pool state poisoned") = DynamicPoolState::default();
    }
}

impl MemoryPool for DynamicPool {
    fn reserve(&self, size: usize) -> DsmResult<usize> {
        let size = align_forwards(size, 8);
        let mut state = self.state.lock().expect("pool state poisoned");
        if state.used + size > state.size {
            return Err(DsmError::PoolExhausted);
        }
        let addr = self.engine.global_base() as usize + state.base_offset + state.used;
        state.used += size;
        Ok(addr)
    }

    fn grow(&self, size: usize) -> DsmResult<()> {
        let want = align_forwards(size.max(self.chunk_size), PAGE_SIZE);
        let mut state = self.state.lock().expect("pool state poisoned");

        let mut base_offset = 0usize;
        let grower = match self.mode {
            GrowthMode::EveryNode => true,
            GrowthMode::NodeZeroOnly => self.engine.node_id() == 0,
        };
        if grower {
            let addr = self.backing.reserve(want)?;
            base_offset = addr - self.engine.global_base() as usize;
        }
        if self.mode == GrowthMode::NodeZeroOnly {
            // Everyone adopts node 0's arena
            self.engine.broadcast(0, &mut base_offset as *mut usize)?;
            self.engine.barrier(1)?;
        }

        state.base_offset = base_offset;
        state.size = want;
        state.used = 0;
        Ok(())
    }
}

impl std::fmt::Debug for DynamicPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicPool")
            .field("mode", &self.mode)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}
