//! Public process-level API
//!
//! One `init` per process wires everything together: configuration from the
//! environment, the virtual reservation, the backend, the fault handler in
//! distributed mode, and the memory pools. Every other entry point routes
//! through the installed engine.
//!
//! ```no_run
//! shardmem::init(1 << 30, 1 << 26).unwrap();
//! let counter = shardmem::conew::<i64>().unwrap();
//! shardmem::atomic::fetch_add(counter, 1, shardmem::MemoryOrder::AcqRel).unwrap();
//! shardmem::barrier(1).unwrap();
//! shardmem::finalize().unwrap();
//! ```

use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::alloc::{AllocParams, DynamicPool, GenericAllocator, GlobalMemoryPool, GrowthMode};
use crate::backend::{cluster, Backend};
use crate::coherence::signal;
use crate::distribution::GlobalPtr;
use crate::runtime::config::EngineConfig;
use crate::runtime::{self, Engine};
use crate::sync::cohort_lock::CohortLock;
use crate::sync::global_tas_lock::GlobalTasLock;
use crate::types::{DsmError, DsmResult, NodeId};

pub use crate::sync::atomics::MemoryOrder;

/// Refill granularity of the dynamic and collective pools
const PREPOOL_CHUNK: usize = 4096;

/// Everything the public API needs besides the engine
struct Runtime {
    engine: Arc<Engine>,
    global_pool: Arc<GlobalMemoryPool>,
    collective_pool: Arc<DynamicPool>,
    dynamic_pool: Arc<DynamicPool>,
    collective_allocator: GenericAllocator,
    dynamic_allocator: GenericAllocator,
}

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

fn rt() -> DsmResult<&'static Runtime> {
    RUNTIME
        .get()
        .ok_or_else(|| DsmError::Config("shardmem::init has not been called".to_string()))
}

/// Initialize the process as a one-node deployment
///
/// `size` and `cache_size` override `ARGO_MEMORY_SIZE` and
/// `ARGO_CACHE_SIZE` when nonzero. Call once per process; collective.
pub fn init(size: usize, cache_size: usize) -> DsmResult<()> {
    let mut cfg = EngineConfig::from_env()?;
    if size > 0 {
        cfg.memory_size = size;
    }
    if cache_size > 0 {
        cfg.cache_size = cache_size;
    }
    init_with_backend(cfg, Arc::new(cluster::single_node()))
}

/// Initialize over an explicit backend, e.g. a multi-node interconnect
pub fn init_with_backend(mut cfg: EngineConfig, backend: Arc<dyn Backend>) -> DsmResult<()> {
    // Room for the global pool's metadata prefix, transparent to callers
    cfg.memory_size += GlobalMemoryPool::RESERVED;

    let distributed = backend.number_of_nodes() > 1;
    let engine = Engine::new(cfg, backend, distributed)?;
    runtime::install_engine(Arc::clone(&engine))?;
    if distributed {
        signal::install_fault_handler()?;
    }

    let global_pool = Arc::new(GlobalMemoryPool::new(Arc::clone(&engine))?);
    let collective_pool = Arc::new(DynamicPool::new(
        Arc::clone(&engine),
        Arc::clone(&global_pool) as Arc<dyn crate::alloc::MemoryPool>,
        GrowthMode::NodeZeroOnly,
        PREPOOL_CHUNK,
    ));
    let dynamic_pool = Arc::new(DynamicPool::new(
        Arc::clone(&engine),
        Arc::clone(&global_pool) as Arc<dyn crate::alloc::MemoryPool>,
        GrowthMode::EveryNode,
        PREPOOL_CHUNK,
    ));

    let runtime = Runtime {
        collective_allocator: GenericAllocator::new(
            Arc::clone(&collective_pool) as Arc<dyn crate::alloc::MemoryPool>
        ),
        dynamic_allocator: GenericAllocator::new(
            Arc::clone(&dynamic_pool) as Arc<dyn crate::alloc::MemoryPool>
        ),
        engine,
        global_pool,
        collective_pool,
        dynamic_pool,
    };
    RUNTIME
        .set(runtime)
        .map_err(|_| DsmError::Config("shardmem is already initialized".to_string()))
}

/// Collective teardown
pub fn finalize() -> DsmResult<()> {
    rt()?.engine.finalize()
}

/// Reset pools and coherence state, for tests
pub fn reset() -> DsmResult<()> {
    let runtime = rt()?;
    runtime.global_pool.reset()?;
    runtime.collective_pool.reset();
    runtime.dynamic_pool.reset();
    runtime.collective_allocator.reset();
    runtime.dynamic_allocator.reset();
    runtime.engine.reset_coherence(1)
}

pub fn node_id() -> NodeId {
    runtime::engine().node_id()
}

pub fn number_of_nodes() -> usize {
    runtime::engine().number_of_nodes()
}

pub fn global_base() -> *mut u8 {
    runtime::engine().global_base()
}

pub fn global_size() -> usize {
    runtime::engine().global_size()
}

/// Collective barrier over all nodes, entered by `threads` threads each
pub fn barrier(threads: usize) -> DsmResult<()> {
    runtime::engine().barrier(threads)
}

/// Copy the value at `ptr` on node `source` over every node's copy
pub fn broadcast<T: Copy>(source: NodeId, ptr: *mut T) -> DsmResult<()> {
    runtime::engine().broadcast(source, ptr)
}

/// Make this node's writes visible to subsequent acquires
pub fn release() -> DsmResult<()> {
    runtime::engine().release()
}

/// Observe every write released before this point
pub fn acquire() -> DsmResult<()> {
    runtime::engine().acquire()
}

/// Release restricted to `[addr, addr + size)`
pub fn selective_release(addr: *const u8, size: usize) -> DsmResult<()> {
    runtime::engine().selective_release(addr, size)
}

/// Acquire restricted to `[addr, addr + size)`
pub fn selective_acquire(addr: *const u8, size: usize) -> DsmResult<()> {
    runtime::engine().selective_acquire(addr, size)
}

/// Locate a raw global pointer
pub fn global_ptr<T>(ptr: *mut T) -> DsmResult<GlobalPtr<T>> {
    runtime::engine().global_ptr(ptr)
}

/// Atomic operations over global pointers
pub mod atomic {
    use super::*;

    pub fn load<T: Copy>(ptr: GlobalPtr<T>, order: MemoryOrder) -> DsmResult<T> {
        runtime::engine().atomic_load(ptr, order)
    }

    pub fn store<T: Copy>(ptr: GlobalPtr<T>, value: T) -> DsmResult<()> {
        runtime::engine().atomic_store(ptr, value)
    }

    pub fn exchange<T: Copy>(ptr: GlobalPtr<T>, desired: T, order: MemoryOrder) -> DsmResult<T> {
        runtime::engine().atomic_exchange(ptr, desired, order)
    }

    /// Compare-and-swap; returns the observed value
    pub fn compare_exchange<T: Copy>(
        ptr: GlobalPtr<T>,
        expected: T,
        desired: T,
        order: MemoryOrder,
    ) -> DsmResult<T> {
        runtime::engine().atomic_compare_exchange(ptr, expected, desired, order)
    }

    pub fn fetch_add<T: crate::sync::atomics::AtomicOperand>(
        ptr: GlobalPtr<T>,
        value: T,
        order: MemoryOrder,
    ) -> DsmResult<T> {
        runtime::engine().atomic_fetch_add(ptr, value, order)
    }
}

/// Allocate `size` bytes collectively; all nodes receive the same address
pub fn collective_alloc(size: usize) -> DsmResult<*mut u8> {
    Ok(rt()?.collective_allocator.allocate(size)? as *mut u8)
}

/// Free a collective allocation; collective like the allocation was
pub fn collective_free(ptr: *mut u8) -> DsmResult<()> {
    rt()?.collective_allocator.free(ptr as usize);
    Ok(())
}

/// Allocate `size` bytes from this node's dynamic pool
pub fn dynamic_alloc(size: usize) -> DsmResult<*mut u8> {
    Ok(rt()?.dynamic_allocator.allocate(size)? as *mut u8)
}

/// Free a dynamic allocation
pub fn dynamic_free(ptr: *mut u8) -> DsmResult<()> {
    rt()?.dynamic_allocator.free(ptr as usize);
    Ok(())
}

/// Collectively construct a `T` in global memory
///
/// The home node of the address default-initializes it; all nodes
/// synchronize before the pointer is used, unless the parameters say
/// otherwise.
pub fn conew<T: Default>() -> DsmResult<GlobalPtr<T>> {
    conew_with(AllocParams::default())
}

/// `conew` with explicit allocation parameters
pub fn conew_with<T: Default>(params: AllocParams) -> DsmResult<GlobalPtr<T>> {
    let runtime = rt()?;
    let initialize = params.initialize.unwrap_or(true);
    let synchronize = params.synchronize.unwrap_or(initialize);

    let addr = runtime.collective_allocator.allocate(std::mem::size_of::<T>())?;
    let ptr = runtime.engine.global_ptr(addr as *mut T)?;
    if initialize && runtime.engine.node_id() == ptr.node() {
        unsafe { std::ptr::write(ptr.get(), T::default()) };
    }
    if synchronize {
        runtime.engine.barrier(1)?;
    }
    Ok(ptr)
}

/// Collectively construct an array of `n` default values
pub fn conew_array<T: Default>(n: usize) -> DsmResult<GlobalPtr<T>> {
    conew_array_with(n, AllocParams::default())
}

/// `conew_array` with explicit allocation parameters
pub fn conew_array_with<T: Default>(n: usize, params: AllocParams) -> DsmResult<GlobalPtr<T>> {
    let runtime = rt()?;
    let initialize = params.initialize.unwrap_or(true);
    let synchronize = params.synchronize.unwrap_or(initialize);

    let addr = runtime
        .collective_allocator
        .allocate(n * std::mem::size_of::<T>())?;
    let ptr = runtime.engine.global_ptr(addr as *mut T)?;
    if initialize && runtime.engine.node_id() == ptr.node() {
        let base = ptr.get();
        for i in 0..n {
            unsafe { std::ptr::write(base.add(i), T::default()) };
        }
    }
    if synchronize {
        runtime.engine.barrier(1)?;
    }
    Ok(ptr)
}

/// Collectively destroy a `conew` allocation
pub fn codelete<T>(ptr: GlobalPtr<T>) -> DsmResult<()> {
    codelete_with(ptr, AllocParams::default())
}

/// `codelete` with explicit allocation parameters
pub fn codelete_with<T>(ptr: GlobalPtr<T>, params: AllocParams) -> DsmResult<()> {
    let runtime = rt()?;
    let deinitialize = params.deinitialize.unwrap_or(true);
    let synchronize = params.synchronize.unwrap_or(deinitialize);

    if deinitialize && runtime.engine.node_id() == ptr.node() {
        unsafe { std::ptr::drop_in_place(ptr.get()) };
    }
    if synchronize {
        runtime.engine.barrier(1)?;
    }
    runtime.collective_allocator.free(ptr.get() as usize);
    Ok(())
}

/// Construct a `T` from this node's dynamic pool; never synchronizes
pub fn new_dynamic<T: Default>() -> DsmResult<GlobalPtr<T>> {
    let runtime = rt()?;
    let addr = runtime.dynamic_allocator.allocate(std::mem::size_of::<T>())?;
    let ptr = runtime.engine.global_ptr(addr as *mut T)?;
    unsafe { std::ptr::write(ptr.get(), T::default()) };
    Ok(ptr)
}

/// Destroy a `new_dynamic` allocation; never synchronizes
pub fn delete_dynamic<T>(ptr: GlobalPtr<T>) -> DsmResult<()> {
    let runtime = rt()?;
    unsafe { std::ptr::drop_in_place(ptr.get()) };
    runtime.dynamic_allocator.free(ptr.get() as usize);
    Ok(())
}

/// Collectively create a global test-and-set lock
pub fn new_global_lock() -> DsmResult<GlobalTasLock> {
    let runtime = rt()?;
    let word = conew_with::<u64>(AllocParams::default().no_initialize().no_synchronize())?;
    GlobalTasLock::initialize_word(&runtime.engine, word)?;
    runtime.engine.barrier(1)?;
    Ok(GlobalTasLock::new(Arc::clone(&runtime.engine), word))
}

/// Collectively create a cohort lock
pub fn new_cohort_lock() -> DsmResult<CohortLock> {
    let runtime = rt()?;
    let word = conew_with::<u64>(AllocParams::default().no_initialize().no_synchronize())?;
    GlobalTasLock::initialize_word(&runtime.engine, word)?;
    runtime.engine.barrier(1)?;
    Ok(CohortLock::new(Arc::clone(&runtime.engine), word))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PAGE_SIZE;

    /// One end-to-end pass through the public surface; a single test body
    /// because the process-wide runtime can only be initialized once
    #[test]
    fn single_process_lifecycle() {
        init(64 * PAGE_SIZE, 8 * PAGE_SIZE).unwrap();
        assert_eq!(node_id(), 0);
        assert_eq!(number_of_nodes(), 1);
        assert!(global_size() >= 64 * PAGE_SIZE);

        // Collective array allocation: every byte reads as zero
        let array = conew_array::<i32>(1000).unwrap();
        barrier(1).unwrap();
        let values = unsafe { std::slice::from_raw_parts(array.get(), 1000) };
        assert!(values.iter().all(|&v| v == 0));

        // Atomics over a collectively allocated counter
        let counter = conew::<i32>().unwrap();
        for _ in 0..100 {
            atomic::fetch_add(counter, 1, MemoryOrder::AcqRel).unwrap();
        }
        barrier(1).unwrap();
        assert_eq!(atomic::load(counter, MemoryOrder::Acquire).unwrap(), 100);

        // The TAS lock serializes plain updates
        let lock = new_global_lock().unwrap();
        let cell = conew::<u64>().unwrap();
        for _ in 0..10 {
            lock.lock().unwrap();
            unsafe { cell.write(cell.read() + 1) };
            lock.unlock().unwrap();
        }
        assert_eq!(unsafe { cell.read() }, 10);

        // Selective coherence round trip on a private range
        let span = conew_array::<i32>(512).unwrap();
        let bytes = 512 * std::mem::size_of::<i32>();
        for i in 0..512 {
            unsafe { span.get().add(i).write(42) };
        }
        selective_release(span.get() as *const u8, bytes).unwrap();
        selective_acquire(span.get() as *const u8, bytes).unwrap();
        let sum: i64 = unsafe { std::slice::from_raw_parts(span.get(), 512) }
            .iter()
            .map(|&v| v as i64)
            .sum();
        assert_eq!(sum, 42 * 512);

        // Dynamic allocations come from this node's pool and free cleanly
        let local = new_dynamic::<u64>().unwrap();
        unsafe { local.write(7) };
        assert_eq!(unsafe { local.read() }, 7);
        delete_dynamic(local).unwrap();

        codelete(counter).unwrap();

        // Reset rewinds the pools: the next collective allocation starts
        // over right behind the metadata prefix
        reset().unwrap();
        let after = conew::<u64>().unwrap().get() as usize;
        assert_eq!(
            after,
            global_base() as usize + crate::alloc::GlobalMemoryPool::RESERVED
        );

        finalize().unwrap();
    }
}
