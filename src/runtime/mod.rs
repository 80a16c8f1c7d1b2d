//! Engine context
//!
//! Every piece of per-process coherence state lives in one [`Engine`] value:
//! the virtual reservation, the page cache, the distribution policy, the
//! directory window buffers, and the two locks that order all coherence
//! transitions (the cache lock and the one-sided-operation serializer).
//! Engines are ordinary values so tests can run several "nodes" in one
//! process; the process-wide instance used by the public API and the fault
//! handler is installed once via [`install_engine`].

pub mod config;
pub mod stats;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use crate::backend::{Backend, WindowKind};
use crate::cache::CacheState;
use crate::distribution::first_touch::{OWNER_NULL, OWNER_WORDS};
use crate::distribution::{Distribution, GlobalPtr};
use crate::runtime::config::{EngineConfig, PolicyKind};
use crate::runtime::stats::EngineStatistics;
use crate::sync::ThreadBarrier;
use crate::types::{align_forwards, DsmResult, NodeId, BLOCK_SIZE, CACHELINE, PAGE_SIZE};
use crate::vm::{Protection, VirtualMemory};

/// Fixed address layout of one engine
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    /// Start of the global address window
    pub global_start: usize,
    /// Size of the global space in bytes
    pub global_size: usize,
    /// One node's share of the global space
    pub chunk_size: usize,
    /// Page cache capacity in pages
    pub cache_pages: usize,
    /// Number of directory words (two per cached line address)
    pub classification_size: usize,
    /// Backing offset of this node's chunk (the cache slots sit below it)
    pub chunk_backing_offset: usize,
    /// Mapped base of the cache slot backing
    pub cache_base: usize,
    /// Mapped base of this node's chunk backing
    pub chunk_base: usize,
}

impl Geometry {
    /// Directory index of a line address: two words per line, wrapped over
    /// the directory size
    pub fn classification_index(&self, addr: usize) -> usize {
        (2 * (addr / BLOCK_SIZE)) % self.classification_size
    }
}

/// Process-wide coherence engine
pub struct Engine {
    pub(crate) cfg: EngineConfig,
    pub(crate) vm: VirtualMemory,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) dist: Distribution,
    pub(crate) geometry: Geometry,
    /// Cache lock: every coherence transition holds it
    pub(crate) cache: Mutex<CacheState>,
    /// One-sided-operation serializer, taken after the cache lock
    pub(crate) comm: Mutex<()>,
    pub(crate) stats: EngineStatistics,
    /// Sharer/writer directory words, registered as this node's window
    #[allow(dead_code)]
    sharers: Box<[u64]>,
    /// First-touch ownership directory (first-touch policy only)
    #[allow(dead_code)]
    owners: Option<Box<[u64]>>,
    /// First-touch backing offset table (first-touch policy only)
    #[allow(dead_code)]
    offsets: Option<Box<[u64]>>,
    /// Gate so a single thread performs the node's share of a barrier
    pub(crate) barrier_gate: Mutex<()>,
    /// Thread rendezvous barriers, one per participant count
    pub(crate) thread_barriers: Mutex<HashMap<usize, Arc<ThreadBarrier>>>,
    finalized: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("node", &self.backend.node_id())
            .field("nodes", &self.backend.number_of_nodes())
            .field("geometry", &self.geometry)
            .finish()
    }
}

impl Engine {
    /// Build an engine over `backend`
    ///
    /// Collective: every node of the backend's cluster must call this
    /// concurrently, with identical configuration. With `fixed_reservation`
    /// the global window lands at the process-identical base address.
    pub fn new(
        cfg: EngineConfig,
        backend: Arc<dyn Backend>,
        fixed_reservation: bool,
    ) -> DsmResult<Arc<Self>> {
        cfg.validate()?;
        let nodes = backend.number_of_nodes();

        // Standardise the global space: room for every node, aligned so all
        // policies produce in-range offsets
        let padding =
            Distribution::padding_pages(cfg.allocation_policy, nodes, cfg.allocation_block_size);
        let mut size = cfg.memory_size.max(PAGE_SIZE * nodes);
        size = align_forwards(size, PAGE_SIZE * CACHELINE * nodes * padding);
        let chunk_size = size / nodes;

        // Cache between two lines and the global size, in whole lines
        let mut cache_bytes = cfg.cache_size.min(size);
        cache_bytes = align_forwards(cache_bytes, PAGE_SIZE * CACHELINE);
        cache_bytes = cache_bytes.max(PAGE_SIZE * CACHELINE * 2);
        let cache_pages = cache_bytes / PAGE_SIZE;

        let vm = VirtualMemory::reserve(cache_bytes + chunk_size, size, fixed_reservation)?;
        let (cache_base, _cache_backing) = vm.allocate_mappable(PAGE_SIZE, cache_bytes)?;
        let (chunk_base, chunk_backing_offset) = vm.allocate_mappable(PAGE_SIZE, chunk_size)?;

        backend.register_window(WindowKind::Data, chunk_base, chunk_size)?;

        let classification_size = 2 * cache_pages;
        let sharers = vec![0u64; classification_size].into_boxed_slice();
        backend.register_window(
            WindowKind::Sharers,
            sharers.as_ptr() as *mut u8,
            classification_size * 8,
        )?;

        let (owners, offsets) = if cfg.allocation_policy == PolicyKind::FirstTouch {
            let owners = vec![OWNER_NULL; OWNER_WORDS * (size / PAGE_SIZE)].into_boxed_slice();
            let offsets = vec![0u64; nodes].into_boxed_slice();
            backend.register_window(
                WindowKind::OwnersDir,
                owners.as_ptr() as *mut u8,
                owners.len() * 8,
            )?;
            backend.register_window(
                WindowKind::OffsetsTbl,
                offsets.as_ptr() as *mut u8,
                offsets.len() * 8,
            )?;
            (Some(owners), Some(offsets))
        } else {
            (None, None)
        };

        let dist = Distribution::new(
            cfg.allocation_policy,
            nodes,
            size,
            cfg.allocation_block_size,
            Arc::clone(&backend),
        );

        let geometry = Geometry {
            global_start: vm.start() as usize,
            global_size: size,
            chunk_size,
            cache_pages,
            classification_size,
            chunk_backing_offset,
            cache_base: cache_base as usize,
            chunk_base: chunk_base as usize,
        };

        let cache = CacheState::new(
            cache_pages,
            nodes,
            cfg.write_buffer_size,
            cfg.write_buffer_write_back_size,
        );

        let engine = Arc::new(Engine {
            cfg,
            vm,
            backend,
            dist,
            geometry,
            cache: Mutex::new(cache),
            comm: Mutex::new(()),
            stats: EngineStatistics::new(),
            sharers,
            owners,
            offsets,
            barrier_gate: Mutex::new(()),
            thread_barriers: Mutex::new(HashMap::new()),
            finalized: AtomicBool::new(false),
        });

        if !engine.is_distributed() {
            // Single process: the whole window aliases the chunk read/write
            // and no fault handling is involved
            engine.vm.map(
                engine.vm.start(),
                size,
                chunk_backing_offset,
                Protection::ReadWrite,
            )?;
        }

        log::debug!(
            "node {}/{}: global {:#x}+{:#x}, cache {} pages, policy {:?}",
            engine.node_id(),
            nodes,
            engine.geometry.global_start,
            size,
            cache_pages,
            engine.cfg.allocation_policy
        );

        engine.backend.barrier();
        engine.reset_coherence(1)?;
        Ok(engine)
    }

    pub fn node_id(&self) -> NodeId {
        self.backend.node_id()
    }

    pub fn number_of_nodes(&self) -> usize {
        self.backend.number_of_nodes()
    }

    pub fn global_base(&self) -> *mut u8 {
        self.geometry.global_start as *mut u8
    }

    pub fn global_size(&self) -> usize {
        self.geometry.global_size
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn statistics(&self) -> &EngineStatistics {
        &self.stats
    }

    /// Whether coherence runs through the fault path
    ///
    /// A one-node cluster maps its memory read/write up front; the cache,
    /// directory and write buffer only engage between real nodes.
    pub fn is_distributed(&self) -> bool {
        self.number_of_nodes() > 1
    }

    /// Whether `addr` lies inside the global window
    pub fn owns_address(&self, addr: usize) -> bool {
        self.vm.contains(addr)
    }

    /// Locate a raw pointer and wrap it as a global pointer
    pub fn global_ptr<T>(&self, ptr: *mut T) -> DsmResult<GlobalPtr<T>> {
        if !self.owns_address(ptr as usize) {
            return Err(crate::types::DsmError::Distribution(format!(
                "{:p} is not a global memory address",
                ptr
            )));
        }
        let addr = ptr as usize - self.geometry.global_start;
        let (home, offset) = self.dist.locate(addr)?;
        Ok(GlobalPtr::from_parts(home, offset, ptr))
    }

    /// Tear the engine down collectively
    ///
    /// Barrier, reopen the range for teardown writes, barrier again, report
    /// statistics and drop the window registrations.
    pub fn finalize(&self) -> DsmResult<()> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.barrier(1)?;
        self.vm.protect(
            self.global_base(),
            self.global_size(),
            Protection::ReadWrite,
        )?;
        self.backend.barrier();
        if self.cfg.print_statistics {
            self.stats.report(self.node_id());
        }
        self.backend.barrier();
        self.backend.deregister_windows();
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Stale window registrations must never outlive the buffers they
        // point into
        self.backend.deregister_windows();
    }
}

/// The process-wide engine used by the public API and the fault handler
static ENGINE: OnceCell<Arc<Engine>> = OnceCell::new();

/// Install the process-wide engine; fails if one is already installed
pub fn install_engine(engine: Arc<Engine>) -> DsmResult<()> {
    ENGINE.set(engine).map_err(|_| {
        crate::types::DsmError::Config("the engine is already initialized".to_string())
    })
}

/// The process-wide engine, if initialized
pub fn engine_opt() -> Option<&'static Arc<Engine>> {
    ENGINE.get()
}

/// The process-wide engine; panics when called before `init`
pub fn engine() -> &'static Arc<Engine> {
    ENGINE.get().expect("shardmem::init has not been called")
}
