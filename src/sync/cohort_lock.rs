//! Cohort lock
//!
//! A cluster-wide mutex that hands itself over as locally as possible:
//! first between threads of the same NUMA domain (MCS lock), then between
//! NUMA domains of the same process (ticket lock), and only then between
//! nodes (global test-and-set lock). Handover counts bound how long a level
//! can starve the levels above it; both thresholds come from the engine
//! configuration.
//!
//! Construction is collective because the global lock word is allocated in
//! global memory. The lock value itself must stay node-local.

use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::distribution::GlobalPtr;
use crate::runtime::Engine;
use crate::sync::global_tas_lock::GlobalTasLock;
use crate::sync::intranode::{McsGuard, McsLock, TicketLock};
use crate::types::DsmResult;

const NO_OWNER: isize = -1;

/// Proof of holding the cohort lock; consumed by `unlock`
#[derive(Debug)]
pub struct CohortGuard {
    numa: usize,
    mcs: McsGuard,
}

/// Cluster-wide lock with NUMA-aware handover
#[derive(Debug)]
pub struct CohortLock {
    global: GlobalTasLock,
    local_locks: Vec<McsLock>,
    node_lock: TicketLock,
    /// Consecutive handovers inside each NUMA domain
    handovers: Vec<AtomicUsize>,
    /// Consecutive handovers between NUMA domains
    numa_handover: AtomicUsize,
    /// Which NUMA domain currently owns the intra-process level
    node_lock_owner: AtomicIsize,
    /// Whether this process holds the global lock
    has_global_lock: AtomicBool,
    max_handover_local: usize,
    max_handover_remote: usize,
}

impl CohortLock {
    /// Build a cohort lock over an initialized global lock word
    ///
    /// All nodes must construct their lock over the same word; use
    /// [`GlobalTasLock::initialize_word`] on the word first.
    pub fn new(engine: Arc<Engine>, word: GlobalPtr<u64>) -> Self {
        // NUMA topology discovery is delegated to the deployment; a single
        // domain keeps the handover logic intact on any machine
        let numa_domains = 1;
        let cfg = engine.config();
        let max_handover_local = cfg.lock_handover_local;
        let max_handover_remote = cfg.lock_handover_remote;
        Self {
            global: GlobalTasLock::new(engine, word),
            local_locks: (0..numa_domains).map(|_| McsLock::new()).collect(),
            node_lock: TicketLock::new(),
            handovers: (0..numa_domains).map(|_| AtomicUsize::new(0)).collect(),
            numa_handover: AtomicUsize::new(0),
            node_lock_owner: AtomicIsize::new(NO_OWNER),
            has_global_lock: AtomicBool::new(false),
            max_handover_local,
            max_handover_remote,
        }
    }

    fn numa_domain(&self) -> usize {
        0
    }

    /// Acquire the lock at every level this thread does not already cover
    pub fn lock(&self) -> DsmResult<CohortGuard> {
        let numa = self.numa_domain();
        let mcs = self.local_locks[numa].lock();

        if self.node_lock_owner.load(Ordering::Acquire) != numa as isize {
            self.node_lock.lock();
            self.node_lock_owner.store(numa as isize, Ordering::Release);
            if !self.has_global_lock.load(Ordering::Acquire) {
                self.global.lock()?;
                self.has_global_lock.store(true, Ordering::Release);
            }
        }
        Ok(CohortGuard { numa, mcs })
    }

    /// Release the lock, handing over as locally as the thresholds allow
    pub fn unlock(&self, guard: CohortGuard) -> DsmResult<()> {
        let numa = guard.numa;
        let local_waiters = self.local_locks[numa].is_contended(&guard.mcs);

        if local_waiters && self.handovers[numa].load(Ordering::Relaxed) < self.max_handover_local
        {
            // Hand over inside the NUMA domain
            self.handovers[numa].fetch_add(1, Ordering::Relaxed);
        } else {
            self.handovers[numa].store(0, Ordering::Relaxed);
            self.node_lock_owner.store(NO_OWNER, Ordering::Release);

            if self.node_lock.is_contended()
                && self.numa_handover.load(Ordering::Relaxed) < self.max_handover_remote
            {
                // Hand over to another NUMA domain of this process
                self.numa_handover.fetch_add(1, Ordering::Relaxed);
            } else {
                // Hand over to another node
                self.has_global_lock.store(false, Ordering::Release);
                self.numa_handover.store(0, Ordering::Relaxed);
                self.global.unlock()?;
            }
            self.node_lock.unlock();
        }
        self.local_locks[numa].unlock(guard.mcs);
        Ok(())
    }
}
