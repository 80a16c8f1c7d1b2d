//! Engine statistics
//!
//! Atomic counters updated from the fault and synchronization paths, with a
//! serializable snapshot for reporting. Counters are cache-padded; the hot
//! paths touch them on every fault.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_utils::CachePadded;
use serde::Serialize;

/// Atomic statistics for one engine instance
#[derive(Debug, Default)]
pub struct EngineStatistics {
    /// Remote lines fetched into the cache
    loads: CachePadded<AtomicU64>,
    /// Pages written back through the diff path
    stores: CachePadded<AtomicU64>,
    /// Cache lines drained by a full or partial write-buffer flush
    write_backs: CachePadded<AtomicU64>,
    /// Collective barriers completed
    barriers: CachePadded<AtomicU64>,
    /// Global lock acquisitions that required a cluster acquire
    lock_transfers: CachePadded<AtomicU64>,
    /// Time spent in read-miss handling
    load_time_ns: CachePadded<AtomicU64>,
    /// Time spent in write-upgrade handling
    store_time_ns: CachePadded<AtomicU64>,
    /// Time spent flushing the write buffer
    flush_time_ns: CachePadded<AtomicU64>,
    /// Time spent in self-invalidation
    self_invalidation_time_ns: CachePadded<AtomicU64>,
    /// Time spent in barriers
    barrier_time_ns: CachePadded<AtomicU64>,
    /// Time spent in selective acquire
    selective_acquire_time_ns: CachePadded<AtomicU64>,
    /// Time spent in selective release
    selective_release_time_ns: CachePadded<AtomicU64>,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Serialize)]
pub struct StatisticsSnapshot {
    pub loads: u64,
    pub stores: u64,
    pub write_backs: u64,
    pub barriers: u64,
    pub lock_transfers: u64,
    pub load_time_ns: u64,
    pub store_time_ns: u64,
    pub flush_time_ns: u64,
    pub self_invalidation_time_ns: u64,
    pub barrier_time_ns: u64,
    pub selective_acquire_time_ns: u64,
    pub selective_release_time_ns: u64,
}

impl EngineStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_load(&self, started: Instant) {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.load_time_ns
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_store(&self) {
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_time(&self, started: Instant) {
        self.store_time_ns
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_write_backs(&self, lines: u64) {
        self.write_backs.fetch_add(lines, Ordering::Relaxed);
    }

    pub fn record_flush(&self, started: Instant) {
        self.flush_time_ns
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_barrier(&self, started: Instant) {
        self.barriers.fetch_add(1, Ordering::Relaxed);
        self.barrier_time_ns
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_lock_transfer(&self) {
        self.lock_transfers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_self_invalidation(&self, started: Instant) {
        self.self_invalidation_time_ns
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_selective_acquire(&self, started: Instant) {
        self.selective_acquire_time_ns
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_selective_release(&self, started: Instant) {
        self.selective_release_time_ns
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    /// Reset all counters, used by `reset()` between test phases
    pub fn clear(&self) {
        for counter in [
            &self.loads,
            &self.stores,
            &self.write_backs,
            &self.barriers,
            &self.lock_transfers,
            &self.load_time_ns,
            &self.store_time_ns,
            &self.flush_time_ns,
            &self.self_invalidation_time_ns,
            &self.barrier_time_ns,
            &self.selective_acquire_time_ns,
            &self.selective_release_time_ns,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            loads: self.loads.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            write_backs: self.write_backs.load(Ordering::Relaxed),
            barriers: self.barriers.load(Ordering::Relaxed),
            lock_transfers: self.lock_transfers.load(Ordering::Relaxed),
            load_time_ns: self.load_time_ns.load(Ordering::Relaxed),
            store_time_ns: self.store_time_ns.load(Ordering::Relaxed),
            flush_time_ns: self.flush_time_ns.load(Ordering::Relaxed),
            self_invalidation_time_ns: self.self_invalidation_time_ns.load(Ordering::Relaxed),
            barrier_time_ns: self.barrier_time_ns.load(Ordering::Relaxed),
            selective_acquire_time_ns: self.selective_acquire_time_ns.load(Ordering::Relaxed),
            selective_release_time_ns: self.selective_release_time_ns.load(Ordering::Relaxed),
        }
    }

    /// Log the counters for one node
    pub fn report(&self, node: usize) {
        let snap = self.snapshot();
        log::info!(
            "node {}: loads={} stores={} write_backs={} barriers={} lock_transfers={}",
            node,
            snap.loads,
            snap.stores,
            snap.write_backs,
            snap.barriers,
            snap.lock_transfers
        );
        log::info!(
            "node {}: load={}ms store={}ms flush={}ms self_inv={}ms barrier={}ms",
            node,
            snap.load_time_ns / 1_000_000,
            snap.store_time_ns / 1_000_000,
            snap.flush_time_ns / 1_000_000,
            snap.self_invalidation_time_ns / 1_000_000,
            snap.barrier_time_ns / 1_000_000
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_clear() {
        let stats = EngineStatistics::new();
        let t = Instant::now();
        stats.record_load(t);
        stats.record_load(t);
        stats.record_store();
        stats.record_write_backs(3);
        stats.record_barrier(t);

        let snap = stats.snapshot();
        assert_eq!(snap.loads, 2);
        assert_eq!(snap.stores, 1);
        assert_eq!(snap.write_backs, 3);
        assert_eq!(snap.barriers, 1);

        stats.clear();
        let snap = stats.snapshot();
        assert_eq!(snap.loads, 0);
        assert_eq!(snap.write_backs, 0);
    }
}
