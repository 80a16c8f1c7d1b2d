//! Synchronization primitives
//!
//! The collective barrier (thread rendezvous plus one node-level coherence
//! pass), broadcast, and the lock family: the global test-and-set lock over
//! a word of global memory, the intranode ticket and MCS locks, and the
//! cohort lock composed from all three.

pub mod atomics;
pub mod cohort_lock;
pub mod global_tas_lock;
pub mod intranode;

use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::runtime::Engine;
use crate::types::DsmResult;

/// Reusable rendezvous for a fixed number of threads
///
/// Generation-counted so a thread leaving one use cannot interfere with the
/// next one, even when the following barrier does not involve it.
#[derive(Debug)]
pub struct ThreadBarrier {
    state: Mutex<BarrierState>,
    cv: Condvar,
    participants: usize,
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
}

impl ThreadBarrier {
    pub fn new(participants: usize) -> Self {
        assert!(participants >= 1);
        Self {
            state: Mutex::new(BarrierState::default()),
            cv: Condvar::new(),
            participants,
        }
    }

    /// Block until all participants arrive
    pub fn wait(&self) {
        let mut state = self.state.lock().expect("thread barrier poisoned");
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.participants {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            drop(state);
            self.cv.notify_all();
            return;
        }
        while state.generation == generation {
            state = self.cv.wait(state).expect("thread barrier poisoned");
        }
    }
}

impl Engine {
    /// Rendezvous barrier for `threads` local threads per call count
    fn thread_barrier(&self, threads: usize) -> Arc<ThreadBarrier> {
        let mut barriers = self
            .thread_barriers
            .lock()
            .expect("thread barrier registry poisoned");
        Arc::clone(
            barriers
                .entry(threads)
                .or_insert_with(|| Arc::new(ThreadBarrier::new(threads))),
        )
    }

    /// Collective barrier: `threads` local threads rendezvous, one of them
    /// runs the coherence pass with the cluster, then everyone leaves
    ///
    /// All writes released before the barrier are visible to every node
    /// after it.
    pub fn barrier(&self, threads: usize) -> DsmResult<()> {
        let started = Instant::now();
        let rendezvous = self.thread_barrier(threads);
        rendezvous.wait();

        if !self.is_distributed() {
            self.stats.record_barrier(started);
            return Ok(());
        }

        // The first thread to take the gate performs the node's share of
        // the cluster barrier; the gate stays held until everyone leaves
        let gate = self.barrier_gate.try_lock();
        if gate.is_ok() {
            let mut cache = self.cache.lock().expect("cache lock poisoned");
            let _comm = self.comm.lock().expect("serializer poisoned");
            self.flush_write_buffer(&mut cache)?;
            self.backend.barrier();
            self.self_invalidation(&mut cache)?;
        }

        rendezvous.wait();
        if gate.is_ok() {
            self.stats.record_barrier(started);
        }
        Ok(())
    }

    /// Copy the value at `ptr` on `source` over every node's copy
    pub fn broadcast<T: Copy>(&self, source: usize, ptr: *mut T) -> DsmResult<()> {
        let buf = unsafe {
            std::slice::from_raw_parts_mut(ptr as *mut u8, std::mem::size_of::<T>())
        };
        self.backend.broadcast(source, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use crate::testutil::{run_cluster, small_config};

    #[test]
    fn thread_barrier_is_reusable() {
        let barrier = Arc::new(ThreadBarrier::new(4));
        let phase = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let phase = Arc::clone(&phase);
                thread::spawn(move || {
                    for round in 1..=50 {
                        barrier.wait();
                        // Every thread observes the same completed round count
                        let seen = phase.fetch_add(1, Ordering::SeqCst) / 4 + 1;
                        assert_eq!(seen, round);
                        barrier.wait();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(phase.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn cluster_barrier_orders_plain_writes() {
        run_cluster(2, small_config(), |engine| {
            let base = engine.global_base() as usize;
            let addr = base + engine.geometry.chunk_size + 3 * crate::types::PAGE_SIZE;

            if engine.node_id() == 0 {
                engine.handle_access(addr).unwrap();
                engine.handle_access(addr).unwrap();
                unsafe { (addr as *mut u64).write(5150) };
            }
            engine.barrier(1).unwrap();

            if engine.node_id() == 1 {
                // Home of the line: the barrier flushed node 0's write
                let local = (engine.geometry.chunk_base + 3 * crate::types::PAGE_SIZE)
                    as *const u64;
                assert_eq!(unsafe { local.read() }, 5150);
            }
            engine.barrier(1).unwrap();
        });
    }

    #[test]
    fn broadcast_copies_from_the_source_node() {
        run_cluster(2, small_config(), |engine| {
            let mut value: u64 = if engine.node_id() == 0 { 99 } else { 0 };
            engine.broadcast(0, &mut value as *mut u64).unwrap();
            assert_eq!(value, 99);
            engine.backend.barrier();
        });
    }
}
