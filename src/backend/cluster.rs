//! In-process cluster backend
//!
//! An arena of registered windows shared by every node handle in the
//! process. One-sided `get`/`put` are bounds-checked memory copies, the word
//! atomics are native atomics on the registered directory words, and the
//! byte atomics serialize through the target's data-window lock exactly like
//! an interconnect's passive-target epochs would.
//!
//! With one node this is the single-process backend. With several, each
//! "node" is an engine instance driven from its own thread, which is how the
//! multi-node directory and first-touch paths run in unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex, RwLock};

use crate::backend::{Backend, NumericKind, WindowKind, WindowLock};
use crate::types::{DsmError, DsmResult, NodeId};

/// A registered window: caller-owned memory exposed to every node
#[derive(Debug, Clone, Copy)]
struct WindowRegion {
    ptr: usize,
    len: usize,
}

/// Shared/exclusive lock supporting epoch-style unlock from trait methods
#[derive(Debug, Default)]
struct EpochLock {
    state: Mutex<EpochState>,
    cv: Condvar,
}

#[derive(Debug, Default)]
struct EpochState {
    readers: usize,
    writer: bool,
}

impl EpochLock {
    fn lock(&self, mode: WindowLock) {
        let mut state = self.state.lock().expect("window lock poisoned");
        match mode {
            WindowLock::Shared => {
                while state.writer {
                    state = self.cv.wait(state).expect("window lock poisoned");
                }
                state.readers += 1;
            }
            WindowLock::Exclusive => {
                while state.writer || state.readers > 0 {
                    state = self.cv.wait(state).expect("window lock poisoned");
                }
                state.writer = true;
            }
        }
    }

    fn unlock(&self, mode: WindowLock) {
        let mut state = self.state.lock().expect("window lock poisoned");
        match mode {
            WindowLock::Shared => {
                debug_assert!(state.readers > 0);
                state.readers -= 1;
            }
            WindowLock::Exclusive => {
                debug_assert!(state.writer);
                state.writer = false;
            }
        }
        drop(state);
        self.cv.notify_all();
    }
}

/// Window registry and collective state shared by all node handles
#[derive(Debug)]
pub struct ClusterArena {
    nodes: usize,
    windows: RwLock<HashMap<(NodeId, WindowKind), WindowRegion>>,
    locks: HashMap<(NodeId, WindowKind), EpochLock>,
    barrier: Barrier,
    broadcast_buf: Mutex<Vec<u8>>,
}

// Registered window pointers are only dereferenced with bounds checks, under
// the owning window's epoch lock or through atomic word views.
unsafe impl Send for ClusterArena {}
unsafe impl Sync for ClusterArena {}

impl ClusterArena {
    /// Create an arena for a fixed number of nodes
    pub fn new(nodes: usize) -> Arc<Self> {
        assert!(nodes >= 1, "a cluster has at least one node");
        let mut locks = HashMap::new();
        for node in 0..nodes {
            for kind in [
                WindowKind::Data,
                WindowKind::Sharers,
                WindowKind::OwnersDir,
                WindowKind::OffsetsTbl,
            ] {
                locks.insert((node, kind), EpochLock::default());
            }
        }
        Arc::new(Self {
            nodes,
            windows: RwLock::new(HashMap::new()),
            locks,
            barrier: Barrier::new(nodes),
            broadcast_buf: Mutex::new(Vec::new()),
        })
    }

    /// Create the handle for one node of this arena
    pub fn backend(self: &Arc<Self>, node: NodeId) -> ClusterBackend {
        assert!(node < self.nodes, "node id out of range");
        ClusterBackend {
            arena: Arc::clone(self),
            node,
        }
    }

    fn region(&self, node: NodeId, kind: WindowKind) -> DsmResult<WindowRegion> {
        self.windows
            .read()
            .expect("window registry poisoned")
            .get(&(node, kind))
            .copied()
            .ok_or_else(|| {
                DsmError::Backend(format!("window {:?} of node {} is not registered", kind, node))
            })
    }

    fn epoch_lock(&self, node: NodeId, kind: WindowKind) -> DsmResult<&EpochLock> {
        self.locks
            .get(&(node, kind))
            .ok_or_else(|| DsmError::Backend(format!("node {} out of range", node)))
    }

    fn checked_range(region: WindowRegion, offset: usize, len: usize) -> DsmResult<*mut u8> {
        if offset + len > region.len {
            return Err(DsmError::Backend(format!(
                "window access {:#x}+{:#x} beyond window of {:#x} bytes",
                offset, len, region.len
            )));
        }
        Ok((region.ptr + offset) as *mut u8)
    }

    fn word(&self, node: NodeId, kind: WindowKind, index: usize) -> DsmResult<&AtomicU64> {
        let region = self.region(node, kind)?;
        let ptr = Self::checked_range(region, index * 8, 8)?;
        // Word windows are u64-aligned by construction (engine allocates
        // them as boxed u64 slices).
        Ok(unsafe { &*(ptr as *const AtomicU64) })
    }
}

/// One node's view of the arena
#[derive(Debug, Clone)]
pub struct ClusterBackend {
    arena: Arc<ClusterArena>,
    node: NodeId,
}

/// Single-process backend: a one-node arena
pub fn single_node() -> ClusterBackend {
    ClusterArena::new(1).backend(0)
}

impl Backend for ClusterBackend {
    fn node_id(&self) -> NodeId {
        self.node
    }

    fn number_of_nodes(&self) -> usize {
        self.arena.nodes
    }

    fn register_window(&self, kind: WindowKind, ptr: *mut u8, len: usize) -> DsmResult<()> {
        let mut windows = self.arena.windows.write().expect("window registry poisoned");
        windows.insert(
            (self.node, kind),
            WindowRegion {
                ptr: ptr as usize,
                len,
            },
        );
        Ok(())
    }

    fn deregister_windows(&self) {
        let mut windows = self.arena.windows.write().expect("window registry poisoned");
        windows.retain(|(node, _), _| *node != self.node);
    }

    fn lock_window(&self, node: NodeId, kind: WindowKind, mode: WindowLock) -> DsmResult<()> {
        self.arena.epoch_lock(node, kind)?.lock(mode);
        Ok(())
    }

    fn unlock_window(&self, node: NodeId, kind: WindowKind, mode: WindowLock) -> DsmResult<()> {
        self.arena.epoch_lock(node, kind)?.unlock(mode);
        Ok(())
    }

    fn get(&self, node: NodeId, kind: WindowKind, offset: usize, dst: &mut [u8]) -> DsmResult<()> {
        let region = self.arena.region(node, kind)?;
        let src = ClusterArena::checked_range(region, offset, dst.len())?;
        unsafe { std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    fn put(&self, node: NodeId, kind: WindowKind, offset: usize, src: &[u8]) -> DsmResult<()> {
        let region = self.arena.region(node, kind)?;
        let dst = ClusterArena::checked_range(region, offset, src.len())?;
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        Ok(())
    }

    fn read_word(&self, node: NodeId, kind: WindowKind, index: usize) -> DsmResult<u64> {
        Ok(self.arena.word(node, kind, index)?.load(Ordering::SeqCst))
    }

    fn write_word(&self, node: NodeId, kind: WindowKind, index: usize, value: u64) -> DsmResult<()> {
        self.arena.word(node, kind, index)?.store(value, Ordering::SeqCst);
        Ok(())
    }

    fn fetch_or_word(
        &self,
        node: NodeId,
        kind: WindowKind,
        index: usize,
        bits: u64,
    ) -> DsmResult<u64> {
        Ok(self.arena.word(node, kind, index)?.fetch_or(bits, Ordering::SeqCst))
    }

    fn compare_exchange_word(
        &self,
        node: NodeId,
        kind: WindowKind,
        index: usize,
        expected: u64,
        desired: u64,
    ) -> DsmResult<u64> {
        let word = self.arena.word(node, kind, index)?;
        Ok(match word.compare_exchange(expected, desired, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(prev) => prev,
            Err(prev) => prev,
        })
    }

    fn exchange_bytes(
        &self,
        node: NodeId,
        offset: usize,
        src: &[u8],
        dst: &mut [u8],
    ) -> DsmResult<()> {
        check_integer_width(src.len())?;
        if src.len() != dst.len() {
            return Err(DsmError::InvalidArgument(
                "exchange operand and result widths differ".to_string(),
            ));
        }
        let lock = self.arena.epoch_lock(node, WindowKind::Data)?;
        lock.lock(WindowLock::Exclusive);
        let result = (|| -> DsmResult<()> {
            let region = self.arena.region(node, WindowKind::Data)?;
            let target = ClusterArena::checked_range(region, offset, src.len())?;
            unsafe {
                std::ptr::copy_nonoverlapping(target, dst.as_mut_ptr(), dst.len());
                std::ptr::copy_nonoverlapping(src.as_ptr(), target, src.len());
            }
            Ok(())
        })();
        lock.unlock(WindowLock::Exclusive);
        result
    }

    fn compare_exchange_bytes(
        &self,
        node: NodeId,
        offset: usize,
        expected: &[u8],
        desired: &[u8],
        actual: &mut [u8],
    ) -> DsmResult<()> {
        check_integer_width(desired.len())?;
        if expected.len() != desired.len() || actual.len() != desired.len() {
            return Err(DsmError::InvalidArgument(
                "compare-exchange operand widths differ".to_string(),
            ));
        }
        let lock = self.arena.epoch_lock(node, WindowKind::Data)?;
        lock.lock(WindowLock::Exclusive);
        let result = (|| -> DsmResult<()> {
            let region = self.arena.region(node, WindowKind::Data)?;
            let target = ClusterArena::checked_range(region, offset, desired.len())?;
            unsafe {
                std::ptr::copy_nonoverlapping(target, actual.as_mut_ptr(), actual.len());
            }
            if actual == expected {
                unsafe {
                    std::ptr::copy_nonoverlapping(desired.as_ptr(), target, desired.len());
                }
            }
            Ok(())
        })();
        lock.unlock(WindowLock::Exclusive);
        result
    }

    fn fetch_add_bytes(
        &self,
        node: NodeId,
        offset: usize,
        kind: NumericKind,
        operand: &[u8],
        old: &mut [u8],
    ) -> DsmResult<()> {
        check_numeric_width(kind, operand.len())?;
        if old.len() != operand.len() {
            return Err(DsmError::InvalidArgument(
                "fetch-add operand and result widths differ".to_string(),
            ));
        }
        let lock = self.arena.epoch_lock(node, WindowKind::Data)?;
        lock.lock(WindowLock::Exclusive);
        let result = (|| -> DsmResult<()> {
            let region = self.arena.region(node, WindowKind::Data)?;
            let target = ClusterArena::checked_range(region, offset, operand.len())?;
            unsafe {
                std::ptr::copy_nonoverlapping(target, old.as_mut_ptr(), old.len());
            }
            let sum = numeric_add(kind, old, operand)?;
            unsafe {
                std::ptr::copy_nonoverlapping(sum.as_ptr(), target, sum.len());
            }
            Ok(())
        })();
        lock.unlock(WindowLock::Exclusive);
        result
    }

    fn barrier(&self) {
        self.arena.barrier.wait();
    }

    fn broadcast(&self, source: NodeId, buf: &mut [u8]) -> DsmResult<()> {
        if source >= self.arena.nodes {
            return Err(DsmError::Backend(format!("broadcast source {} out of range", source)));
        }
        self.arena.barrier.wait();
        if self.node == source {
            let mut scratch = self.arena.broadcast_buf.lock().expect("broadcast poisoned");
            scratch.clear();
            scratch.extend_from_slice(buf);
        }
        self.arena.barrier.wait();
        if self.node != source {
            let scratch = self.arena.broadcast_buf.lock().expect("broadcast poisoned");
            if scratch.len() != buf.len() {
                return Err(DsmError::Backend(
                    "broadcast buffer length mismatch".to_string(),
                ));
            }
            buf.copy_from_slice(&scratch);
        }
        self.arena.barrier.wait();
        Ok(())
    }

    fn abort(&self, msg: &str) -> ! {
        log::error!("node {}: fatal backend condition: {}", self.node, msg);
        std::process::abort();
    }
}

fn check_integer_width(width: usize) -> DsmResult<()> {
    match width {
        1 | 2 | 4 | 8 => Ok(()),
        other => Err(DsmError::InvalidArgument(format!(
            "atomic width {} is not one of 1/2/4/8",
            other
        ))),
    }
}

fn check_numeric_width(kind: NumericKind, width: usize) -> DsmResult<()> {
    match kind {
        NumericKind::Int | NumericKind::Uint => check_integer_width(width),
        NumericKind::Float => match width {
            4 | 8 => Ok(()),
            16 => Err(DsmError::InvalidArgument(
                "extended-precision floats are not supported by this backend".to_string(),
            )),
            other => Err(DsmError::InvalidArgument(format!(
                "float atomic width {} is not one of 4/8",
                other
            ))),
        },
    }
}

fn numeric_add(kind: NumericKind, old: &[u8], operand: &[u8]) -> DsmResult<Vec<u8>> {
    macro_rules! add_as {
        ($ty:ty) => {{
            let a = <$ty>::from_ne_bytes(old.try_into().expect("width checked"));
            let b = <$ty>::from_ne_bytes(operand.try_into().expect("width checked"));
            a.wrapping_add(b).to_ne_bytes().to_vec()
        }};
    }
    macro_rules! add_float_as {
        ($ty:ty) => {{
            let a = <$ty>::from_ne_bytes(old.try_into().expect("width checked"));
            let b = <$ty>::from_ne_bytes(operand.try_into().expect("width checked"));
            (a + b).to_ne_bytes().to_vec()
        }};
    }
    Ok(match (kind, operand.len()) {
        (NumericKind::Int, 1) => add_as!(i8),
        (NumericKind::Int, 2) => add_as!(i16),
        (NumericKind::Int, 4) => add_as!(i32),
        (NumericKind::Int, 8) => add_as!(i64),
        (NumericKind::Uint, 1) => add_as!(u8),
        (NumericKind::Uint, 2) => add_as!(u16),
        (NumericKind::Uint, 4) => add_as!(u32),
        (NumericKind::Uint, 8) => add_as!(u64),
        (NumericKind::Float, 4) => add_float_as!(f32),
        (NumericKind::Float, 8) => add_float_as!(f64),
        (kind, width) => {
            return Err(DsmError::InvalidArgument(format!(
                "unsupported numeric op {:?} at width {}",
                kind, width
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn two_node_arena_with_data(words: usize) -> (Arc<ClusterArena>, Vec<Box<[u64]>>) {
        let arena = ClusterArena::new(2);
        let mut bufs = Vec::new();
        for node in 0..2 {
            let buf = vec![0u64; words].into_boxed_slice();
            let backend = arena.backend(node);
            backend
                .register_window(WindowKind::Data, buf.as_ptr() as *mut u8, words * 8)
                .unwrap();
            backend
                .register_window(WindowKind::Sharers, buf.as_ptr() as *mut u8, words * 8)
                .unwrap();
            bufs.push(buf);
        }
        (arena, bufs)
    }

    #[test]
    fn get_put_round_trip() {
        let (arena, bufs) = two_node_arena_with_data(4);
        let backend = arena.backend(0);

        backend.lock_window(1, WindowKind::Data, WindowLock::Exclusive).unwrap();
        backend.put(1, WindowKind::Data, 8, &42u64.to_ne_bytes()).unwrap();
        backend.unlock_window(1, WindowKind::Data, WindowLock::Exclusive).unwrap();
        assert_eq!(bufs[1][1], 42);

        let mut out = [0u8; 8];
        backend.lock_window(1, WindowKind::Data, WindowLock::Shared).unwrap();
        backend.get(1, WindowKind::Data, 8, &mut out).unwrap();
        backend.unlock_window(1, WindowKind::Data, WindowLock::Shared).unwrap();
        assert_eq!(u64::from_ne_bytes(out), 42);

        // Out-of-bounds accesses are backend errors, not memory corruption
        assert!(backend.get(1, WindowKind::Data, 30, &mut [0u8; 8]).is_err());
    }

    #[test]
    fn fetch_or_accumulates_bits_concurrently() {
        let (arena, bufs) = two_node_arena_with_data(1);
        let handles: Vec<_> = (0..2)
            .map(|node| {
                let backend = arena.backend(node);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        backend
                            .fetch_or_word(0, WindowKind::Sharers, 0, 1 << node)
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(bufs[0][0], 0b11);
    }

    #[test]
    fn compare_exchange_has_one_winner() {
        let (arena, _bufs) = two_node_arena_with_data(1);
        let winners: Vec<_> = (0..2)
            .map(|node| {
                let backend = arena.backend(node);
                thread::spawn(move || {
                    backend
                        .compare_exchange_word(0, WindowKind::Sharers, 0, 0, node as u64 + 1)
                        .unwrap()
                        == 0
                })
            })
            .map(|h| h.join().unwrap())
            .collect();
        assert_eq!(winners.iter().filter(|&&w| w).count(), 1);
    }

    #[test]
    fn numeric_fetch_add_families() {
        let (arena, bufs) = two_node_arena_with_data(2);
        let backend = arena.backend(0);

        let mut old = [0u8; 4];
        backend
            .fetch_add_bytes(0, 0, NumericKind::Int, &5i32.to_ne_bytes(), &mut old)
            .unwrap();
        backend
            .fetch_add_bytes(0, 0, NumericKind::Int, &(-2i32).to_ne_bytes(), &mut old)
            .unwrap();
        assert_eq!(i32::from_ne_bytes(old), 5);
        assert_eq!(bufs[0][0] as u32 as i32, 3);

        let mut fold = [0u8; 8];
        backend
            .fetch_add_bytes(0, 8, NumericKind::Float, &1.5f64.to_ne_bytes(), &mut fold)
            .unwrap();
        backend
            .fetch_add_bytes(0, 8, NumericKind::Float, &2.25f64.to_ne_bytes(), &mut fold)
            .unwrap();
        assert_eq!(f64::from_ne_bytes(fold), 1.5);

        // Wrong widths are rejected up front
        assert!(backend
            .fetch_add_bytes(0, 0, NumericKind::Int, &[0u8; 3], &mut [0u8; 3])
            .is_err());
        assert!(backend
            .fetch_add_bytes(0, 0, NumericKind::Float, &[0u8; 2], &mut [0u8; 2])
            .is_err());
        assert!(backend
            .fetch_add_bytes(0, 0, NumericKind::Float, &[0u8; 16], &mut [0u8; 16])
            .is_err());
    }

    #[test]
    fn exchange_deposits_previous_value() {
        let (arena, bufs) = two_node_arena_with_data(1);
        let backend = arena.backend(1);
        let mut prev = [0u8; 8];
        backend.exchange_bytes(0, 0, &7u64.to_ne_bytes(), &mut prev).unwrap();
        assert_eq!(u64::from_ne_bytes(prev), 0);
        backend.exchange_bytes(0, 0, &9u64.to_ne_bytes(), &mut prev).unwrap();
        assert_eq!(u64::from_ne_bytes(prev), 7);
        assert_eq!(bufs[0][0], 9);
    }

    #[test]
    fn broadcast_reaches_every_node() {
        let arena = ClusterArena::new(2);
        let handles: Vec<_> = (0..2)
            .map(|node| {
                let backend = arena.backend(node);
                thread::spawn(move || {
                    let mut buf = if node == 0 {
                        0xfeedu64.to_ne_bytes()
                    } else {
                        [0u8; 8]
                    };
                    backend.broadcast(0, &mut buf).unwrap();
                    u64::from_ne_bytes(buf)
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 0xfeed);
        }
    }
}
