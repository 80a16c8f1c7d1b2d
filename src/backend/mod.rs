//! One-sided communication port
//!
//! Everything the coherence engine needs from an interconnect: one-sided
//! `get`/`put` against per-node windows with shared/exclusive window locking,
//! type-erased remote atomics, and the collective barrier/broadcast pair.
//! The engine never sends messages; every remote effect is a one-sided
//! operation against a window some node registered.
//!
//! The in-process implementation lives in [`cluster`]: an arena of registered
//! windows shared by every node handle. With a single node it is the
//! single-process backend (local memory and a mutex); with several it
//! emulates a cluster inside one process, which is how the directory and
//! first-touch machinery are exercised in tests.

pub mod cluster;

use crate::types::{DsmResult, NodeId};

/// Logical windows every node exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowKind {
    /// The node's share of global memory
    Data,
    /// Sharer/writer directory words
    Sharers,
    /// First-touch page ownership directory
    OwnersDir,
    /// First-touch backing offset table
    OffsetsTbl,
}

/// Locking mode for an explicit window epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowLock {
    /// Concurrent readers allowed
    Shared,
    /// Single writer
    Exclusive,
}

/// Numeric family for type-erased fetch-and-add
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericKind {
    Int,
    Uint,
    Float,
}

/// Port between the coherence engine and the interconnect
///
/// `get`/`put` require the caller to hold the targeted window via
/// `lock_window`; a single exclusive epoch may span many puts, which is how
/// diff write-back batches its runs. The word and byte atomics lock
/// internally and are totally ordered per target node.
pub trait Backend: Send + Sync {
    /// This node's id
    fn node_id(&self) -> NodeId;

    /// Number of nodes in the cluster, fixed at init
    fn number_of_nodes(&self) -> usize;

    /// Expose caller-owned memory as this node's window `kind`
    ///
    /// The memory must stay valid until the window is deregistered; the
    /// engine guarantees this by deregistering at finalize, behind a barrier.
    fn register_window(&self, kind: WindowKind, ptr: *mut u8, len: usize) -> DsmResult<()>;

    /// Drop this node's window registrations
    fn deregister_windows(&self);

    /// Open a window epoch on `node`
    fn lock_window(&self, node: NodeId, kind: WindowKind, mode: WindowLock) -> DsmResult<()>;

    /// Close a window epoch opened with the same mode
    fn unlock_window(&self, node: NodeId, kind: WindowKind, mode: WindowLock) -> DsmResult<()>;

    /// One-sided read from `node`'s window; the caller holds the window
    fn get(&self, node: NodeId, kind: WindowKind, offset: usize, dst: &mut [u8]) -> DsmResult<()>;

    /// One-sided write to `node`'s window; the caller holds the window
    fn put(&self, node: NodeId, kind: WindowKind, offset: usize, src: &[u8]) -> DsmResult<()>;

    /// Read word `index` of a word-granular window
    fn read_word(&self, node: NodeId, kind: WindowKind, index: usize) -> DsmResult<u64>;

    /// Write word `index` of a word-granular window
    fn write_word(&self, node: NodeId, kind: WindowKind, index: usize, value: u64) -> DsmResult<()>;

    /// Atomic bitwise OR returning the previous value
    fn fetch_or_word(&self, node: NodeId, kind: WindowKind, index: usize, bits: u64)
        -> DsmResult<u64>;

    /// Atomic bitwise OR without fetching
    fn or_word(&self, node: NodeId, kind: WindowKind, index: usize, bits: u64) -> DsmResult<()> {
        self.fetch_or_word(node, kind, index, bits).map(|_| ())
    }

    /// Atomic compare-and-swap returning the observed value
    fn compare_exchange_word(
        &self,
        node: NodeId,
        kind: WindowKind,
        index: usize,
        expected: u64,
        desired: u64,
    ) -> DsmResult<u64>;

    /// Atomically replace `src.len()` bytes in `node`'s data window,
    /// depositing the previous contents into `dst`
    ///
    /// Widths of 1, 2, 4 and 8 bytes are supported.
    fn exchange_bytes(
        &self,
        node: NodeId,
        offset: usize,
        src: &[u8],
        dst: &mut [u8],
    ) -> DsmResult<()>;

    /// Atomic compare-and-swap on raw bytes in `node`'s data window
    ///
    /// The observed value is deposited into `actual` regardless of success.
    fn compare_exchange_bytes(
        &self,
        node: NodeId,
        offset: usize,
        expected: &[u8],
        desired: &[u8],
        actual: &mut [u8],
    ) -> DsmResult<()>;

    /// Atomic fetch-and-add on a numeric value in `node`'s data window
    ///
    /// The width is taken from `operand.len()`: 1/2/4/8 bytes for the integer
    /// families, 4/8 bytes for floats. The previous value lands in `old`.
    fn fetch_add_bytes(
        &self,
        node: NodeId,
        offset: usize,
        kind: NumericKind,
        operand: &[u8],
        old: &mut [u8],
    ) -> DsmResult<()>;

    /// Collective barrier over all nodes
    fn barrier(&self);

    /// Collective broadcast: `buf` on `source` overwrites `buf` everywhere
    fn broadcast(&self, source: NodeId, buf: &mut [u8]) -> DsmResult<()>;

    /// Best-effort cluster abort for fatal errors
    fn abort(&self, msg: &str) -> !;
}

/// Map a one-bit mask to the node holding that bit
///
/// Returns `None` when the mask is zero or has more than one bit set, which
/// callers treat as "no single remote holder".
pub fn single_bit_node(mask: u64, nodes: usize) -> Option<NodeId> {
    if mask == 0 || !crate::types::is_zero_or_pow2(mask) {
        return None;
    }
    let node = mask.trailing_zeros() as usize;
    (node < nodes).then_some(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_bit_node_decoding() {
        assert_eq!(single_bit_node(0, 4), None);
        assert_eq!(single_bit_node(0b0001, 4), Some(0));
        assert_eq!(single_bit_node(0b1000, 4), Some(3));
        assert_eq!(single_bit_node(0b1010, 4), None);
        // A bit beyond the cluster size is not a node
        assert_eq!(single_bit_node(1 << 5, 4), None);
    }
}
