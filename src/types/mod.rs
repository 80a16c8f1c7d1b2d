//! Common types and error handling for the shardmem engine
//!
//! This module defines the node identifier, the page/line geometry constants,
//! and the single crate-wide error enum every fallible operation reports
//! through.

use std::fmt;

/// Identifier of a shardmem node (one cooperating process)
pub type NodeId = usize;

/// Size of a hardware page in bytes
pub const PAGE_SIZE: usize = 4096;

/// Number of consecutive pages forming one coherence line
///
/// Kept as an explicit constant so the line geometry stays visible in the
/// arithmetic even though the current build uses single-page lines.
pub const CACHELINE: usize = 1;

/// Size of one coherence line in bytes
pub const BLOCK_SIZE: usize = PAGE_SIZE * CACHELINE;

/// Operation result with the crate error type
pub type DsmResult<T> = std::result::Result<T, DsmError>;

/// Errors surfaced by the shardmem engine
///
/// Allocator failures and `InvalidArgument` propagate to the calling API;
/// every other variant means the distributed state cannot be safely resumed
/// and the caller is expected to abort the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DsmError {
    /// Illegal environment value or inconsistent size parameters
    Config(String),
    /// The reserved virtual range cannot accommodate the request
    OutOfAddressSpace,
    /// Installing or changing a memory mapping failed
    MapFailed(String),
    /// A memory pool cannot satisfy the allocation
    PoolExhausted,
    /// A distribution policy computed an out-of-range home or offset
    Distribution(String),
    /// No node has free backing store for a first-touch claim
    FirstTouchExhausted,
    /// A one-sided backend primitive failed
    Backend(String),
    /// Wrong atomic width or type family for the requested operation
    InvalidArgument(String),
}

impl fmt::Display for DsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DsmError::Config(msg) => write!(f, "configuration error: {}", msg),
            DsmError::OutOfAddressSpace => write!(f, "reserved virtual address space exhausted"),
            DsmError::MapFailed(msg) => write!(f, "memory mapping failed: {}", msg),
            DsmError::PoolExhausted => write!(f, "memory pool exhausted"),
            DsmError::Distribution(msg) => write!(f, "distribution policy error: {}", msg),
            DsmError::FirstTouchExhausted => {
                write!(f, "no node has free backing store for first-touch placement")
            }
            DsmError::Backend(msg) => write!(f, "backend error: {}", msg),
            DsmError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for DsmError {}

impl DsmError {
    /// Whether the error may be returned to the caller instead of aborting
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DsmError::PoolExhausted | DsmError::InvalidArgument(_) | DsmError::Config(_)
        )
    }
}

/// Align `offset` downwards to the beginning of its `size` block
#[inline]
pub fn align_backwards(offset: usize, size: usize) -> usize {
    (offset / size) * size
}

/// Align `offset` upwards to the next `size` block unless already aligned
#[inline]
pub fn align_forwards(offset: usize, size: usize) -> usize {
    if offset == 0 {
        0
    } else {
        (1 + (offset - 1) / size) * size
    }
}

/// Check whether `x` has at most one bit set
///
/// Zero counts as a power of two here; the directory logic relies on that to
/// treat "no sharer" and "exactly one sharer" uniformly.
#[inline]
pub fn is_zero_or_pow2(x: u64) -> bool {
    x & x.wrapping_sub(1) == 0
}
