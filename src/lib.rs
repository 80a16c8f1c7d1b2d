//! Shardmem - page-based software distributed shared memory
//!
//! A cluster of cooperating processes presents one virtual address range;
//! any load or store on any node observes a coherent view of the same
//! logical memory under release consistency for data-race-free programs.
//!
//! # Architecture
//!
//! - **Fault-driven coherence**: an access to an unmapped page raises a
//!   fault; the handler fetches the line, maintains the distributed
//!   sharer/writer directory through one-sided remote atomics, and installs
//!   a read or read/write mapping.
//! - **Write-back cache with twins**: the first write in an epoch snapshots
//!   the page; release sends only the bytes that differ.
//! - **Pluggable placement**: naive, cyclic, skew-mapp, prime-mapp and
//!   first-touch distributions decide which node backs which page.
//! - **Release consistency**: `release`/`acquire`, their range-restricted
//!   selective variants, collective barriers, and remote atomics with
//!   explicit memory orders.
//! - **Global allocation**: collective and per-node dynamic allocators over
//!   pools carved out of the global range, plus cluster-wide locks.

// Public API modules
pub mod prelude;
pub mod shardmem;

// Engine implementation modules
pub mod alloc;
pub mod backend;
pub mod cache;
pub mod coherence;
pub mod distribution;
pub mod runtime;
pub mod sync;
pub mod types;
pub mod vm;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export the process-level API at the crate root
pub use shardmem::*;
pub use types::{DsmError, DsmResult};
