//! Shardmem prelude - convenient imports for users
//!
//! Everything an application needs to work with shardmem's global memory.

// The process-level API
pub use crate::shardmem::{
    acquire, atomic, barrier, broadcast, codelete, codelete_with, collective_alloc,
    collective_free, conew, conew_array, conew_array_with, conew_with, delete_dynamic,
    dynamic_alloc, dynamic_free, finalize, global_base, global_ptr, global_size, init,
    new_cohort_lock, new_dynamic, new_global_lock, node_id, number_of_nodes, release, reset,
    selective_acquire, selective_release, MemoryOrder,
};

// Core value types
pub use crate::alloc::AllocParams;
pub use crate::distribution::GlobalPtr;
pub use crate::types::{DsmError, DsmResult, NodeId};

// Locks
pub use crate::sync::cohort_lock::{CohortGuard, CohortLock};
pub use crate::sync::global_tas_lock::GlobalTasLock;
