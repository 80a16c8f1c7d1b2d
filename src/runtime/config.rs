//! Engine configuration from environment variables
//!
//! All knobs are optional; the defaults match a typical HPC deployment. The
//! environment is read exactly once at `init` and materialized into an
//! [`EngineConfig`] value that the rest of the engine treats as immutable.

use std::env;

use serde::{Deserialize, Serialize};

use crate::types::{DsmError, DsmResult};

/// Total global memory in bytes (default 8 GiB)
pub const ENV_MEMORY_SIZE: &str = "ARGO_MEMORY_SIZE";
/// Per-node page cache in bytes (default 1 GiB)
pub const ENV_CACHE_SIZE: &str = "ARGO_CACHE_SIZE";
/// Write buffer capacity in cache lines (default 512)
pub const ENV_WRITE_BUFFER_SIZE: &str = "ARGO_WRITE_BUFFER_SIZE";
/// Lines written back per partial flush (default 32, clamped to the capacity)
pub const ENV_WRITE_BUFFER_WRITE_BACK_SIZE: &str = "ARGO_WRITE_BUFFER_WRITE_BACK_SIZE";
/// Distribution policy selector, 0..=4 (default 0 = naive)
pub const ENV_ALLOCATION_POLICY: &str = "ARGO_ALLOCATION_POLICY";
/// Block size in pages for the cyclic policy family (default 16)
pub const ENV_ALLOCATION_BLOCK_SIZE: &str = "ARGO_ALLOCATION_BLOCK_SIZE";
/// Emit engine statistics at finalize when nonzero (default 0)
pub const ENV_PRINT_STATISTICS: &str = "ARGO_PRINT_STATISTICS";
/// Consecutive cohort-lock handovers inside one NUMA node (default 8192)
pub const ENV_LOCK_HANDOVER_LOCAL: &str = "ARGO_LOCK_HANDOVER_LOCAL";
/// Consecutive cohort-lock handovers between NUMA nodes (default 128)
pub const ENV_LOCK_HANDOVER_REMOTE: &str = "ARGO_LOCK_HANDOVER_REMOTE";

const DEFAULT_MEMORY_SIZE: usize = 8 << 30;
const DEFAULT_CACHE_SIZE: usize = 1 << 30;
const DEFAULT_WRITE_BUFFER_SIZE: usize = 512;
const DEFAULT_WRITE_BUFFER_WRITE_BACK_SIZE: usize = 32;
const DEFAULT_ALLOCATION_BLOCK_SIZE: usize = 16;
const DEFAULT_LOCK_HANDOVER_LOCAL: usize = 8192;
const DEFAULT_LOCK_HANDOVER_REMOTE: usize = 128;

/// Selector for the address distribution policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyKind {
    #[serde(rename = "naive")]
    Naive,
    #[serde(rename = "cyclic")]
    Cyclic,
    #[serde(rename = "skew-mapp")]
    SkewMapp,
    #[serde(rename = "prime-mapp")]
    PrimeMapp,
    #[serde(rename = "first-touch")]
    FirstTouch,
}

impl PolicyKind {
    /// Decode the numeric environment selector
    pub fn from_selector(value: usize) -> DsmResult<Self> {
        match value {
            0 => Ok(PolicyKind::Naive),
            1 => Ok(PolicyKind::Cyclic),
            2 => Ok(PolicyKind::SkewMapp),
            3 => Ok(PolicyKind::PrimeMapp),
            4 => Ok(PolicyKind::FirstTouch),
            other => Err(DsmError::Config(format!(
                "{} must be in 0..=4, got {}",
                ENV_ALLOCATION_POLICY, other
            ))),
        }
    }

    /// Whether the policy distributes blocks of pages round-robin
    pub fn is_cyclic_family(self) -> bool {
        matches!(
            self,
            PolicyKind::Cyclic | PolicyKind::SkewMapp | PolicyKind::PrimeMapp
        )
    }
}

/// Immutable engine configuration materialized at init
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Total global memory in bytes
    pub memory_size: usize,
    /// Per-node page cache in bytes
    pub cache_size: usize,
    /// Write buffer capacity in cache lines
    pub write_buffer_size: usize,
    /// Lines drained per partial write-back
    pub write_buffer_write_back_size: usize,
    /// Distribution policy
    pub allocation_policy: PolicyKind,
    /// Block size in pages for the cyclic policy family
    pub allocation_block_size: usize,
    /// Report statistics at finalize
    pub print_statistics: bool,
    /// Cohort lock: consecutive handovers within a NUMA node
    pub lock_handover_local: usize,
    /// Cohort lock: consecutive handovers between NUMA nodes
    pub lock_handover_remote: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_MEMORY_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            write_buffer_write_back_size: DEFAULT_WRITE_BUFFER_WRITE_BACK_SIZE,
            allocation_policy: PolicyKind::Naive,
            allocation_block_size: DEFAULT_ALLOCATION_BLOCK_SIZE,
            print_statistics: false,
            lock_handover_local: DEFAULT_LOCK_HANDOVER_LOCAL,
            lock_handover_remote: DEFAULT_LOCK_HANDOVER_REMOTE,
        }
    }
}

impl EngineConfig {
    /// Read the configuration from the process environment
    pub fn from_env() -> DsmResult<Self> {
        let mut cfg = EngineConfig {
            memory_size: read_env(ENV_MEMORY_SIZE, DEFAULT_MEMORY_SIZE)?,
            cache_size: read_env(ENV_CACHE_SIZE, DEFAULT_CACHE_SIZE)?,
            write_buffer_size: read_env(ENV_WRITE_BUFFER_SIZE, DEFAULT_WRITE_BUFFER_SIZE)?,
            write_buffer_write_back_size: read_env(
                ENV_WRITE_BUFFER_WRITE_BACK_SIZE,
                DEFAULT_WRITE_BUFFER_WRITE_BACK_SIZE,
            )?,
            allocation_policy: PolicyKind::from_selector(read_env(ENV_ALLOCATION_POLICY, 0)?)?,
            allocation_block_size: read_env(
                ENV_ALLOCATION_BLOCK_SIZE,
                DEFAULT_ALLOCATION_BLOCK_SIZE,
            )?,
            print_statistics: read_env(ENV_PRINT_STATISTICS, 0usize)? != 0,
            lock_handover_local: read_env(ENV_LOCK_HANDOVER_LOCAL, DEFAULT_LOCK_HANDOVER_LOCAL)?,
            lock_handover_remote: read_env(
                ENV_LOCK_HANDOVER_REMOTE,
                DEFAULT_LOCK_HANDOVER_REMOTE,
            )?,
        };
        cfg.validate()?;
        // The partial flush can never exceed the buffer capacity
        cfg.write_buffer_write_back_size = cfg
            .write_buffer_write_back_size
            .min(cfg.write_buffer_size);
        Ok(cfg)
    }

    /// Check parameter consistency
    pub fn validate(&self) -> DsmResult<()> {
        if self.memory_size == 0 {
            return Err(DsmError::Config(format!("{} must be nonzero", ENV_MEMORY_SIZE)));
        }
        if self.cache_size == 0 {
            return Err(DsmError::Config(format!("{} must be nonzero", ENV_CACHE_SIZE)));
        }
        if self.write_buffer_size == 0 || self.write_buffer_write_back_size == 0 {
            return Err(DsmError::Config(
                "write buffer sizes must be nonzero".to_string(),
            ));
        }
        if self.allocation_block_size == 0 {
            return Err(DsmError::Config(format!(
                "{} must be nonzero",
                ENV_ALLOCATION_BLOCK_SIZE
            )));
        }
        Ok(())
    }
}

fn read_env(name: &str, default: usize) -> DsmResult<usize> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<usize>().map_err(|_| {
            DsmError::Config(format!("{} could not be parsed as a number: {:?}", name, raw))
        }),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => {
            Err(DsmError::Config(format!("{} is not valid unicode", name)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.memory_size, 8 << 30);
        assert_eq!(cfg.cache_size, 1 << 30);
        assert_eq!(cfg.write_buffer_size, 512);
        assert_eq!(cfg.write_buffer_write_back_size, 32);
        assert_eq!(cfg.allocation_policy, PolicyKind::Naive);
        assert_eq!(cfg.allocation_block_size, 16);
    }

    #[test]
    fn policy_selector_decoding() {
        assert_eq!(PolicyKind::from_selector(0).unwrap(), PolicyKind::Naive);
        assert_eq!(PolicyKind::from_selector(4).unwrap(), PolicyKind::FirstTouch);
        assert!(PolicyKind::from_selector(5).is_err());
        assert!(PolicyKind::Cyclic.is_cyclic_family());
        assert!(PolicyKind::PrimeMapp.is_cyclic_family());
        assert!(!PolicyKind::FirstTouch.is_cyclic_family());
    }

    #[test]
    fn zero_sizes_rejected() {
        let cfg = EngineConfig {
            memory_size: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(DsmError::Config(_))));
    }
}
