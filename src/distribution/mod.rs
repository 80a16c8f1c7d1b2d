//! Address distribution policies
//!
//! A distribution policy is a pure function from a byte address (relative to
//! the global base) to the pair `(home node, offset into that node's backing
//! store)`. The five variants share one tagged enum; only first-touch owns
//! mutable state, and that state lives inside its variant.
//!
//! Every path validates the computed home and offset: an out-of-range value
//! is a bug in the policy arithmetic, reported as a fatal
//! [`DsmError::Distribution`].

pub mod first_touch;
pub mod global_ptr;

use std::sync::Arc;

use crate::backend::Backend;
use crate::runtime::config::PolicyKind;
use crate::types::{DsmError, DsmResult, NodeId, PAGE_SIZE};

pub use first_touch::FirstTouch;
pub use global_ptr::GlobalPtr;

/// Parameters shared by the stateless policies
#[derive(Debug, Clone, Copy)]
pub struct PolicyParams {
    /// Number of nodes in the cluster
    pub nodes: usize,
    /// One node's share of the global space in bytes
    pub size_per_node: usize,
    /// Distribution block in bytes (cyclic family only)
    pub pageblock: usize,
}

/// The configured distribution policy
#[derive(Debug)]
pub enum Distribution {
    Naive(PolicyParams),
    Cyclic(PolicyParams),
    SkewMapp(PolicyParams),
    PrimeMapp(PolicyParams),
    FirstTouch(FirstTouch),
}

impl Distribution {
    /// Build the policy selected by the configuration
    pub fn new(
        kind: PolicyKind,
        nodes: usize,
        total_size: usize,
        block_pages: usize,
        backend: Arc<dyn Backend>,
    ) -> Self {
        let params = PolicyParams {
            nodes,
            size_per_node: total_size / nodes,
            pageblock: block_pages * PAGE_SIZE,
        };
        match kind {
            PolicyKind::Naive => Distribution::Naive(params),
            PolicyKind::Cyclic => Distribution::Cyclic(params),
            PolicyKind::SkewMapp => Distribution::SkewMapp(params),
            PolicyKind::PrimeMapp => Distribution::PrimeMapp(params),
            PolicyKind::FirstTouch => {
                Distribution::FirstTouch(FirstTouch::new(nodes, params.size_per_node, backend))
            }
        }
    }

    /// Home node of `addr`
    pub fn home(&self, addr: usize) -> DsmResult<NodeId> {
        Ok(self.locate(addr)?.0)
    }

    /// Offset of `addr` in its home node's backing store
    pub fn local_offset(&self, addr: usize) -> DsmResult<usize> {
        Ok(self.locate(addr)?.1)
    }

    /// Home node and backing offset of `addr` in one lookup
    pub fn locate(&self, addr: usize) -> DsmResult<(NodeId, usize)> {
        let (home, offset, params) = match self {
            Distribution::Naive(p) => {
                let home = addr / p.size_per_node;
                (home, addr - home * p.size_per_node, p)
            }
            Distribution::Cyclic(p) => {
                let (aligned, drift) = page_split(addr);
                let pagenum = aligned / p.pageblock;
                let home = pagenum % p.nodes;
                (home, cyclic_offset(p, aligned) + drift, p)
            }
            Distribution::SkewMapp(p) => {
                let (aligned, drift) = page_split(addr);
                let pagenum = aligned / p.pageblock;
                let home = (pagenum + pagenum / p.nodes + 1) % p.nodes;
                (home, cyclic_offset(p, aligned) + drift, p)
            }
            Distribution::PrimeMapp(p) => {
                let (aligned, drift) = page_split(addr);
                let home = prime_home(p, aligned);
                (home, prime_offset(p, aligned)? + drift, p)
            }
            Distribution::FirstTouch(ft) => return ft.locate(addr),
        };
        if home >= params.nodes {
            return Err(DsmError::Distribution(format!(
                "home {} for address {:#x} is out of range",
                home, addr
            )));
        }
        if offset >= params.size_per_node {
            return Err(DsmError::Distribution(format!(
                "offset {:#x} for address {:#x} exceeds the node share",
                offset, addr
            )));
        }
        Ok((home, offset))
    }

    /// Extra alignment the global space needs so every offset stays inside
    /// one node's share
    pub fn padding_pages(kind: PolicyKind, nodes: usize, block_pages: usize) -> usize {
        let mut padding = if kind.is_cyclic_family() { block_pages } else { 1 };
        if kind == PolicyKind::PrimeMapp {
            padding *= (3 * nodes) / 2;
        }
        padding
    }
}

fn page_split(addr: usize) -> (usize, usize) {
    let aligned = addr / PAGE_SIZE * PAGE_SIZE;
    (aligned, addr - aligned)
}

fn cyclic_offset(p: &PolicyParams, aligned: usize) -> usize {
    let pagenum = aligned / p.pageblock;
    pagenum / p.nodes * p.pageblock + aligned % p.pageblock
}

fn prime_home(p: &PolicyParams, aligned: usize) -> NodeId {
    let prime = 3 * p.nodes / 2;
    let pagenum = aligned / p.pageblock;
    if pagenum % prime >= p.nodes {
        (pagenum / prime * (prime - p.nodes) + (pagenum % prime - p.nodes)) % p.nodes
    } else {
        pagenum % prime
    }
}

/// Dense offset for the prime-mapp policy
///
/// Blocks redistributed from the overflow residues are packed after the
/// directly mapped blocks of the same home; a backwards scan finds the
/// nearest directly mapped block with the same home and counts the
/// redistributed blocks in between.
fn prime_offset(p: &PolicyParams, aligned: usize) -> DsmResult<usize> {
    let prime = 3 * p.nodes / 2;
    let pagenum = aligned / p.pageblock;
    if aligned <= p.nodes * p.pageblock || pagenum % prime >= p.nodes {
        return Ok(cyclic_offset(p, aligned));
    }

    let realhome = prime_home(p, aligned);
    let mut homecounter = 0usize;
    let mut addr = aligned - p.pageblock;
    loop {
        let pagenum = addr / p.pageblock;
        let currhome = prime_home(p, addr);
        if currhome == realhome {
            homecounter += 1;
        }
        let anchored = currhome == realhome
            && (addr <= p.nodes * p.pageblock || pagenum % prime >= p.nodes);
        if anchored {
            return Ok(cyclic_offset(p, addr) + homecounter * p.pageblock);
        }
        addr = addr.checked_sub(p.pageblock).ok_or_else(|| {
            DsmError::Distribution(format!(
                "no anchor block found below address {:#x}",
                aligned
            ))
        })?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn params(nodes: usize, total_pages: usize, block_pages: usize) -> PolicyParams {
        PolicyParams {
            nodes,
            size_per_node: total_pages * PAGE_SIZE / nodes,
            pageblock: block_pages * PAGE_SIZE,
        }
    }

    fn static_policy(kind: PolicyKind, p: PolicyParams) -> Distribution {
        match kind {
            PolicyKind::Naive => Distribution::Naive(p),
            PolicyKind::Cyclic => Distribution::Cyclic(p),
            PolicyKind::SkewMapp => Distribution::SkewMapp(p),
            PolicyKind::PrimeMapp => Distribution::PrimeMapp(p),
            PolicyKind::FirstTouch => unreachable!("first touch needs a backend"),
        }
    }

    #[test]
    fn all_static_policies_stay_in_range() {
        let total_pages = 48;
        for kind in [
            PolicyKind::Naive,
            PolicyKind::Cyclic,
            PolicyKind::SkewMapp,
            PolicyKind::PrimeMapp,
        ] {
            let dist = static_policy(kind, params(4, total_pages, 1));
            for page in 0..total_pages {
                let (home, offset) = dist.locate(page * PAGE_SIZE + 17).unwrap();
                assert!(home < 4, "{:?} home out of range for page {}", kind, page);
                assert!(
                    offset < total_pages * PAGE_SIZE / 4,
                    "{:?} offset out of range for page {}",
                    kind,
                    page
                );
                assert_eq!(offset % PAGE_SIZE, 17);
            }
        }
    }

    #[test]
    fn naive_is_a_bijection_per_slab() {
        let total_pages = 32;
        let dist = static_policy(PolicyKind::Naive, params(4, total_pages, 1));
        let mut seen = HashSet::new();
        for page in 0..total_pages {
            let addr = page * PAGE_SIZE;
            let (home, offset) = dist.locate(addr).unwrap();
            assert!(seen.insert((home, offset)));
            // Naive concatenates the per-node slabs in node order
            assert_eq!(home * (total_pages / 4 * PAGE_SIZE) + offset, addr);
        }
    }

    #[test]
    fn cyclic_is_a_bijection_per_band() {
        let nodes = 4;
        let block_pages = 2;
        let band_pages = nodes * block_pages;
        let dist = static_policy(PolicyKind::Cyclic, params(nodes, 8 * band_pages, block_pages));
        let mut seen = HashSet::new();
        for page in 0..8 * band_pages {
            let (home, offset) = dist.locate(page * PAGE_SIZE).unwrap();
            assert!(seen.insert((home, offset)), "collision at page {}", page);
        }
        // Within one band every node appears exactly block_pages times
        let mut homes = vec![0usize; nodes];
        for page in 0..band_pages {
            let (home, _) = dist.locate(page * PAGE_SIZE).unwrap();
            homes[home] += 1;
        }
        assert!(homes.iter().all(|&count| count == block_pages));
    }

    #[test]
    fn skew_mapp_skips_a_node_per_round() {
        let dist = static_policy(PolicyKind::SkewMapp, params(4, 32, 1));
        let homes: Vec<_> = (0..8)
            .map(|page| dist.locate(page * PAGE_SIZE).unwrap().0)
            .collect();
        assert_eq!(homes, vec![1, 2, 3, 0, 2, 3, 0, 1]);
    }

    #[test]
    fn prime_mapp_offsets_are_dense_per_home() {
        let nodes = 4;
        // 48 blocks balance exactly over prime = 6 residues
        let dist = static_policy(PolicyKind::PrimeMapp, params(nodes, 48, 1));
        let mut per_home: Vec<HashSet<usize>> = vec![HashSet::new(); nodes];
        for page in 0..48 {
            let (home, offset) = dist.locate(page * PAGE_SIZE).unwrap();
            assert_eq!(offset % PAGE_SIZE, 0);
            assert!(per_home[home].insert(offset), "duplicate offset on node {}", home);
        }
        for (home, offsets) in per_home.iter().enumerate() {
            assert_eq!(offsets.len(), 12, "node {} block count", home);
            // Dense: offsets fill the low end of the node share
            let max = offsets.iter().max().unwrap();
            assert!(*max < 12 * PAGE_SIZE, "node {} offsets not dense", home);
        }
    }

    #[test]
    fn padding_reflects_the_policy_family() {
        assert_eq!(Distribution::padding_pages(PolicyKind::Naive, 4, 16), 1);
        assert_eq!(Distribution::padding_pages(PolicyKind::Cyclic, 4, 16), 16);
        assert_eq!(Distribution::padding_pages(PolicyKind::PrimeMapp, 4, 16), 96);
        assert_eq!(Distribution::padding_pages(PolicyKind::FirstTouch, 4, 16), 1);
    }
}
