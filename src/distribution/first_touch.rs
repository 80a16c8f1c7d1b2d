//! First-touch distribution
//!
//! Ownership of a page goes to the node that first touches it, subject to
//! backing-store availability. Claim metadata for a page lives on a
//! deterministic "claim node" (`page mod N`) so the race between concurrent
//! first touchers is decided by a single compare-and-swap, and the winning
//! node publishes the resulting `(home, offset)` there for everyone else.
//!
//! Each node keeps a local cache of resolved pages so the common case is one
//! concurrent-map lookup with no remote traffic.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::backend::{Backend, WindowKind};
use crate::types::{DsmError, DsmResult, NodeId, PAGE_SIZE};

/// Sentinel for an unclaimed owners-directory word
pub const OWNER_NULL: u64 = u64::MAX;

/// Number of directory words per page: home, offset, claimant
pub const OWNER_WORDS: usize = 3;

/// Mutable state of the first-touch policy
pub struct FirstTouch {
    backend: Arc<dyn Backend>,
    nodes: usize,
    size_per_node: usize,
    /// Resolved pages: page number to `(home, backing offset)`
    resolved: DashMap<usize, (NodeId, usize)>,
    /// Serializes the claim protocol; the backend sequences must not
    /// interleave between threads of one node
    claim_lock: Mutex<()>,
}

impl std::fmt::Debug for FirstTouch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirstTouch")
            .field("nodes", &self.nodes)
            .field("size_per_node", &self.size_per_node)
            .field("resolved", &self.resolved.len())
            .finish()
    }
}

impl FirstTouch {
    pub fn new(nodes: usize, size_per_node: usize, backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            nodes,
            size_per_node,
            resolved: DashMap::new(),
            claim_lock: Mutex::new(()),
        }
    }

    /// Home node and backing offset of `addr`, claiming the page if it has
    /// no owner yet
    pub fn locate(&self, addr: usize) -> DsmResult<(NodeId, usize)> {
        let page = addr / PAGE_SIZE;
        let drift = addr - page * PAGE_SIZE;

        if let Some(entry) = self.resolved.get(&page) {
            let (home, offset) = *entry;
            return Ok((home, offset + drift));
        }

        let _guard = self.claim_lock.lock().expect("first-touch lock poisoned");
        if let Some(entry) = self.resolved.get(&page) {
            let (home, offset) = *entry;
            return Ok((home, offset + drift));
        }

        let (home, offset) = self.resolve(page)?;
        if home >= self.nodes {
            return Err(DsmError::Distribution(format!(
                "first-touch home {} for page {} is out of range",
                home, page
            )));
        }
        if offset >= self.size_per_node {
            return Err(DsmError::Distribution(format!(
                "first-touch offset {:#x} for page {} exceeds the node share",
                offset, page
            )));
        }
        self.resolved.insert(page, (home, offset));
        Ok((home, offset + drift))
    }

    /// Resolve a page with no local knowledge: read the claim node's
    /// directory, claim if unowned, or wait for the winner to publish
    fn resolve(&self, page: usize) -> DsmResult<(NodeId, usize)> {
        let claim_node = page % self.nodes;
        let index = OWNER_WORDS * page;

        let info = self.read_owner_words(claim_node, index)?;
        if info.iter().any(|&word| word != OWNER_NULL) {
            let info = self.wait_published(claim_node, index)?;
            return Ok((info[0] as NodeId, info[1] as usize));
        }
        self.claim(page, claim_node, index)
    }

    /// Run the claim protocol for an unowned page
    fn claim(&self, page: usize, claim_node: NodeId, index: usize) -> DsmResult<(NodeId, usize)> {
        let rank = self.backend.node_id() as u64;
        let observed = self.backend.compare_exchange_word(
            claim_node,
            WindowKind::OwnersDir,
            index + 2,
            OWNER_NULL,
            rank,
        )?;

        if observed != OWNER_NULL {
            // Another node won the claim; wait for its published triple
            let info = self.wait_published(claim_node, index)?;
            return Ok((info[0] as NodeId, info[1] as usize));
        }

        // This node deposited its rank first: find a node with free backing,
        // starting from itself and wrapping
        for step in 0..self.nodes {
            let node = (self.backend.node_id() + step) % self.nodes;
            let mut offset = self.backend.read_word(node, WindowKind::OffsetsTbl, node)?;
            while (offset as usize) < self.size_per_node {
                let seen = self.backend.compare_exchange_word(
                    node,
                    WindowKind::OffsetsTbl,
                    node,
                    offset,
                    offset + PAGE_SIZE as u64,
                )?;
                if seen == offset {
                    self.backend
                        .write_word(claim_node, WindowKind::OwnersDir, index, node as u64)?;
                    self.backend
                        .write_word(claim_node, WindowKind::OwnersDir, index + 1, offset)?;
                    log::debug!(
                        "node {} claimed page {} onto node {} at {:#x}",
                        rank,
                        page,
                        node,
                        offset
                    );
                    return Ok((node, offset as usize));
                }
                offset = seen;
            }
        }
        Err(DsmError::FirstTouchExhausted)
    }

    fn read_owner_words(&self, node: NodeId, index: usize) -> DsmResult<[u64; OWNER_WORDS]> {
        Ok([
            self.backend.read_word(node, WindowKind::OwnersDir, index)?,
            self.backend.read_word(node, WindowKind::OwnersDir, index + 1)?,
            self.backend.read_word(node, WindowKind::OwnersDir, index + 2)?,
        ])
    }

    /// Spin until the claim winner has published home and offset
    fn wait_published(&self, node: NodeId, index: usize) -> DsmResult<[u64; OWNER_WORDS]> {
        loop {
            let info = self.read_owner_words(node, index)?;
            if info.iter().all(|&word| word != OWNER_NULL) {
                return Ok(info);
            }
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cluster::ClusterArena;
    use std::thread;

    struct OwnerWindows {
        owners: Vec<Box<[u64]>>,
        offsets: Vec<Box<[u64]>>,
    }

    fn setup(nodes: usize, pages: usize) -> (Arc<ClusterArena>, OwnerWindows) {
        let arena = ClusterArena::new(nodes);
        let mut owners = Vec::new();
        let mut offsets = Vec::new();
        for node in 0..nodes {
            let owner_buf = vec![OWNER_NULL; OWNER_WORDS * pages].into_boxed_slice();
            let offset_buf = vec![0u64; nodes].into_boxed_slice();
            let backend = arena.backend(node);
            backend
                .register_window(
                    WindowKind::OwnersDir,
                    owner_buf.as_ptr() as *mut u8,
                    owner_buf.len() * 8,
                )
                .unwrap();
            backend
                .register_window(
                    WindowKind::OffsetsTbl,
                    offset_buf.as_ptr() as *mut u8,
                    offset_buf.len() * 8,
                )
                .unwrap();
            owners.push(owner_buf);
            offsets.push(offset_buf);
        }
        (arena, OwnerWindows { owners, offsets })
    }

    #[test]
    fn first_toucher_becomes_home() {
        let (arena, windows) = setup(2, 8);
        let ft = FirstTouch::new(2, 4 * PAGE_SIZE, Arc::new(arena.backend(1)));

        let (home, offset) = ft.locate(3 * PAGE_SIZE + 5).unwrap();
        assert_eq!(home, 1);
        assert_eq!(offset, 5);

        // Page 3's claim node is node 1; the claimant word records the rank
        assert_eq!(windows.owners[1][OWNER_WORDS * 3 + 2], 1);
        assert_eq!(windows.offsets[1][1], PAGE_SIZE as u64);
    }

    #[test]
    fn concurrent_claims_have_one_winner_and_agree() {
        let (arena, windows) = setup(2, 8);
        let page = 5;

        let results: Vec<_> = (0..2)
            .map(|node| {
                let backend = Arc::new(arena.backend(node));
                thread::spawn(move || {
                    let ft = FirstTouch::new(2, 4 * PAGE_SIZE, backend);
                    ft.locate(page * PAGE_SIZE).unwrap()
                })
            })
            .map(|h| h.join().unwrap())
            .collect();

        // Both nodes agree on the published placement
        assert_eq!(results[0], results[1]);

        // Exactly one rank is recorded as the claimant
        let claimant = windows.owners[page % 2][OWNER_WORDS * page + 2];
        assert!(claimant == 0 || claimant == 1);
    }

    #[test]
    fn losers_read_back_the_published_placement() {
        let (arena, _windows) = setup(2, 8);
        let ft0 = FirstTouch::new(2, 4 * PAGE_SIZE, Arc::new(arena.backend(0)));
        let ft1 = FirstTouch::new(2, 4 * PAGE_SIZE, Arc::new(arena.backend(1)));

        let placed = ft0.locate(6 * PAGE_SIZE).unwrap();
        assert_eq!(placed.0, 0);
        assert_eq!(ft1.locate(6 * PAGE_SIZE).unwrap(), placed);
    }

    #[test]
    fn exhausted_backing_is_fatal() {
        // One page of backing per node, three distinct pages to place
        let (arena, _windows) = setup(2, 8);
        let ft = FirstTouch::new(2, PAGE_SIZE, Arc::new(arena.backend(0)));

        ft.locate(0).unwrap();
        ft.locate(PAGE_SIZE).unwrap();
        assert_eq!(ft.locate(2 * PAGE_SIZE), Err(DsmError::FirstTouchExhausted));
    }

    #[test]
    fn repeated_lookups_hit_the_local_cache() {
        let (arena, mut windows) = setup(2, 8);
        let ft = FirstTouch::new(2, 4 * PAGE_SIZE, Arc::new(arena.backend(0)));

        let first = ft.locate(2 * PAGE_SIZE).unwrap();
        // Clobber the directory; a cached page must not consult it again
        windows.owners[0][OWNER_WORDS * 2] = 0xdead;
        let again = ft.locate(2 * PAGE_SIZE + 9).unwrap();
        assert_eq!(again.0, first.0);
        assert_eq!(again.1, first.1 + 9);
    }
}
