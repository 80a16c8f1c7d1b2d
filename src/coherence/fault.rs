//! Fault classification and handling
//!
//! [`Engine::handle_access`] is the whole fault path as an ordinary
//! function: the SIGSEGV shim only extracts the faulting address and calls
//! it, and tests drive it directly without delivering signals.
//!
//! Access kind is not an input. A fault on an unmapped line always installs
//! a read-only mapping first; a store then faults again on the read-only
//! page, which is the write-upgrade case (valid state, matching tag). A
//! node's own pages take a separate path that maps the local backing
//! directly and never occupies a cache slot.

use std::time::Instant;

use crate::backend::{single_bit_node, WindowKind, WindowLock};
use crate::cache::{CacheState, LineState, NULL_TAG};
use crate::runtime::Engine;
use crate::types::{align_backwards, is_zero_or_pow2, DsmResult, BLOCK_SIZE, PAGE_SIZE};
use crate::vm::Protection;

impl Engine {
    /// Handle an access to `addr`, a virtual address inside the global
    /// window, and leave it mapped for at least the faulting access
    pub fn handle_access(&self, addr: usize) -> DsmResult<()> {
        let started = Instant::now();
        let access_offset = addr - self.geometry.global_start;
        let aligned = align_backwards(access_offset, BLOCK_SIZE);
        let classidx = self.geometry.classification_index(aligned);
        let line_ptr = (self.geometry.global_start + aligned) as *mut u8;

        let id = 1u64 << self.node_id();
        let invid = !id;

        let mut cache = self.cache.lock().expect("cache lock poisoned");
        let slot = cache.slot_of(aligned);
        let (home, offset) = self.dist.locate(aligned)?;

        if home == self.node_id() {
            let _comm = self.comm.lock().expect("serializer poisoned");
            self.handle_local_access(classidx, line_ptr, offset, id, invid)?;
            return Ok(());
        }

        let control = cache.control[slot];
        if control.state == LineState::Invalid
            || (control.tag != aligned && control.tag != NULL_TAG)
        {
            self.load_cache_line(&mut cache, aligned, slot)?;
            self.stats.record_load(started);
            return Ok(());
        }

        let line = CacheState::line_start(slot);
        if cache.control[line].dirty {
            // Another thread already upgraded this line between the fault
            // and the cache lock
            return Ok(());
        }

        cache.touched[line] = 1;
        cache.control[line].dirty = true;

        {
            let _comm = self.comm.lock().expect("serializer poisoned");
            let node = self.node_id();
            let writers = self
                .backend
                .read_word(node, WindowKind::Sharers, classidx + 1)?;

            // Already a registered writer, or at most one other writer known
            if writers != id && is_zero_or_pow2(writers) {
                self.backend
                    .or_word(node, WindowKind::Sharers, classidx + 1, id)?;

                // Register at the home and learn the latest masks; the
                // fetch returns the pre-operation value
                let writers = self
                    .backend
                    .fetch_or_word(home, WindowKind::Sharers, classidx + 1, id)?
                    | id;
                let sharers = self.backend.read_word(home, WindowKind::Sharers, classidx)?;
                self.backend
                    .or_word(node, WindowKind::Sharers, classidx, sharers)?;

                self.escalate_writers(classidx, id, invid, writers, sharers)?;
            }

            let live =
                unsafe { std::slice::from_raw_parts(line_ptr as *const u8, BLOCK_SIZE) };
            cache.snapshot_twin(line, live);
            let spilled = cache.write_buffer.add(slot);
            self.write_back_spilled(&mut cache, spilled)?;
        }

        self.vm.protect(line_ptr, BLOCK_SIZE, Protection::ReadWrite)?;
        self.stats.record_store_time(started);
        Ok(())
    }

    /// Fault on a page this node is home to: register in the directory and
    /// map the local backing directly
    fn handle_local_access(
        &self,
        classidx: usize,
        line_ptr: *mut u8,
        offset: usize,
        id: u64,
        invid: u64,
    ) -> DsmResult<()> {
        let node = self.node_id();
        let prevsharer = self.backend.read_word(node, WindowKind::Sharers, classidx)? & id;

        if prevsharer != id {
            // First access: become a sharer
            let sharers = self
                .backend
                .fetch_or_word(node, WindowKind::Sharers, classidx, id)?;
            if sharers != 0 && sharers != id && is_zero_or_pow2(sharers) {
                // A single remote node holds the line privately; force it
                // to shared by appearing in its sharer mask
                match single_bit_node(sharers & invid, self.number_of_nodes()) {
                    Some(owner) => {
                        self.backend.or_word(owner, WindowKind::Sharers, classidx, id)?;
                    }
                    None => {
                        return Err(crate::types::DsmError::Backend(
                            "sharer mask names this node as its own remote holder".to_string(),
                        ))
                    }
                }
            }
            self.vm.map(
                line_ptr,
                BLOCK_SIZE,
                self.geometry.chunk_backing_offset + offset,
                Protection::Read,
            )?;
        } else {
            // Second access: become a writer
            let sharers = self.backend.read_word(node, WindowKind::Sharers, classidx)?;
            let writers = self
                .backend
                .fetch_or_word(node, WindowKind::Sharers, classidx + 1, id)?;

            if writers != id && writers != 0 && is_zero_or_pow2(writers & invid) {
                if let Some(owner) = single_bit_node(writers & invid, self.number_of_nodes()) {
                    self.backend
                        .or_word(owner, WindowKind::Sharers, classidx + 1, id)?;
                }
            } else if writers == id || writers == 0 {
                self.notify_sharers(classidx, id, sharers)?;
            }
            self.vm.map(
                line_ptr,
                BLOCK_SIZE,
                self.geometry.chunk_backing_offset + offset,
                Protection::ReadWrite,
            )?;
        }
        Ok(())
    }

    /// Multi-writer escalation after a write registration
    fn escalate_writers(
        &self,
        classidx: usize,
        id: u64,
        invid: u64,
        writers: u64,
        sharers: u64,
    ) -> DsmResult<()> {
        if writers != id && writers != 0 && is_zero_or_pow2(writers & invid) {
            // One remote writer: appear in its writer mask so it downgrades
            if let Some(owner) = single_bit_node(writers & invid, self.number_of_nodes()) {
                self.backend
                    .or_word(owner, WindowKind::Sharers, classidx + 1, id)?;
            }
        } else if writers == id || writers == 0 {
            // This node may be about to create the multi-writer state:
            // every sharer must learn about it before its next epoch
            self.notify_sharers(classidx, id, sharers)?;
        }
        Ok(())
    }

    fn notify_sharers(&self, classidx: usize, id: u64, sharers: u64) -> DsmResult<()> {
        for node in 0..self.number_of_nodes() {
            if node != self.node_id() && sharers & (1 << node) != 0 {
                self.backend
                    .or_word(node, WindowKind::Sharers, classidx + 1, id)?;
            }
        }
        Ok(())
    }

    /// Fetch a remote line into a cache slot, evicting the occupant
    pub(crate) fn load_cache_line(
        &self,
        cache: &mut CacheState,
        load_addr: usize,
        slot: usize,
    ) -> DsmResult<()> {
        if load_addr >= self.geometry.global_size {
            // Out-of-memory prefetch; nothing to do
            return Ok(());
        }
        let line_addr = align_backwards(load_addr, BLOCK_SIZE);
        let idx = CacheState::line_start(slot);
        if idx >= self.geometry.cache_pages {
            log::warn!(
                "cache index {} beyond capacity {}",
                idx,
                self.geometry.cache_pages
            );
            return Ok(());
        }

        let _comm = self.comm.lock().expect("serializer poisoned");

        let control = cache.control[idx];
        if control.tag == line_addr && control.state != LineState::Invalid {
            return Ok(());
        }

        let line_ptr = (self.geometry.global_start + line_addr) as *mut u8;

        if control.tag != line_addr && control.tag != NULL_TAG {
            // Evict the occupant: write it back if dirty, then unmap
            let old_ptr = (self.geometry.global_start + control.tag) as *mut u8;
            if control.dirty {
                self.write_back_line(cache, idx)?;
                cache.write_buffer.erase(idx);
            }
            self.unlock_used_windows(cache)?;

            cache.control[idx].state = LineState::Invalid;
            cache.control[idx].tag = line_addr;
            cache.control[idx].dirty = false;
            self.vm
                .map(line_ptr, BLOCK_SIZE, idx * PAGE_SIZE, Protection::None)?;
            self.vm.protect(old_ptr, BLOCK_SIZE, Protection::None)?;
        }

        let id = 1u64 << self.node_id();
        let invid = !id;
        let classidx = self.geometry.classification_index(line_addr);
        let node = self.node_id();
        let prevsharer = self.backend.read_word(node, WindowKind::Sharers, classidx)? & id;
        let (home, offset) = self.dist.locate(line_addr)?;

        let mut tempsharer = 0;
        let mut tempwriter = 0;
        if prevsharer == 0 {
            // First fetch of this line: register as sharer at the home and
            // learn the current masks (pre-operation values)
            tempsharer = self
                .backend
                .fetch_or_word(home, WindowKind::Sharers, classidx, id)?;
            tempwriter = self.backend.read_word(home, WindowKind::Sharers, classidx + 1)?;
        }
        self.backend.or_word(node, WindowKind::Sharers, classidx, tempsharer)?;
        self.backend
            .or_word(node, WindowKind::Sharers, classidx + 1, tempwriter)?;

        if prevsharer == 0 && tempsharer != id && is_zero_or_pow2(tempsharer & invid) {
            // One other node holds the line privately, though it may not
            // have finished loading it yet; appear in its sharer mask
            if let Some(owner) = single_bit_node(tempsharer & invid, self.number_of_nodes()) {
                self.backend.or_word(owner, WindowKind::Sharers, classidx, id)?;
            }
        }

        self.backend
            .lock_window(home, WindowKind::Data, WindowLock::Shared)?;
        let dst = unsafe {
            std::slice::from_raw_parts_mut(
                (self.geometry.cache_base + idx * PAGE_SIZE) as *mut u8,
                BLOCK_SIZE,
            )
        };
        self.backend.get(home, WindowKind::Data, offset, dst)?;
        self.backend
            .unlock_window(home, WindowKind::Data, WindowLock::Shared)?;

        if cache.control[idx].tag == NULL_TAG {
            self.vm
                .map(line_ptr, BLOCK_SIZE, idx * PAGE_SIZE, Protection::Read)?;
            cache.control[idx].tag = line_addr;
        } else {
            self.vm.protect(line_ptr, BLOCK_SIZE, Protection::Read)?;
        }
        cache.touched[idx] = 1;
        cache.control[idx].state = LineState::Valid;
        cache.control[idx].dirty = false;
        Ok(())
    }
}
