//! Selective coherence
//!
//! Release/acquire restricted to a byte range: cheaper than a full epoch
//! boundary, but ordering only covers the named range. Both walk the range
//! line by line; a line participates only when the cache slot it maps to
//! actually holds it, so unrelated occupants of a colliding slot are left
//! alone.

use std::time::Instant;

use crate::backend::WindowKind;
use crate::cache::LineState;
use crate::runtime::Engine;
use crate::types::{align_backwards, DsmResult, BLOCK_SIZE};
use crate::vm::Protection;

impl Engine {
    /// Downgrade every dirty line in `[addr, addr + size)` to its home
    ///
    /// Ordering is only provided for the named range; writes outside it
    /// remain buffered.
    pub fn selective_release(&self, addr: *const u8, size: usize) -> DsmResult<()> {
        if size == 0 || !self.is_distributed() {
            return Ok(());
        }
        let started = Instant::now();
        let mut cache = self.cache.lock().expect("cache lock poisoned");
        let _comm = self.comm.lock().expect("serializer poisoned");

        for line_addr in self.lines_of(addr, size) {
            let slot = cache.slot_of(line_addr);
            if cache.control[slot].tag == line_addr && cache.control[slot].dirty {
                self.write_back_line(&mut cache, slot)?;
                cache.write_buffer.erase(slot);
            }
        }
        self.unlock_used_windows(&mut cache)?;
        self.stats.record_selective_release(started);
        Ok(())
    }

    /// Invalidate every line in `[addr, addr + size)` this node does not
    /// exclusively own, downgrading dirty ones first
    pub fn selective_acquire(&self, addr: *const u8, size: usize) -> DsmResult<()> {
        if size == 0 || !self.is_distributed() {
            return Ok(());
        }
        let started = Instant::now();
        let id = 1u64 << self.node_id();
        let mut cache = self.cache.lock().expect("cache lock poisoned");
        let _comm = self.comm.lock().expect("serializer poisoned");

        for line_addr in self.lines_of(addr, size) {
            let slot = cache.slot_of(line_addr);
            if cache.control[slot].tag != line_addr {
                continue;
            }
            if cache.control[slot].dirty {
                self.write_back_line(&mut cache, slot)?;
                cache.write_buffer.erase(slot);
            }

            let classidx = self.geometry.classification_index(line_addr);
            let node = self.node_id();
            let writers = self
                .backend
                .read_word(node, WindowKind::Sharers, classidx + 1)?;
            let sharers = self.backend.read_word(node, WindowKind::Sharers, classidx)?;

            if writers == id || (writers == 0 && sharers & id == id) {
                // Sole writer or shared-only reader: the copy stays valid
                cache.touched[slot] = 1;
            } else {
                cache.control[slot].dirty = false;
                cache.control[slot].state = LineState::Invalid;
                cache.touched[slot] = 0;
                self.vm.protect(
                    (self.geometry.global_start + line_addr) as *mut u8,
                    BLOCK_SIZE,
                    Protection::None,
                )?;
            }
        }
        self.unlock_used_windows(&mut cache)?;
        self.stats.record_selective_acquire(started);
        Ok(())
    }

    /// Line-aligned global offsets covering `[addr, addr + size)`
    fn lines_of(&self, addr: *const u8, size: usize) -> impl Iterator<Item = usize> {
        let offset = addr as usize - self.geometry.global_start;
        let first = align_backwards(offset, BLOCK_SIZE);
        let misalignment = offset - first;
        let lines = (misalignment + size + BLOCK_SIZE - 1) / BLOCK_SIZE;
        (0..lines).map(move |i| first + i * BLOCK_SIZE)
    }
}
