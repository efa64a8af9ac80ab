// Contiguous allocation with base/limit relocation
// ------------------------------------------------
// Each process owns one contiguous block of physical memory; translation is
// `pa = base + va` with the limit register providing protection. Free space
// is an address-ordered hole list: allocation picks a hole (first-fit or
// best-fit), freeing coalesces neighbours, and when external fragmentation
// defeats an allocation that would otherwise fit, compaction slides every
// block toward address zero (moving the underlying bytes) and rebuilds a
// single trailing hole.
//
// The allocated list is kept sorted by start address; compaction depends on
// walking blocks in address order.

use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;
use rv32::MemFault;

use crate::ram::Ram;
use crate::snapshot::MemorySnapshot;

/// Hole-selection strategy for `allocate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStrategy {
    FirstFit,
    BestFit,
}

#[derive(Debug, Clone, Copy)]
struct Hole {
    start: usize,
    size: usize,
}

#[derive(Debug, Clone, Copy)]
struct ProcBlock {
    pid: i32,
    start: usize,
    size: usize,
}

#[derive(Debug)]
struct ContigInner {
    strategy: AllocStrategy,
    holes: Vec<Hole>,
    blocks: Vec<ProcBlock>,
    // Base/limit registers as loaded by the most recent context switch.
    // Translation re-reads the block table per access, so these only feed
    // the observation surface.
    base: usize,
    limit: usize,
    current_pid: i32,
}

/// Contiguous-mode MMU.
#[derive(Debug)]
pub struct ContiguousMmu {
    ram: Arc<Ram>,
    total: usize,
    inner: Mutex<ContigInner>,
}

impl ContiguousMmu {
    pub fn new(ram: Arc<Ram>, strategy: AllocStrategy) -> Self {
        let total = ram.len();
        Self {
            ram,
            total,
            inner: Mutex::new(ContigInner {
                strategy,
                holes: vec![Hole { start: 0, size: total }],
                blocks: Vec::new(),
                base: 0,
                limit: total,
                current_pid: -1,
            }),
        }
    }

    pub fn ram(&self) -> &Arc<Ram> {
        &self.ram
    }

    /// Allocate a block for `pid`. On fragmentation failure with enough
    /// total free space, compacts and retries once.
    pub fn allocate(&self, pid: i32, size: usize) -> Result<usize, MemFault> {
        if size == 0 {
            return Err(MemFault::OutOfMemory);
        }
        let mut inner = self.inner.lock();

        let mut start = Self::find_region(&inner.holes, inner.strategy, size);
        if start.is_none() {
            let total_free: usize = inner.holes.iter().map(|h| h.size).sum();
            if total_free >= size {
                info!("contiguous: external fragmentation, compacting");
                self.compact_locked(&mut inner);
                start = Self::find_region(&inner.holes, inner.strategy, size);
            }
        }

        let start = start.ok_or(MemFault::OutOfMemory)?;
        Self::carve_hole(&mut inner.holes, start, size);
        let at = inner.blocks.partition_point(|b| b.start < start);
        inner.blocks.insert(at, ProcBlock { pid, start, size });
        debug!("contiguous: pid {} allocated [0x{:x}, 0x{:x})", pid, start, start + size);
        Ok(start)
    }

    /// Release every block owned by `pid` and coalesce the hole list.
    pub fn free(&self, pid: i32) {
        let mut inner = self.inner.lock();
        let mut freed = Vec::new();
        inner.blocks.retain(|b| {
            if b.pid == pid {
                freed.push(Hole { start: b.start, size: b.size });
                false
            } else {
                true
            }
        });
        inner.holes.extend(freed);
        Self::merge_holes(&mut inner.holes);
    }

    /// Load base/limit for `pid`; outside any known process the full range
    /// is exposed (kernel context).
    pub fn switch_context(&self, pid: i32) {
        let mut inner = self.inner.lock();
        inner.current_pid = pid;
        match inner.blocks.iter().find(|b| b.pid == pid) {
            Some(b) => {
                let (start, size) = (b.start, b.size);
                inner.base = start;
                inner.limit = size;
            }
            None => {
                inner.base = 0;
                inner.limit = self.total;
            }
        }
    }

    /// Translate a logical address for `pid`, checking the limit register.
    pub fn translate(&self, pid: i32, va: u32, len: u32) -> Result<u32, MemFault> {
        let inner = self.inner.lock();
        let (base, limit) = match inner.blocks.iter().find(|b| b.pid == pid) {
            Some(b) => (b.start, b.size),
            None => (0, self.total),
        };
        if (va as usize) + (len as usize) > limit {
            return Err(MemFault::Segfault { va, limit: limit as u32 });
        }
        Ok(base as u32 + va)
    }

    /// Slide all blocks toward address zero, preserving order and contents,
    /// leaving at most one hole at the end of memory.
    pub fn compact(&self) {
        let mut inner = self.inner.lock();
        self.compact_locked(&mut inner);
    }

    fn compact_locked(&self, inner: &mut ContigInner) {
        let mut cursor = 0usize;
        for b in inner.blocks.iter_mut() {
            if b.start != cursor {
                self.ram.copy_range(b.start as u32, cursor as u32, b.size);
                b.start = cursor;
            }
            cursor += b.size;
        }
        inner.holes.clear();
        if cursor < self.total {
            inner.holes.push(Hole { start: cursor, size: self.total - cursor });
        }
    }

    /// Allocate a block for `child_pid` the size of the parent's and copy the
    /// parent image into it.
    pub fn clone_block(&self, parent_pid: i32, child_pid: i32) -> Result<(), MemFault> {
        let size = {
            let inner = self.inner.lock();
            inner
                .blocks
                .iter()
                .find(|b| b.pid == parent_pid)
                .map(|b| b.size)
                .ok_or(MemFault::Unmapped { va: 0 })?
        };
        // Allocation may compact and move the parent; re-resolve it after.
        self.allocate(child_pid, size)?;
        let (src, dst) = {
            let inner = self.inner.lock();
            let parent = inner.blocks.iter().find(|b| b.pid == parent_pid);
            let child = inner.blocks.iter().find(|b| b.pid == child_pid);
            match (parent, child) {
                (Some(p), Some(c)) => (p.start, c.start),
                _ => return Err(MemFault::Unmapped { va: 0 }),
            }
        };
        let mut buf = vec![0u8; size];
        self.ram.read_into(src as u32, &mut buf)?;
        self.ram.write_from(dst as u32, &buf)?;
        Ok(())
    }

    /// Re-tag every block owned by `from` to `to` (used by the exec swap,
    /// which stages the replacement image under a temporary owner).
    pub fn relabel(&self, from: i32, to: i32) {
        let mut inner = self.inner.lock();
        for b in inner.blocks.iter_mut() {
            if b.pid == from {
                b.pid = to;
            }
        }
    }

    pub fn block_size(&self, pid: i32) -> Option<usize> {
        self.inner.lock().blocks.iter().find(|b| b.pid == pid).map(|b| b.size)
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let inner = self.inner.lock();
        MemorySnapshot::Contiguous {
            total_bytes: self.total,
            holes: inner.holes.iter().map(|h| (h.start, h.size)).collect(),
            blocks: inner.blocks.iter().map(|b| (b.pid, b.start, b.size)).collect(),
        }
    }

    fn find_region(holes: &[Hole], strategy: AllocStrategy, size: usize) -> Option<usize> {
        match strategy {
            AllocStrategy::FirstFit => holes.iter().find(|h| h.size >= size).map(|h| h.start),
            AllocStrategy::BestFit => holes
                .iter()
                .filter(|h| h.size >= size)
                .min_by_key(|h| h.size)
                .map(|h| h.start),
        }
    }

    fn carve_hole(holes: &mut Vec<Hole>, start: usize, size: usize) {
        for i in 0..holes.len() {
            if holes[i].start == start {
                if holes[i].size == size {
                    holes.remove(i);
                } else {
                    holes[i].start += size;
                    holes[i].size -= size;
                }
                return;
            }
        }
        unreachable!("carving a region that is not a hole head");
    }

    fn merge_holes(holes: &mut Vec<Hole>) {
        holes.sort_by_key(|h| h.start);
        let mut i = 0;
        while i + 1 < holes.len() {
            if holes[i].start + holes[i].size == holes[i + 1].start {
                holes[i].size += holes[i + 1].size;
                holes.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }
}
