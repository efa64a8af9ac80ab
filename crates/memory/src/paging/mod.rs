// Paged memory manager
// --------------------
// One global frame allocator (bitset + refcounts + reverse map) backs every
// address space. Address spaces are keyed by a monotonic SpaceId rather than
// by PID, so an exec can build a replacement space and swap it in while the
// old one still exists. All state lives behind a single mutex; the lock
// order is PagedInner -> Ram and never the reverse.
//
// The pager resolves every virtual access:
//   1. UART addresses bypass translation (handled by the caller).
//   2. A valid PTE with sufficient permissions updates accessed/dirty bits
//      and the replacement policy, then returns the frame.
//   3. A miss under demand fetch allocates (evicting if the allocator is
//      dry), zero-fills, and installs a PTE with the region's permissions or
//      the access-kind defaults.
//   4. A permission mismatch is a protection fault.

pub mod frame;
pub mod policy;
pub mod space;

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, trace};
use parking_lot::Mutex;
use rv32::MemFault;

use crate::mmu::{Perms, SpaceId};
use crate::ram::Ram;
use crate::snapshot::{FrameOwnerView, MemorySnapshot};
use crate::VmAccess;

use frame::{FrameAllocator, FrameOwner, PAGE_SIZE};
use policy::{FetchPolicy, ReplacementPolicy};
use space::{vpn_of, AddressSpace};

struct PagedInner {
    frames: FrameAllocator,
    spaces: HashMap<SpaceId, AddressSpace>,
    shared: HashMap<i32, usize>,
    policy: Box<dyn ReplacementPolicy>,
    fetch: FetchPolicy,
    next_space: u32,
    current: Option<SpaceId>,
}

/// Paged-mode MMU with pluggable fetch and replacement policies.
pub struct PagedMmu {
    ram: Arc<Ram>,
    inner: Mutex<PagedInner>,
}

impl PagedMmu {
    pub fn new(ram: Arc<Ram>, fetch: FetchPolicy, policy: Box<dyn ReplacementPolicy>) -> Self {
        let total_frames = ram.len() / PAGE_SIZE;
        Self {
            ram,
            inner: Mutex::new(PagedInner {
                frames: FrameAllocator::new(total_frames),
                spaces: HashMap::new(),
                shared: HashMap::new(),
                policy,
                fetch,
                next_space: 1,
                current: None,
            }),
        }
    }

    pub fn ram(&self) -> &Arc<Ram> {
        &self.ram
    }

    pub fn total_frames(&self) -> usize {
        self.inner.lock().frames.total()
    }

    pub fn create_space(&self, pid: i32) -> SpaceId {
        let mut inner = self.inner.lock();
        let id = SpaceId(inner.next_space);
        inner.next_space += 1;
        inner.spaces.insert(id, AddressSpace::new(id, pid));
        debug!("paging: created space {:?} for pid {}", id, pid);
        id
    }

    /// Tear down a space: free each valid data frame honouring refcounts,
    /// then the L2 table frames, then drop the record.
    pub fn destroy_space(&self, id: SpaceId) {
        let mut inner = self.inner.lock();
        let Some(space) = inner.spaces.remove(&id) else {
            return;
        };
        let pid = space.pid;
        for (_, pte) in space.leaves() {
            Self::release_data_frame(&mut inner, pte.ppn);
        }
        for table_frame in space.table_frames() {
            inner.frames.release(table_frame);
        }
        info!("paging: reclaimed space {:?} (pid {})", id, pid);
    }

    /// Drop one data-frame reference, with the bookkeeping that goes along:
    /// the replacement policy forgets frames that actually leave residency,
    /// and a shared frame whose last mapping is gone also gives up its
    /// registry reference so the frame returns to the free set.
    fn release_data_frame(inner: &mut PagedInner, ppn: usize) {
        let owner = inner.frames.owner(ppn);
        if inner.frames.release(ppn) {
            inner.policy.on_unmap(ppn);
            inner.shared.retain(|_, &mut f| f != ppn);
        } else if let Some(FrameOwner::Shared { key }) = owner {
            if inner.frames.refcount(ppn) == 1 {
                // Only the registry still holds the frame.
                inner.frames.release(ppn);
                inner.policy.on_unmap(ppn);
                inner.shared.remove(&key);
            }
        }
    }

    pub fn switch_context(&self, id: SpaceId) {
        self.inner.lock().current = Some(id);
    }

    /// Space selected by the most recent context switch (observation only;
    /// translation always names its space explicitly).
    pub fn current_space(&self) -> Option<SpaceId> {
        self.inner.lock().current
    }

    /// Declare a region's protections, page-aligned. Under eager fetch all
    /// covered pages are materialised (and zero-filled) immediately; under
    /// demand fetch the pages arrive on first touch with these permissions.
    pub fn map_region(&self, id: SpaceId, va: u32, len: usize, perms: Perms) -> Result<(), MemFault> {
        if va as usize % PAGE_SIZE != 0 {
            return Err(MemFault::Misaligned { va, size: PAGE_SIZE as u32 });
        }
        let pages = len.div_ceil(PAGE_SIZE);
        let start_vpn = vpn_of(va);

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let space = inner.spaces.get_mut(&id).ok_or(MemFault::Unmapped { va })?;
        space.add_region(start_vpn, start_vpn + pages as u32, perms);

        if inner.fetch == FetchPolicy::Eager {
            for i in 0..pages as u32 {
                let page_va = va + i * PAGE_SIZE as u32;
                self.resolve_locked(inner, id, page_va, VmAccess::Read, false)?;
            }
        }
        Ok(())
    }

    /// Resolve a data access to a physical address, faulting pages in as the
    /// fetch policy allows.
    pub fn resolve(&self, id: SpaceId, va: u32, access: VmAccess) -> Result<u32, MemFault> {
        let mut guard = self.inner.lock();
        let ppn = self.resolve_locked(&mut guard, id, va, access, true)?;
        Ok(((ppn as u32) << 12) | (va & 0xfff))
    }

    /// Loader path: write bytes through translation without permission
    /// checks (segments are often mapped read/execute-only).
    pub fn loader_write(&self, id: SpaceId, va: u32, data: &[u8]) -> Result<(), MemFault> {
        let mut guard = self.inner.lock();
        let mut offset = 0usize;
        while offset < data.len() {
            let cur = va + offset as u32;
            let in_page = PAGE_SIZE - (cur as usize & (PAGE_SIZE - 1));
            let chunk = in_page.min(data.len() - offset);
            let ppn = self.resolve_locked(&mut guard, id, cur, VmAccess::Write, false)?;
            let pa = ((ppn as u32) << 12) | (cur & 0xfff);
            self.ram.write_from(pa, &data[offset..offset + chunk])?;
            offset += chunk;
        }
        Ok(())
    }

    fn resolve_locked(
        &self,
        inner: &mut PagedInner,
        id: SpaceId,
        va: u32,
        access: VmAccess,
        enforce_perms: bool,
    ) -> Result<usize, MemFault> {
        let vpn = vpn_of(va);

        let space = inner.spaces.get_mut(&id).ok_or(MemFault::Unmapped { va })?;
        if let Some(pte) = space.pte(vpn) {
            let allowed = match access {
                VmAccess::Read => pte.read,
                VmAccess::Write => pte.write,
                VmAccess::Exec => pte.exec,
            };
            if enforce_perms && !allowed {
                return Err(MemFault::Protection { va });
            }
            let ppn = pte.ppn;
            Self::touch(inner, id, vpn, ppn, access);
            return Ok(ppn);
        }

        if inner.fetch != FetchPolicy::Demand && enforce_perms {
            return Err(MemFault::Unmapped { va });
        }

        // Page fault: bring the page in.
        let perms = inner
            .spaces
            .get(&id)
            .and_then(|s| s.region_perms(vpn))
            .unwrap_or(match access {
                VmAccess::Read => Perms::r(),
                VmAccess::Write => Perms::rw(),
                VmAccess::Exec => Perms::rx(),
            });
        let ppn = Self::allocate_resident_frame(inner, id, vpn)?;
        self.ram
            .fill_zero((ppn * PAGE_SIZE) as u32, PAGE_SIZE)
            .expect("frame allocator handed out an out-of-range frame");

        let pid;
        {
            let space = inner.spaces.get_mut(&id).expect("space checked above");
            pid = space.pid;
            if space
                .map_page(&mut inner.frames, vpn, ppn, perms, false)
                .is_none()
            {
                // No frame left for the L2 table; give the data frame back.
                Self::release_data_frame(inner, ppn);
                return Err(MemFault::OutOfMemory);
            }
        }
        inner
            .frames
            .set_owner(ppn, Some(FrameOwner::Data { space: id, pid, vpn }));
        inner.policy.on_map(ppn);
        trace!("paging: fault in {:?} vpn 0x{:x} -> frame {}", id, vpn, ppn);

        if enforce_perms {
            let allowed = match access {
                VmAccess::Read => perms.read,
                VmAccess::Write => perms.write,
                VmAccess::Exec => perms.exec,
            };
            if !allowed {
                return Err(MemFault::Protection { va });
            }
        }
        Self::touch(inner, id, vpn, ppn, access);
        Ok(ppn)
    }

    /// Update accessed/dirty bits, per-VPN counters, and the policy.
    fn touch(inner: &mut PagedInner, id: SpaceId, vpn: u32, ppn: usize, access: VmAccess) {
        if let Some(space) = inner.spaces.get_mut(&id) {
            space.note_access(vpn);
            if let Some(pte) = space.pte_mut(vpn) {
                pte.accessed = true;
                if access == VmAccess::Write {
                    pte.dirty = true;
                }
            }
        }
        inner.policy.on_access(ppn);
    }

    /// Allocate a data frame, evicting a victim when the allocator is dry.
    fn allocate_resident_frame(
        inner: &mut PagedInner,
        for_space: SpaceId,
        for_vpn: u32,
    ) -> Result<usize, MemFault> {
        if let Some(frame) = inner.frames.alloc() {
            return Ok(frame);
        }

        let PagedInner { frames, policy, .. } = inner;
        let victim = policy.pick_victim(&|f| match frames.owner(f) {
            // Only privately owned data pages may be evicted; page-table
            // frames, shared pages, and the faulting page itself stay.
            Some(FrameOwner::Data { space, vpn, .. }) => {
                frames.refcount(f) == 1 && !(space == for_space && vpn == for_vpn)
            }
            _ => false,
        });
        let Some(victim) = victim else {
            return Err(MemFault::OutOfMemory);
        };

        let Some(FrameOwner::Data { space: owner_space, vpn: owner_vpn, pid }) =
            inner.frames.owner(victim)
        else {
            unreachable!("victim predicate admits only data pages");
        };
        debug!(
            "paging: evicting frame {} (pid {} vpn 0x{:x})",
            victim, pid, owner_vpn
        );
        if let Some(owner) = inner.spaces.get_mut(&owner_space) {
            owner.unmap_page(owner_vpn);
        }
        inner.policy.on_unmap(victim);
        let freed = inner.frames.release(victim);
        debug_assert!(freed, "evicted a frame that still had references");

        inner.frames.alloc().ok_or(MemFault::OutOfMemory)
    }

    /// Duplicate `src` for a forked child: shared leaves alias the same
    /// frame (refcount bumped), private leaves get a fresh frame and a
    /// 4 KiB copy. Any failure rolls the child back completely.
    pub fn clone_space(&self, src: SpaceId, child_pid: i32) -> Result<SpaceId, MemFault> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let leaves = inner
            .spaces
            .get(&src)
            .ok_or(MemFault::Unmapped { va: 0 })?
            .leaves();

        let child_id = SpaceId(inner.next_space);
        inner.next_space += 1;
        let mut child = AddressSpace::new(child_id, child_pid);

        let mut copied_frames: Vec<usize> = Vec::new();
        let mut retained_frames: Vec<usize> = Vec::new();

        let result: Result<(), MemFault> = (|| {
            for (vpn, pte) in &leaves {
                let perms = Perms { read: pte.read, write: pte.write, exec: pte.exec };
                if pte.shared {
                    child
                        .map_page(&mut inner.frames, *vpn, pte.ppn, perms, true)
                        .ok_or(MemFault::OutOfMemory)?;
                    inner.frames.retain(pte.ppn);
                    retained_frames.push(pte.ppn);
                } else {
                    let frame = inner.frames.alloc().ok_or(MemFault::OutOfMemory)?;
                    copied_frames.push(frame);
                    let src_pa = (pte.ppn * PAGE_SIZE) as u32;
                    let dst_pa = (frame * PAGE_SIZE) as u32;
                    let mut buf = [0u8; PAGE_SIZE];
                    self.ram.read_into(src_pa, &mut buf)?;
                    self.ram.write_from(dst_pa, &buf)?;
                    child
                        .map_page(&mut inner.frames, *vpn, frame, perms, false)
                        .ok_or(MemFault::OutOfMemory)?;
                    inner.frames.set_owner(
                        frame,
                        Some(FrameOwner::Data { space: child_id, pid: child_pid, vpn: *vpn }),
                    );
                    inner.policy.on_map(frame);
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                inner.spaces.insert(child_id, child);
                debug!("paging: cloned space {:?} -> {:?} (pid {})", src, child_id, child_pid);
                Ok(child_id)
            }
            Err(fault) => {
                for frame in copied_frames {
                    inner.policy.on_unmap(frame);
                    inner.frames.release(frame);
                }
                for frame in retained_frames {
                    inner.frames.release(frame);
                }
                for table_frame in child.table_frames() {
                    inner.frames.release(table_frame);
                }
                Err(fault)
            }
        }
    }

    /// Get or create the zero-filled frame behind a shared-region key.
    pub fn open_shared(&self, key: i32) -> Result<usize, MemFault> {
        let mut inner = self.inner.lock();
        if let Some(&frame) = inner.shared.get(&key) {
            return Ok(frame);
        }
        let frame = inner.frames.alloc().ok_or(MemFault::OutOfMemory)?;
        inner.frames.set_owner(frame, Some(FrameOwner::Shared { key }));
        self.ram
            .fill_zero((frame * PAGE_SIZE) as u32, PAGE_SIZE)
            .expect("frame allocator handed out an out-of-range frame");
        inner.shared.insert(key, frame);
        inner.policy.on_map(frame);
        Ok(frame)
    }

    /// Map a shared frame into a space at `vpn`; each mapping holds one
    /// reference on the frame.
    pub fn map_shared(
        &self,
        id: SpaceId,
        vpn: u32,
        frame: usize,
        writable: bool,
    ) -> Result<(), MemFault> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let perms = if writable { Perms::rw() } else { Perms::r() };
        let space = inner
            .spaces
            .get_mut(&id)
            .ok_or(MemFault::Unmapped { va: vpn << 12 })?;
        space
            .map_page(&mut inner.frames, vpn, frame, perms, true)
            .ok_or(MemFault::OutOfMemory)?;
        inner.frames.retain(frame);
        Ok(())
    }

    pub fn space_pid(&self, id: SpaceId) -> Option<i32> {
        self.inner.lock().spaces.get(&id).map(|s| s.pid)
    }

    /// (ppn, accessed, dirty, shared) for a resident page.
    pub fn page_info(&self, id: SpaceId, vpn: u32) -> Option<(usize, bool, bool, bool)> {
        let inner = self.inner.lock();
        let pte = inner.spaces.get(&id)?.pte(vpn)?;
        Some((pte.ppn, pte.accessed, pte.dirty, pte.shared))
    }

    pub fn frame_refcount(&self, frame: usize) -> u32 {
        self.inner.lock().frames.refcount(frame)
    }

    pub fn access_count(&self, id: SpaceId, vpn: u32) -> u64 {
        self.inner
            .lock()
            .spaces
            .get(&id)
            .map(|s| s.access_count(vpn))
            .unwrap_or(0)
    }

    /// (free frames, resident data frames, page-table frames); the three
    /// always sum to the frame total.
    pub fn accounting(&self) -> (usize, usize, usize) {
        self.inner.lock().frames.accounting()
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let inner = self.inner.lock();
        let total = inner.frames.total();
        let owners = (0..total)
            .map(|f| match inner.frames.owner(f) {
                None => FrameOwnerView::Free,
                Some(FrameOwner::Data { pid, vpn, .. }) => FrameOwnerView::Data { pid, vpn },
                Some(FrameOwner::PageTable) => FrameOwnerView::PageTable,
                Some(FrameOwner::Shared { key }) => FrameOwnerView::Shared { key },
            })
            .collect();
        MemorySnapshot::Paged { total_frames: total, owners }
    }
}
