// Two-level (Sv32-style) page tables
// ----------------------------------
// 32-bit VA, 4 KiB pages: L1 index = VA[31:22], L2 index = VA[21:12],
// offset = VA[11:0]. The L1 directory has 1024 slots; L2 tables are
// allocated on demand and each one is charged against the frame allocator
// (the charged frame number is remembered so destruction can return it).

use std::collections::HashMap;

use crate::mmu::{Perms, SpaceId};
use crate::paging::frame::FrameAllocator;

pub const L1_ENTRIES: usize = 1024;
pub const L2_ENTRIES: usize = 1024;

/// Page-table entry for a single 4 KiB mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pte {
    /// Valid bit: entry is present.
    pub valid: bool,
    /// Read permission.
    pub read: bool,
    /// Write permission.
    pub write: bool,
    /// Execute permission.
    pub exec: bool,
    /// Page is part of a shared mapping (frame refcounted across spaces).
    pub shared: bool,
    /// Accessed since the replacement policy last cleared it.
    pub accessed: bool,
    /// Written since the page was brought in.
    pub dirty: bool,
    /// Physical frame number backing this page.
    pub ppn: usize,
}

/// One L2 table plus the frame charged for its storage.
#[derive(Debug)]
pub struct L2Table {
    pub frame: usize,
    pub entries: Box<[Pte; L2_ENTRIES]>,
}

/// Region protections recorded by `map_region`; demand faults inside a
/// region inherit its permissions instead of the access-kind defaults.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub start_vpn: u32,
    pub end_vpn: u32, // exclusive
    pub perms: Perms,
}

/// Per-task virtual address space: L1 directory, demand-allocated L2 tables,
/// declared regions, and per-VPN access counters.
#[derive(Debug)]
pub struct AddressSpace {
    pub id: SpaceId,
    pub pid: i32,
    tables: Vec<Option<L2Table>>,
    regions: Vec<Region>,
    access_counts: HashMap<u32, u64>,
}

pub fn vpn_of(va: u32) -> u32 {
    va >> 12
}

fn split(vpn: u32) -> (usize, usize) {
    (((vpn >> 10) & 0x3ff) as usize, (vpn & 0x3ff) as usize)
}

impl AddressSpace {
    pub fn new(id: SpaceId, pid: i32) -> Self {
        let mut tables = Vec::with_capacity(L1_ENTRIES);
        tables.resize_with(L1_ENTRIES, || None);
        Self {
            id,
            pid,
            tables,
            regions: Vec::new(),
            access_counts: HashMap::new(),
        }
    }

    pub fn pte(&self, vpn: u32) -> Option<&Pte> {
        let (l1, l2) = split(vpn);
        let table = self.tables[l1].as_ref()?;
        let pte = &table.entries[l2];
        pte.valid.then_some(pte)
    }

    pub fn pte_mut(&mut self, vpn: u32) -> Option<&mut Pte> {
        let (l1, l2) = split(vpn);
        let table = self.tables[l1].as_mut()?;
        let pte = &mut table.entries[l2];
        pte.valid.then_some(pte)
    }

    pub fn is_present(&self, vpn: u32) -> bool {
        self.pte(vpn).is_some()
    }

    /// Install a leaf mapping, allocating the covering L2 table if missing.
    /// The L2 frame is charged to `frames`; returns `None` when the
    /// allocator cannot back a new table.
    pub fn map_page(
        &mut self,
        frames: &mut FrameAllocator,
        vpn: u32,
        ppn: usize,
        perms: Perms,
        shared: bool,
    ) -> Option<()> {
        let (l1, l2) = split(vpn);
        if self.tables[l1].is_none() {
            let frame = frames.alloc_page_table()?;
            self.tables[l1] = Some(L2Table {
                frame,
                entries: Box::new([Pte::default(); L2_ENTRIES]),
            });
        }
        let table = self.tables[l1].as_mut().expect("table installed above");
        table.entries[l2] = Pte {
            valid: true,
            read: perms.read,
            write: perms.write,
            exec: perms.exec,
            shared,
            accessed: false,
            dirty: false,
            ppn,
        };
        Some(())
    }

    /// Invalidate a leaf mapping, returning the removed entry.
    pub fn unmap_page(&mut self, vpn: u32) -> Option<Pte> {
        let (l1, l2) = split(vpn);
        let table = self.tables[l1].as_mut()?;
        let pte = table.entries[l2];
        if !pte.valid {
            return None;
        }
        table.entries[l2] = Pte::default();
        Some(pte)
    }

    pub fn add_region(&mut self, start_vpn: u32, end_vpn: u32, perms: Perms) {
        self.regions.push(Region { start_vpn, end_vpn, perms });
    }

    /// Permissions declared for `vpn` by a prior `map_region`, if any.
    pub fn region_perms(&self, vpn: u32) -> Option<Perms> {
        self.regions
            .iter()
            .rev()
            .find(|r| (r.start_vpn..r.end_vpn).contains(&vpn))
            .map(|r| r.perms)
    }

    pub fn note_access(&mut self, vpn: u32) {
        *self.access_counts.entry(vpn).or_insert(0) += 1;
    }

    pub fn access_count(&self, vpn: u32) -> u64 {
        self.access_counts.get(&vpn).copied().unwrap_or(0)
    }

    /// All valid leaf mappings as (vpn, pte) pairs.
    pub fn leaves(&self) -> Vec<(u32, Pte)> {
        let mut out = Vec::new();
        for (l1, slot) in self.tables.iter().enumerate() {
            if let Some(table) = slot {
                for (l2, pte) in table.entries.iter().enumerate() {
                    if pte.valid {
                        out.push((((l1 as u32) << 10) | l2 as u32, *pte));
                    }
                }
            }
        }
        out
    }

    /// Frames charged for L2 table storage.
    pub fn table_frames(&self) -> Vec<usize> {
        self.tables.iter().flatten().map(|t| t.frame).collect()
    }
}
