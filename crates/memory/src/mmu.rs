// The pluggable MMU surface
// -------------------------
// The kernel configures exactly one memory mode at boot; the CPU and the
// syscall layer only ever see the `Memory` contract. The two realisations
// are a tagged union rather than trait objects so mode-specific operations
// (shared pages, compaction) stay reachable without downcasts.
//
// `AddressContext` binds the MMU to one address space: each hart builds a
// context for the task it dispatches, and system calls build one for the
// calling task when they copy user memory. UART MMIO addresses bypass
// translation in both modes and route to the device.

use std::sync::Arc;

use rv32::{MemFault, Memory};

use crate::contiguous::{AllocStrategy, ContiguousMmu};
use crate::paging::policy::{EvictPolicy, FetchPolicy};
use crate::paging::PagedMmu;
use crate::ram::Ram;
use crate::snapshot::MemorySnapshot;
use crate::VmAccess;

/// Handle to one address space. Identity is generation-based, never reused,
/// so a stale handle can at worst miss (it never aliases a newer space).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpaceId(pub u32);

/// Page/region protections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Perms {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl Perms {
    pub fn r() -> Self {
        Self { read: true, write: false, exec: false }
    }
    pub fn rw() -> Self {
        Self { read: true, write: true, exec: false }
    }
    pub fn rx() -> Self {
        Self { read: true, write: false, exec: true }
    }
    pub fn rwx() -> Self {
        Self { read: true, write: true, exec: true }
    }
}

/// The configured memory mode.
pub enum Mmu {
    Contiguous(ContiguousMmu),
    Paged(PagedMmu),
}

impl Mmu {
    pub fn contiguous(ram: Arc<Ram>, strategy: AllocStrategy) -> Self {
        Mmu::Contiguous(ContiguousMmu::new(ram, strategy))
    }

    pub fn paged(ram: Arc<Ram>, fetch: FetchPolicy, evict: EvictPolicy) -> Self {
        Mmu::Paged(PagedMmu::new(ram, fetch, evict.build()))
    }

    pub fn ram(&self) -> &Arc<Ram> {
        match self {
            Mmu::Contiguous(m) => m.ram(),
            Mmu::Paged(m) => m.ram(),
        }
    }

    pub fn as_paged(&self) -> Option<&PagedMmu> {
        match self {
            Mmu::Paged(m) => Some(m),
            Mmu::Contiguous(_) => None,
        }
    }

    pub fn as_contiguous(&self) -> Option<&ContiguousMmu> {
        match self {
            Mmu::Contiguous(m) => Some(m),
            Mmu::Paged(_) => None,
        }
    }

    /// Create the address space for a new process. `size_hint` is the block
    /// size in contiguous mode and is ignored under paging.
    pub fn create_space(&self, pid: i32, size_hint: usize) -> Result<SpaceId, MemFault> {
        match self {
            Mmu::Contiguous(m) => {
                m.allocate(pid, size_hint)?;
                Ok(SpaceId(pid as u32))
            }
            Mmu::Paged(m) => Ok(m.create_space(pid)),
        }
    }

    pub fn destroy_space(&self, id: SpaceId) {
        match self {
            Mmu::Contiguous(m) => m.free(id.0 as i32),
            Mmu::Paged(m) => m.destroy_space(id),
        }
    }

    /// Duplicate `src` for a fork child.
    pub fn clone_space(&self, src: SpaceId, child_pid: i32) -> Result<SpaceId, MemFault> {
        match self {
            Mmu::Contiguous(m) => {
                m.clone_block(src.0 as i32, child_pid)?;
                Ok(SpaceId(child_pid as u32))
            }
            Mmu::Paged(m) => m.clone_space(src, child_pid),
        }
    }

    /// Declare (and under eager fetch, materialise) a region. In contiguous
    /// mode the block is flat memory; the region only has to fit.
    pub fn map_region(&self, id: SpaceId, va: u32, len: usize, perms: Perms) -> Result<(), MemFault> {
        match self {
            Mmu::Contiguous(m) => {
                m.translate(id.0 as i32, va, len as u32).map(|_| ())
            }
            Mmu::Paged(m) => m.map_region(id, va, len, perms),
        }
    }

    /// Loader write: translation without access-kind permission checks.
    pub fn loader_write(&self, id: SpaceId, va: u32, data: &[u8]) -> Result<(), MemFault> {
        match self {
            Mmu::Contiguous(m) => {
                let pa = m.translate(id.0 as i32, va, data.len() as u32)?;
                m.ram().write_from(pa, data)
            }
            Mmu::Paged(m) => m.loader_write(id, va, data),
        }
    }

    /// Stage a replacement address space for an exec. Under paging this is
    /// an ordinary new space; contiguous mode stages the block under a
    /// temporary owner so translation for the live image is undisturbed.
    pub fn create_replacement_space(&self, pid: i32, size_hint: usize) -> Result<SpaceId, MemFault> {
        match self {
            Mmu::Contiguous(m) => {
                m.allocate(-pid, size_hint)?;
                Ok(SpaceId((-pid) as u32))
            }
            Mmu::Paged(m) => Ok(m.create_space(pid)),
        }
    }

    /// Atomically adopt the staged space and release the old image.
    /// Returns the space id the task owns from here on.
    pub fn commit_replacement(&self, old: SpaceId, new: SpaceId, pid: i32) -> SpaceId {
        match self {
            Mmu::Contiguous(m) => {
                m.free(pid);
                m.relabel(-pid, pid);
                SpaceId(pid as u32)
            }
            Mmu::Paged(m) => {
                m.destroy_space(old);
                new
            }
        }
    }

    /// Load base/limit (contiguous) or the current-space marker (paged).
    pub fn switch_context(&self, id: SpaceId) {
        match self {
            Mmu::Contiguous(m) => m.switch_context(id.0 as i32),
            Mmu::Paged(m) => m.switch_context(id),
        }
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        match self {
            Mmu::Contiguous(m) => m.snapshot(),
            Mmu::Paged(m) => m.snapshot(),
        }
    }

    /// Bind an address space for the duration of a dispatch.
    pub fn context(self: &Arc<Self>, id: SpaceId) -> AddressContext {
        AddressContext { mmu: Arc::clone(self), space: id }
    }
}

/// Memory interface over one address space; this is what a hart executes
/// against.
pub struct AddressContext {
    mmu: Arc<Mmu>,
    space: SpaceId,
}

impl AddressContext {
    pub fn space(&self) -> SpaceId {
        self.space
    }

    fn resolve(&self, va: u32, size: u32, access: VmAccess) -> Result<Target, MemFault> {
        if Ram::is_mmio(va) {
            return Ok(Target::Mmio(va));
        }
        if size > 1 && va % size != 0 {
            return Err(MemFault::Misaligned { va, size });
        }
        let pa = match &*self.mmu {
            Mmu::Contiguous(m) => m.translate(self.space.0 as i32, va, size)?,
            Mmu::Paged(m) => m.resolve(self.space, va, access)?,
        };
        Ok(Target::Ram(pa))
    }

    /// Copy up to `max` bytes out of this space, stopping at a NUL.
    pub fn read_cstring(&self, va: u32, max: usize) -> Result<Vec<u8>, MemFault> {
        let mut out = Vec::new();
        for i in 0..max as u32 {
            let byte = self.load_byte(va + i)?;
            if byte == 0 {
                break;
            }
            out.push(byte);
        }
        Ok(out)
    }
}

enum Target {
    Ram(u32),
    Mmio(u32),
}

impl Memory for AddressContext {
    fn load_byte(&self, va: u32) -> Result<u8, MemFault> {
        match self.resolve(va, 1, VmAccess::Read)? {
            Target::Ram(pa) => self.mmu.ram().read_byte(pa),
            Target::Mmio(addr) => Ok(self.mmu.ram().mmio_read(addr) as u8),
        }
    }

    fn load_half(&self, va: u32) -> Result<u16, MemFault> {
        match self.resolve(va, 2, VmAccess::Read)? {
            Target::Ram(pa) => self.mmu.ram().read_half(pa),
            Target::Mmio(addr) => Ok(self.mmu.ram().mmio_read(addr) as u16),
        }
    }

    fn load_word(&self, va: u32) -> Result<u32, MemFault> {
        match self.resolve(va, 4, VmAccess::Read)? {
            Target::Ram(pa) => self.mmu.ram().read_word(pa),
            Target::Mmio(addr) => Ok(self.mmu.ram().mmio_read(addr)),
        }
    }

    fn fetch_word(&self, va: u32) -> Result<u32, MemFault> {
        match self.resolve(va, 4, VmAccess::Exec)? {
            Target::Ram(pa) => self.mmu.ram().read_word(pa),
            // Executing out of the MMIO window is nonsense; fault it.
            Target::Mmio(_) => Err(MemFault::Protection { va }),
        }
    }

    fn store_byte(&self, va: u32, val: u8) -> Result<(), MemFault> {
        match self.resolve(va, 1, VmAccess::Write)? {
            Target::Ram(pa) => self.mmu.ram().write_byte(pa, val),
            Target::Mmio(addr) => {
                self.mmu.ram().mmio_write(addr, val as u32);
                Ok(())
            }
        }
    }

    fn store_half(&self, va: u32, val: u16) -> Result<(), MemFault> {
        match self.resolve(va, 2, VmAccess::Write)? {
            Target::Ram(pa) => self.mmu.ram().write_half(pa, val),
            Target::Mmio(addr) => {
                self.mmu.ram().mmio_write(addr, val as u32);
                Ok(())
            }
        }
    }

    fn store_word(&self, va: u32, val: u32) -> Result<(), MemFault> {
        match self.resolve(va, 4, VmAccess::Write)? {
            Target::Ram(pa) => self.mmu.ram().write_word(pa, val),
            Target::Mmio(addr) => {
                self.mmu.ram().mmio_write(addr, val);
                Ok(())
            }
        }
    }
}
