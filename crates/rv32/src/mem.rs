use thiserror::Error;

/// Fault raised by the memory interface when a virtual access cannot be
/// satisfied. The hart converts these into a task-level trap; system calls
/// surface them as negative return values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemFault {
    #[error("unmapped virtual address 0x{va:08x}")]
    Unmapped { va: u32 },

    #[error("segmentation fault: 0x{va:08x} beyond limit 0x{limit:08x}")]
    Segfault { va: u32, limit: u32 },

    #[error("protection fault at 0x{va:08x}")]
    Protection { va: u32 },

    #[error("misaligned {size}-byte access at 0x{va:08x}")]
    Misaligned { va: u32, size: u32 },

    #[error("physical address 0x{pa:08x} out of range")]
    OutOfRange { pa: u32 },

    #[error("out of physical memory")]
    OutOfMemory,
}

/// The memory contract the hart executes against. Implementations own all
/// translation, permission checks, and paging side effects; the CPU never
/// sees physical addresses.
///
/// All accesses are little-endian. Halfword and word accesses must be
/// naturally aligned; implementations fault otherwise.
pub trait Memory {
    fn load_byte(&self, va: u32) -> Result<u8, MemFault>;
    fn load_half(&self, va: u32) -> Result<u16, MemFault>;
    fn load_word(&self, va: u32) -> Result<u32, MemFault>;

    /// Instruction fetch: a word load checked with execute permission.
    fn fetch_word(&self, va: u32) -> Result<u32, MemFault>;

    fn store_byte(&self, va: u32, val: u8) -> Result<(), MemFault>;
    fn store_half(&self, va: u32, val: u16) -> Result<(), MemFault>;
    fn store_word(&self, va: u32, val: u32) -> Result<(), MemFault>;
}
