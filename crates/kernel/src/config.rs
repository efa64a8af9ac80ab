use std::time::Duration;

/// Kernel-wide tunables. Defaults follow the launcher's stock setup; the
/// machine layer overrides what its command line asks for.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Number of simulated harts (hart 0 is the bootstrap processor).
    pub hart_count: usize,
    /// User stack size for tasks created from an ELF image.
    pub stack_size: u32,
    /// Contiguous mode only: block size reserved per process.
    pub task_memory_bytes: usize,
    /// Whether SYS_DEBUG_PRINT is honoured or treated as unknown.
    pub enable_debug_syscalls: bool,
    /// Cadence of the wakeup/interrupt maintenance loop.
    pub maintenance_interval: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            hart_count: 1,
            stack_size: 0x0010_0000, // 1 MiB
            task_memory_bytes: 0x0040_0000,
            enable_debug_syscalls: true,
            maintenance_interval: Duration::from_millis(10),
        }
    }
}

/// Top of the user stack for freshly created tasks: 4 KiB below 2 GiB,
/// page-aligned.
pub const STACK_TOP: u32 = 0x7fff_f000;

/// Stack mapped by exec for the new image.
pub const EXEC_STACK_SIZE: u32 = 0x2000; // 8 KiB

/// Pages at and above this address never get execute permission.
pub const NX_BOUNDARY: u32 = 0x7fff_fff0;
