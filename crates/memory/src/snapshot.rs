//! Read-only views of memory state for the observation surface. Safe to
//! request from any thread; each call copies under the subsystem lock.

/// Ownership of one physical frame as shown to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOwnerView {
    Free,
    Data { pid: i32, vpn: u32 },
    PageTable,
    Shared { key: i32 },
}

/// Snapshot of the active memory mode.
#[derive(Debug, Clone)]
pub enum MemorySnapshot {
    Contiguous {
        total_bytes: usize,
        /// Free holes as (start, size).
        holes: Vec<(usize, usize)>,
        /// Allocated blocks as (pid, start, size).
        blocks: Vec<(i32, usize, usize)>,
    },
    Paged {
        total_frames: usize,
        owners: Vec<FrameOwnerView>,
    },
}
