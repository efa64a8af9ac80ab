pub mod contiguous;
pub mod mmu;
pub mod paging;
pub mod ram;
pub mod snapshot;
pub mod uart;

pub use contiguous::AllocStrategy;
pub use mmu::{AddressContext, Mmu, Perms, SpaceId};
pub use paging::policy::{EvictPolicy, FetchPolicy};
pub use ram::{Ram, UART_BASE, UART_RX_DATA, UART_SIZE, UART_STATUS, UART_TX_DATA};
pub use snapshot::{FrameOwnerView, MemorySnapshot};

/// Kind of virtual access being performed, used for permission checks and
/// for choosing default permissions when a page is demand-allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmAccess {
    Read,
    Write,
    Exec,
}
