pub mod config;
pub mod elf;
pub mod kernel;
pub mod observe;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod wait;

pub use config::KernelConfig;
pub use elf::ElfError;
pub use kernel::{Kernel, KernelError};
pub use task::{Pid, Task, TaskState, TrapFrame, WaitReason};
