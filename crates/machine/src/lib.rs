// Machine assembly
// ----------------
// Builds the simulated computer out of its parts: physical RAM with the
// UART window, one MMU realisation, a scheduler, and the kernel with its
// hart threads. The launcher binary (or a test) chooses the configuration;
// everything after `boot` runs on the kernel's own threads.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use kernel::sched::{CooperativeScheduler, PriorityScheduler, RoundRobinScheduler, Scheduler};
use kernel::task::Task;
use kernel::{Kernel, KernelConfig, TaskState};
use log::info;
use memory::{AllocStrategy, EvictPolicy, FetchPolicy, Mmu, Ram};

/// Which MMU realisation backs the machine.
#[derive(Debug, Clone, Copy)]
pub enum MemoryMode {
    Contiguous { strategy: AllocStrategy },
    Paged { fetch: FetchPolicy, evict: EvictPolicy },
}

/// Which scheduling policy drives the ready queue.
#[derive(Debug, Clone, Copy)]
pub enum SchedulerChoice {
    RoundRobin { time_slice: usize },
    Priority { time_slice: usize },
    Cooperative,
}

#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub ram_bytes: usize,
    pub memory: MemoryMode,
    pub scheduler: SchedulerChoice,
    pub kernel: KernelConfig,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_bytes: 64 * 1024 * 1024,
            memory: MemoryMode::Paged {
                fetch: FetchPolicy::Demand,
                evict: EvictPolicy::Clock,
            },
            scheduler: SchedulerChoice::RoundRobin { time_slice: 1000 },
            kernel: KernelConfig::default(),
        }
    }
}

pub struct Machine {
    kernel: Arc<Kernel>,
    handles: Vec<JoinHandle<()>>,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Self {
        let ram = Arc::new(Ram::new(config.ram_bytes));
        let mmu = Arc::new(match config.memory {
            MemoryMode::Contiguous { strategy } => Mmu::contiguous(ram, strategy),
            MemoryMode::Paged { fetch, evict } => Mmu::paged(ram, fetch, evict),
        });
        let scheduler: Box<dyn Scheduler> = match config.scheduler {
            SchedulerChoice::RoundRobin { time_slice } => {
                Box::new(RoundRobinScheduler::new(time_slice))
            }
            SchedulerChoice::Priority { time_slice } => {
                Box::new(PriorityScheduler::new(time_slice))
            }
            SchedulerChoice::Cooperative => Box::new(CooperativeScheduler::new()),
        };
        let kernel = Kernel::new(mmu, scheduler, config.kernel);
        Self { kernel, handles: Vec::new() }
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Load PID 1 from a host path and start every hart.
    pub fn boot(&mut self, init_elf: &str) -> anyhow::Result<Arc<Task>> {
        let init = self.kernel.create_init(init_elf)?;
        self.start()?;
        Ok(init)
    }

    /// Start hart and maintenance threads without loading a program.
    pub fn start(&mut self) -> anyhow::Result<()> {
        self.handles = self.kernel.start()?;
        info!("machine started with {} hart(s)", self.kernel.config().hart_count);
        Ok(())
    }

    /// Create a task from in-memory ELF bytes.
    pub fn load_task(&self, elf: &[u8], name: &str) -> anyhow::Result<Arc<Task>> {
        Ok(self.kernel.create_task(elf, name)?)
    }

    /// Feed host input to the UART.
    pub fn push_input(&self, data: &str) {
        self.kernel.mmu().ram().uart().push_input(data.as_bytes());
    }

    /// Block until `task` terminates (zombie or reaped), or the timeout
    /// passes. Returns the exit code if it finished.
    pub fn wait_for_exit(&self, task: &Arc<Task>, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if task.state() == TaskState::Terminated {
                return Some(task.exit_code());
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        None
    }

    /// Stop the kernel and join every thread.
    pub fn shutdown(&mut self) {
        self.kernel.stop();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        info!("machine stopped");
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        if self.kernel.is_running() {
            self.shutdown();
        }
    }
}
