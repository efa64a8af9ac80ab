// Kernel: per-hart dispatch and lifecycle
// ---------------------------------------
// Each simulated hart is one OS thread running schedule -> acquire ->
// execute -> release -> dispatch. Hart 0 is the bootstrap processor; the
// application processors spin on the `started` flag until it finishes
// coming up. A separate maintenance thread wakes UART readers and expired
// sleepers on a fixed cadence.
//
// The scheduler sits behind a panic-on-misuse spinlock; the master task
// table, wait queues, and memory subsystem carry their own locks. A task's
// CPU ownership is claimed by compare-and-swap before execution - if the
// ready queue ever hands the same task to two harts, the second claim is a
// kernel bug and the process dies loudly rather than corrupting register
// state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, info};
use memory::{Mmu, Perms};
use parking_lot::Mutex;
use rv32::Cpu;
use thiserror::Error;

use crate::config::{KernelConfig, STACK_TOP};
use crate::elf::{ElfError, ElfImage};
use crate::sched::Scheduler;
use crate::sync::SpinLock;
use crate::syscall;
use crate::task::{Pid, Task, TaskState, TrapFrame, WaitReason};
use crate::wait::WaitQueues;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Elf(#[from] ElfError),

    #[error(transparent)]
    Mem(#[from] rv32::MemFault),

    #[error("failed to read program: {0}")]
    Io(#[from] std::io::Error),

    #[error("kernel is already running")]
    AlreadyRunning,
}

/// Wall-clock milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_millis() as u64
}

/// Per-hart observation seat, refreshed at every state save.
pub struct HartSeat {
    pid: AtomicI32,
    pc: AtomicU32,
    regs: Mutex<[u32; 32]>,
}

impl HartSeat {
    fn new() -> Self {
        Self {
            pid: AtomicI32::new(-1),
            pc: AtomicU32::new(0),
            regs: Mutex::new([0; 32]),
        }
    }

    fn update(&self, pid: Pid, frame: &TrapFrame) {
        self.pid.store(pid, Ordering::SeqCst);
        self.pc.store(frame.pc, Ordering::SeqCst);
        *self.regs.lock() = frame.regs;
    }

    pub fn view(&self) -> (Pid, u32, [u32; 32]) {
        (
            self.pid.load(Ordering::SeqCst),
            self.pc.load(Ordering::SeqCst),
            *self.regs.lock(),
        )
    }
}

pub struct Kernel {
    mmu: Arc<Mmu>,
    config: KernelConfig,

    scheduler: SpinLock<Box<dyn Scheduler>>,
    waits: WaitQueues,
    tasks: Mutex<HashMap<Pid, Arc<Task>>>,
    next_pid: AtomicI32,

    running: AtomicBool,
    paused: AtomicBool,
    delay_ms: AtomicU64,
    started: AtomicBool,

    harts: Vec<HartSeat>,
}

impl Kernel {
    pub fn new(mmu: Arc<Mmu>, scheduler: Box<dyn Scheduler>, config: KernelConfig) -> Arc<Self> {
        let harts = (0..config.hart_count).map(|_| HartSeat::new()).collect();
        info!(
            "kernel initialised: {} hart(s), {} bytes RAM",
            config.hart_count,
            mmu.ram().len()
        );
        Arc::new(Self {
            mmu,
            config,
            scheduler: SpinLock::new("scheduler", scheduler),
            waits: WaitQueues::new(),
            tasks: Mutex::new(HashMap::new()),
            next_pid: AtomicI32::new(1),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            started: AtomicBool::new(false),
            harts,
        })
    }

    pub fn mmu(&self) -> &Arc<Mmu> {
        &self.mmu
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn alloc_pid(&self) -> Pid {
        self.next_pid.fetch_add(1, Ordering::SeqCst)
    }

    // ---- Task lifecycle ----

    /// Create a process from an in-memory ELF image and enqueue it.
    pub fn create_task(&self, elf_bytes: &[u8], name: &str) -> Result<Arc<Task>, KernelError> {
        self.create_task_with_priority(elf_bytes, name, 0)
    }

    /// As `create_task`, with a scheduling priority fixed before the task
    /// first enters the ready queue.
    pub fn create_task_with_priority(
        &self,
        elf_bytes: &[u8],
        name: &str,
        priority: i32,
    ) -> Result<Arc<Task>, KernelError> {
        let pid = self.alloc_pid();
        let image = ElfImage::parse(elf_bytes)?;
        let space = self.mmu.create_space(pid, self.config.task_memory_bytes)?;

        let (stack_base, stack_size) = self.stack_layout();
        let result: Result<u32, KernelError> = (|| {
            self.mmu
                .map_region(space, stack_base, stack_size as usize, Perms::rw())?;
            Ok(image.load(&self.mmu, space, elf_bytes)?)
        })();
        let entry = match result {
            Ok(entry) => entry,
            Err(e) => {
                self.mmu.destroy_space(space);
                return Err(e);
            }
        };

        let task = Task::new(pid, name, entry, space, stack_base, stack_size);
        task.set_priority(priority);
        self.register(Arc::clone(&task));
        info!("created task {} ({}) entry=0x{:08x}", pid, name, entry);
        Ok(task)
    }

    /// Create PID 1 from a host path.
    pub fn create_init(&self, path: &str) -> Result<Arc<Task>, KernelError> {
        let bytes = std::fs::read(path)?;
        let task = self.create_task(&bytes, "init")?;
        Ok(task)
    }

    /// Spawn a thread in `leader`'s group with its own stack carved below
    /// the process stack.
    pub fn spawn_thread(&self, leader: &Arc<Task>, entry: u32) -> Result<Arc<Task>, KernelError> {
        let pid = self.alloc_pid();
        let size = 0x4000u32; // 16 KiB per thread
        let index = leader.children().len() as u32 + 1;
        let base = leader.stack_base() - index * size;
        self.mmu
            .map_region(leader.space(), base, size as usize, Perms::rw())?;
        let thread = Task::new_thread(leader, pid, entry, base, size);
        self.register(Arc::clone(&thread));
        info!("created thread {} in group {}", pid, leader.tgid());
        Ok(thread)
    }

    fn stack_layout(&self) -> (u32, u32) {
        let size = self.config.stack_size;
        match &*self.mmu {
            // Paged: fixed high stack growing down from just under 2 GiB.
            Mmu::Paged(_) => (STACK_TOP - size, size),
            // Contiguous: the stack lives at the top of the process block.
            Mmu::Contiguous(_) => {
                let block = self.config.task_memory_bytes as u32;
                (block.saturating_sub(size), size.min(block))
            }
        }
    }

    /// Put a freshly built task on the books and in the ready queue.
    pub(crate) fn register(&self, task: Arc<Task>) {
        self.tasks.lock().insert(task.pid(), Arc::clone(&task));
        self.scheduler.acquire().add_task(task);
    }

    /// Forcibly end a task from outside. A task currently on a hart
    /// observes the state change at its next instruction boundary.
    pub fn terminate_task(&self, pid: Pid) {
        let Some(task) = self.task(pid) else { return };
        task.set_exit_code(-1);
        task.set_state(TaskState::Terminated);
        self.scheduler.acquire().remove_task(pid);
        self.waits.purge(pid);
        if task.active_hart() < 0 {
            self.handle_termination(&task);
        }
        info!("terminated task {} externally", pid);
    }

    /// Drop a consumed zombie: out of the table, address space released.
    /// Threads never own their space, so only group leaders release it.
    pub(crate) fn reap(&self, zombie: &Arc<Task>) {
        self.tasks.lock().remove(&zombie.pid());
        if zombie.is_group_leader() {
            self.mmu.destroy_space(zombie.space());
        }
        debug!("reaped zombie {}", zombie.pid());
    }

    pub fn task(&self, pid: Pid) -> Option<Arc<Task>> {
        self.tasks.lock().get(&pid).cloned()
    }

    pub fn all_tasks(&self) -> Vec<Arc<Task>> {
        self.tasks.lock().values().cloned().collect()
    }

    // ---- Hart run loop ----

    pub fn run_hart(self: &Arc<Self>, hart_id: usize) {
        if hart_id == 0 {
            info!("hart 0 (BSP) online");
            self.started.store(true, Ordering::SeqCst);
        } else {
            // APs hold at the gate until the BSP finishes coming up.
            while self.is_running() && !self.started.load(Ordering::SeqCst) {
                std::hint::spin_loop();
                std::thread::sleep(Duration::from_micros(100));
            }
            info!("hart {} (AP) online", hart_id);
        }

        while self.is_running() {
            while self.paused.load(Ordering::SeqCst) && self.is_running() {
                std::thread::sleep(Duration::from_millis(5));
            }
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                std::thread::sleep(Duration::from_millis(delay));
            }

            let task = self.scheduler.acquire().schedule();
            let Some(task) = task else {
                // Idle: nothing runnable.
                std::thread::sleep(Duration::from_millis(1));
                continue;
            };

            // The ready queue guarantees at-most-once handout; a failed
            // claim here means it did not, and that is fatal by design.
            task.acquire_cpu(hart_id as i32);
            self.execute(hart_id, &task);
            task.release_cpu();
            self.dispatch(task);
        }
        debug!("hart {} offline", hart_id);
    }

    /// Run one time slice of `task` on this hart.
    fn execute(self: &Arc<Self>, hart_id: usize, task: &Arc<Task>) {
        let space = task.space();
        self.mmu.switch_context(space);
        let ctx = self.mmu.context(space);

        let mut cpu = Cpu::new();
        let frame = task.frame();
        cpu.regs = frame.regs;
        cpu.pc = frame.pc;

        task.set_state(TaskState::Running);
        let slice = self.scheduler.acquire().time_slice();
        let mut executed = 0usize;
        let mut handled_by_syscall = false;

        while executed < slice && task.state() == TaskState::Running {
            cpu.step(&ctx);
            executed += 1;

            if cpu.take_ecall() {
                // Save first: fork and wait read the trapping frame.
                Self::save_state(task, &cpu);
                syscall::dispatch(self, task, &ctx);
                handled_by_syscall = true;
                break;
            }

            if let Some(cause) = cpu.take_exception() {
                Self::save_state(task, &cpu);
                error!(
                    "task {} trapped at 0x{:08x}: {:?}; terminating",
                    task.pid(),
                    cpu.pc,
                    cause
                );
                task.set_exit_code(-1);
                task.set_state(TaskState::Terminated);
                break;
            }
        }

        // A syscall already saved state (and may have rewritten the PC, as
        // exec does); do not clobber its edits.
        if !handled_by_syscall {
            Self::save_state(task, &cpu);
        }
        if task.state() == TaskState::Running {
            task.set_state(TaskState::Ready);
        }
        self.harts[hart_id].update(task.pid(), &task.frame());
    }

    fn save_state(task: &Arc<Task>, cpu: &Cpu) {
        task.set_frame(TrapFrame { regs: cpu.regs, pc: cpu.pc });
    }

    /// Route a task that just left a hart to wherever it belongs next.
    fn dispatch(&self, task: Arc<Task>) {
        match task.state() {
            TaskState::Ready | TaskState::Running => {
                task.set_state(TaskState::Ready);
                self.scheduler.acquire().add_task(task);
            }
            TaskState::Waiting => self.park(task),
            TaskState::Terminated => self.handle_termination(&task),
        }
    }

    fn park(&self, task: Arc<Task>) {
        match task.wait_reason() {
            WaitReason::UartInput => self.waits.park_io(task),
            WaitReason::Timer => self.waits.park_sleep(task),
            WaitReason::ProcessExit => {
                // A child may already have exited between the syscall and
                // this parking attempt; waking immediately closes the race.
                let target = task.waiting_for_pid();
                let already_done = if target >= 0 {
                    self.task(target)
                        .map(|c| c.state() == TaskState::Terminated)
                        .unwrap_or(true)
                } else {
                    task.zombie_child().is_some()
                };
                if already_done {
                    task.wakeup();
                    self.scheduler.acquire().add_task(task);
                } else if target >= 0 {
                    self.waits.park_child_wait(target, task);
                } else {
                    self.waits.park_io(task);
                }
            }
            _ => self.waits.park_io(task),
        }
    }

    /// A task reached TERMINATED on this hart: pull it from scheduling,
    /// wake a waiting parent, and leave the zombie for wait() to consume.
    fn handle_termination(&self, task: &Arc<Task>) {
        let pid = task.pid();
        self.scheduler.acquire().remove_task(pid);

        let mut parent = self.waits.take_child_waiter(pid);
        if parent.is_none() {
            if let Some(p) = task.parent() {
                if p.state() == TaskState::Waiting
                    && p.wait_reason() == WaitReason::ProcessExit
                    && p.waiting_for_pid() == -1
                {
                    // Only wake a parent we actually hold parked; one that
                    // has not reached its queue yet finds the zombie when
                    // it parks.
                    parent = self.waits.remove_io(p.pid());
                }
            }
        }

        match parent {
            Some(p) => {
                p.wakeup();
                self.scheduler.acquire().add_task(Arc::clone(&p));
                info!("zombie task {} woke parent {}", pid, p.pid());
            }
            None => info!("task {} became a zombie (parent not waiting)", pid),
        }
    }

    // ---- Maintenance ----

    /// Wake UART readers and expired sleepers; runs on its own thread.
    pub fn run_maintenance(&self) {
        while self.is_running() {
            std::thread::sleep(self.config.maintenance_interval);

            if self.mmu.ram().uart().status() & 1 != 0 {
                for t in self.waits.drain_uart_waiters() {
                    t.wakeup();
                    self.scheduler.acquire().add_task(Arc::clone(&t));
                    debug!("woke task {} (uart)", t.pid());
                }
            }

            for t in self.waits.pop_due(now_ms()) {
                t.wakeup();
                self.scheduler.acquire().add_task(Arc::clone(&t));
                debug!("woke task {} (timer)", t.pid());
            }
        }
    }

    // ---- Boot / control ----

    /// Bring the machine up: maintenance thread plus one thread per hart.
    pub fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>, KernelError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(KernelError::AlreadyRunning);
        }
        let mut handles = Vec::new();

        let maint = Arc::clone(self);
        handles.push(
            std::thread::Builder::new()
                .name("maintenance".into())
                .spawn(move || maint.run_maintenance())
                .expect("spawn maintenance thread"),
        );

        for hart_id in 0..self.config.hart_count {
            let kernel = Arc::clone(self);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("hart{hart_id}"))
                    .spawn(move || kernel.run_hart(hart_id))
                    .expect("spawn hart thread"),
            );
        }
        Ok(handles)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Throttle: sleep this long at the top of every hart loop.
    pub fn set_delay_ms(&self, delay: u64) {
        self.delay_ms.store(delay, Ordering::SeqCst);
    }

    // ---- Observation ----

    pub fn hart_seat(&self, hart_id: usize) -> Option<&HartSeat> {
        self.harts.get(hart_id)
    }

    pub fn ready_snapshot(&self) -> Vec<Arc<Task>> {
        self.scheduler.acquire().ready_snapshot()
    }

    pub fn sched_stats(&self) -> crate::sched::SchedStats {
        self.scheduler.acquire().stats()
    }

    pub fn io_wait_snapshot(&self) -> Vec<Arc<Task>> {
        self.waits.io_snapshot()
    }

    pub fn sleep_wait_snapshot(&self) -> Vec<(Pid, u64)> {
        self.waits.sleep_snapshot()
    }

    pub fn memory_snapshot(&self) -> memory::MemorySnapshot {
        self.mmu.snapshot()
    }

    #[doc(hidden)]
    pub fn scheduler_for_tests(&self) -> &SpinLock<Box<dyn Scheduler>> {
        &self.scheduler
    }
}
