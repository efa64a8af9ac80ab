// Task model
// ----------
// A task is one schedulable unit: a process (own address space) or a thread
// (leader's address space, leader's TGID). Identity is a monotonically
// assigned positive PID. The parent link is weak and children are owning
// references held by the parent; a zombie is reclaimed when its parent's
// wait observes the exit, which drops the owning reference and breaks the
// cycle without leaking.
//
// Scheduling state is atomic so harts, the maintenance loop, and observers
// never take a lock just to read it; the saved register frame has its own
// mutex and is only touched by whichever hart holds the CPU.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use core::fmt;
use memory::SpaceId;
use parking_lot::Mutex;
use rv32::registers::SP;

pub type Pid = i32;

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Ready = 0,
    Running = 1,
    Waiting = 2,
    Terminated = 3,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::Ready,
            1 => TaskState::Running,
            2 => TaskState::Waiting,
            _ => TaskState::Terminated,
        }
    }
}

/// Why a WAITING task is parked, which selects its wait queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WaitReason {
    None = 0,
    UartInput = 1,
    Timer = 2,
    ProcessExit = 3,
    Generic = 4,
}

impl WaitReason {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => WaitReason::UartInput,
            2 => WaitReason::Timer,
            3 => WaitReason::ProcessExit,
            4 => WaitReason::Generic,
            _ => WaitReason::None,
        }
    }
}

/// Saved user-visible register state (x0-x31 plus PC).
#[derive(Clone, Copy)]
pub struct TrapFrame {
    pub regs: [u32; 32],
    pub pc: u32,
}

impl Default for TrapFrame {
    fn default() -> Self {
        Self { regs: [0; 32], pc: 0 }
    }
}

impl fmt::Debug for TrapFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrapFrame")
            .field("pc", &format_args!("0x{:08x}", self.pc))
            .finish()
    }
}

const NO_HART: i32 = -1;

pub struct Task {
    pid: Pid,
    name: Mutex<String>,
    tgid: Pid,

    parent: Mutex<Weak<Task>>,
    children: Mutex<Vec<Arc<Task>>>,

    frame: Mutex<TrapFrame>,
    stack_base: AtomicU32,
    stack_size: AtomicU32,

    state: AtomicU8,
    wait_reason: AtomicU8,
    waiting_for_pid: AtomicI32,
    wakeup_at_ms: AtomicU64,
    exit_code: AtomicI32,
    priority: AtomicI32,

    /// Hart currently executing this task, NO_HART when none. Guarded by
    /// compare-and-swap so two harts can never both win the task.
    active_hart: AtomicI32,

    space: AtomicU32,
}

impl Task {
    pub fn new(pid: Pid, name: &str, entry: u32, space: SpaceId, stack_base: u32, stack_size: u32) -> Arc<Self> {
        let mut frame = TrapFrame::default();
        frame.pc = entry;
        // sp starts 16-byte aligned just under the stack top.
        frame.regs[SP] = (stack_base.wrapping_add(stack_size)).wrapping_sub(16) & !0xf;
        Arc::new(Self {
            pid,
            name: Mutex::new(name.to_string()),
            tgid: pid,
            parent: Mutex::new(Weak::new()),
            children: Mutex::new(Vec::new()),
            frame: Mutex::new(frame),
            stack_base: AtomicU32::new(stack_base),
            stack_size: AtomicU32::new(stack_size),
            state: AtomicU8::new(TaskState::Ready as u8),
            wait_reason: AtomicU8::new(WaitReason::None as u8),
            waiting_for_pid: AtomicI32::new(-1),
            wakeup_at_ms: AtomicU64::new(0),
            exit_code: AtomicI32::new(0),
            priority: AtomicI32::new(0),
            active_hart: AtomicI32::new(NO_HART),
            space: AtomicU32::new(space.0),
        })
    }

    /// Build a thread inside `leader`'s group: shares the address space and
    /// TGID, owns its registers and stack.
    pub fn new_thread(leader: &Arc<Task>, pid: Pid, entry: u32, stack_base: u32, stack_size: u32) -> Arc<Self> {
        assert!(leader.is_group_leader(), "only a thread-group leader may spawn threads");
        let mut frame = TrapFrame::default();
        frame.pc = entry;
        frame.regs[SP] = (stack_base.wrapping_add(stack_size)).wrapping_sub(16) & !0xf;
        let thread = Arc::new(Self {
            pid,
            name: Mutex::new(format!("{}:{}", leader.name(), pid)),
            tgid: leader.tgid,
            parent: Mutex::new(Arc::downgrade(leader)),
            children: Mutex::new(Vec::new()),
            frame: Mutex::new(frame),
            stack_base: AtomicU32::new(stack_base),
            stack_size: AtomicU32::new(stack_size),
            state: AtomicU8::new(TaskState::Ready as u8),
            wait_reason: AtomicU8::new(WaitReason::None as u8),
            waiting_for_pid: AtomicI32::new(-1),
            wakeup_at_ms: AtomicU64::new(0),
            exit_code: AtomicI32::new(0),
            priority: AtomicI32::new(leader.priority()),
            active_hart: AtomicI32::new(NO_HART),
            space: AtomicU32::new(leader.space().0),
        });
        leader.add_child(Arc::clone(&thread));
        thread
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn tgid(&self) -> Pid {
        self.tgid
    }

    pub fn is_group_leader(&self) -> bool {
        self.tgid == self.pid
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock() = name.to_string();
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn wait_reason(&self) -> WaitReason {
        WaitReason::from_u8(self.wait_reason.load(Ordering::SeqCst))
    }

    /// Park this task: WAITING with the given reason.
    pub fn wait_for(&self, reason: WaitReason) {
        self.wait_reason.store(reason as u8, Ordering::SeqCst);
        self.set_state(TaskState::Waiting);
    }

    /// Park until `wakeup_at_ms` (wall-clock milliseconds).
    pub fn wait_until(&self, wakeup_at_ms: u64) {
        self.wakeup_at_ms.store(wakeup_at_ms, Ordering::SeqCst);
        self.wait_for(WaitReason::Timer);
    }

    /// Park waiting for a child exit; -1 means any child.
    pub fn wait_for_child(&self, pid: Pid) {
        self.waiting_for_pid.store(pid, Ordering::SeqCst);
        self.wait_for(WaitReason::ProcessExit);
    }

    /// Unpark: WAITING -> READY with the reason cleared.
    pub fn wakeup(&self) {
        self.wait_reason.store(WaitReason::None as u8, Ordering::SeqCst);
        self.waiting_for_pid.store(-1, Ordering::SeqCst);
        self.set_state(TaskState::Ready);
    }

    pub fn waiting_for_pid(&self) -> Pid {
        self.waiting_for_pid.load(Ordering::SeqCst)
    }

    pub fn wakeup_at_ms(&self) -> u64 {
        self.wakeup_at_ms.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::SeqCst)
    }

    pub fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::SeqCst);
    }

    pub fn space(&self) -> SpaceId {
        SpaceId(self.space.load(Ordering::SeqCst))
    }

    pub fn set_space(&self, space: SpaceId) {
        self.space.store(space.0, Ordering::SeqCst);
    }

    pub fn stack_base(&self) -> u32 {
        self.stack_base.load(Ordering::SeqCst)
    }

    pub fn stack_size(&self) -> u32 {
        self.stack_size.load(Ordering::SeqCst)
    }

    pub fn set_stack(&self, base: u32, size: u32) {
        self.stack_base.store(base, Ordering::SeqCst);
        self.stack_size.store(size, Ordering::SeqCst);
    }

    pub fn frame(&self) -> TrapFrame {
        *self.frame.lock()
    }

    pub fn set_frame(&self, frame: TrapFrame) {
        *self.frame.lock() = frame;
    }

    pub fn with_frame<R>(&self, f: impl FnOnce(&mut TrapFrame) -> R) -> R {
        f(&mut self.frame.lock())
    }

    /// Claim the CPU for `hart_id`. At most one hart can ever hold a task;
    /// the scheduler contract makes a failed claim a kernel bug.
    pub fn try_acquire_cpu(&self, hart_id: i32) -> bool {
        self.active_hart
            .compare_exchange(NO_HART, hart_id, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Claim the CPU or die: a second hart winning the same task means the
    /// ready queue handed it out twice.
    pub fn acquire_cpu(&self, hart_id: i32) {
        if !self.try_acquire_cpu(hart_id) {
            panic!(
                "double schedule: task {} already on hart {}, claimed by hart {}",
                self.pid,
                self.active_hart.load(Ordering::SeqCst),
                hart_id
            );
        }
    }

    pub fn release_cpu(&self) {
        self.active_hart.store(NO_HART, Ordering::SeqCst);
    }

    pub fn active_hart(&self) -> i32 {
        self.active_hart.load(Ordering::SeqCst)
    }

    pub fn set_parent(self: &Arc<Self>, parent: &Arc<Task>) {
        *self.parent.lock() = Arc::downgrade(parent);
    }

    pub fn parent(&self) -> Option<Arc<Task>> {
        self.parent.lock().upgrade()
    }

    pub fn add_child(&self, child: Arc<Task>) {
        self.children.lock().push(child);
    }

    pub fn remove_child(&self, pid: Pid) -> Option<Arc<Task>> {
        let mut children = self.children.lock();
        let i = children.iter().position(|c| c.pid() == pid)?;
        Some(children.remove(i))
    }

    pub fn children(&self) -> Vec<Arc<Task>> {
        self.children.lock().clone()
    }

    pub fn has_children(&self) -> bool {
        !self.children.lock().is_empty()
    }

    /// First zombie child, if any.
    pub fn zombie_child(&self) -> Option<Arc<Task>> {
        self.children
            .lock()
            .iter()
            .find(|c| c.state() == TaskState::Terminated)
            .cloned()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("pid", &self.pid)
            .field("name", &self.name.lock())
            .field("state", &self.state())
            .finish()
    }
}
