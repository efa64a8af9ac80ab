//! Observation surface: read-only snapshots for a visualiser or test
//! harness. Everything copies under the owning lock and is safe to call
//! from any thread.

use std::sync::Arc;

use crate::kernel::Kernel;
use crate::task::{Pid, Task, TaskState, WaitReason};

/// One task as shown to observers.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub pid: Pid,
    pub tgid: Pid,
    pub name: String,
    pub state: TaskState,
    pub wait_reason: WaitReason,
    pub priority: i32,
    pub exit_code: i32,
    pub parent: Option<Pid>,
    pub active_hart: i32,
}

impl TaskSnapshot {
    pub fn of(task: &Arc<Task>) -> Self {
        Self {
            pid: task.pid(),
            tgid: task.tgid(),
            name: task.name(),
            state: task.state(),
            wait_reason: task.wait_reason(),
            priority: task.priority(),
            exit_code: task.exit_code(),
            parent: task.parent().map(|p| p.pid()),
            active_hart: task.active_hart(),
        }
    }
}

/// Per-hart view: current task, PC, and a register copy.
#[derive(Debug, Clone)]
pub struct HartSnapshot {
    pub hart: usize,
    pub pid: Pid,
    pub pc: u32,
    pub regs: [u32; 32],
}

/// Task-count rollup.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelStats {
    pub total: usize,
    pub running: usize,
    pub ready: usize,
    pub waiting: usize,
    pub terminated: usize,
}

impl Kernel {
    pub fn tasks_snapshot(&self) -> Vec<TaskSnapshot> {
        let mut tasks: Vec<TaskSnapshot> =
            self.all_tasks().iter().map(TaskSnapshot::of).collect();
        tasks.sort_by_key(|t| t.pid);
        tasks
    }

    pub fn hart_snapshot(&self, hart: usize) -> Option<HartSnapshot> {
        let seat = self.hart_seat(hart)?;
        let (pid, pc, regs) = seat.view();
        Some(HartSnapshot { hart, pid, pc, regs })
    }

    pub fn stats(&self) -> KernelStats {
        let mut stats = KernelStats::default();
        for task in self.all_tasks() {
            stats.total += 1;
            match task.state() {
                TaskState::Running => stats.running += 1,
                TaskState::Ready => stats.ready += 1,
                TaskState::Waiting => stats.waiting += 1,
                TaskState::Terminated => stats.terminated += 1,
            }
        }
        stats
    }
}
