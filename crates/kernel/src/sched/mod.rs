//! Scheduler contract and the three concrete policies.
//!
//! All mutation happens under the kernel's scheduler spinlock, so the
//! implementations themselves are plain single-threaded structures. Each
//! keeps a membership set besides its queue: `add_task` is idempotent and a
//! task can never be enqueued twice (a duplicate pop is what turns into a
//! double-schedule panic downstream).

mod cooperative;
mod priority;
mod round_robin;

pub use cooperative::CooperativeScheduler;
pub use priority::PriorityScheduler;
pub use round_robin::RoundRobinScheduler;

use std::sync::Arc;

use crate::task::{Task, TaskState};

/// Counters for the observation surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedStats {
    pub total_schedules: u64,
    pub context_switches: u64,
}

pub trait Scheduler: Send {
    /// Pop the next runnable task, or None when the ready set is empty.
    /// Tasks that terminated while queued are discarded here, never
    /// returned.
    fn schedule(&mut self) -> Option<Arc<Task>>;

    /// Insert a READY task; a no-op if it is already queued.
    fn add_task(&mut self, task: Arc<Task>);

    /// Drop a task from the ready set; a no-op if absent.
    fn remove_task(&mut self, pid: i32);

    /// Instructions a task may run before forced preemption.
    fn time_slice(&self) -> usize;

    /// Copy of the ready set for observers.
    fn ready_snapshot(&self) -> Vec<Arc<Task>>;

    fn stats(&self) -> SchedStats;
}

/// Shared helper: skip zombies when popping (a terminated task must never
/// reach a hart again).
fn runnable(task: Arc<Task>) -> Option<Arc<Task>> {
    (task.state() != TaskState::Terminated).then_some(task)
}
