use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::sched::{runnable, SchedStats, Scheduler};
use crate::task::{Task, TaskState};

/// Run-to-block scheduling: FIFO order with an unbounded time slice, so a
/// task keeps its hart until it yields, waits, or exits.
pub struct CooperativeScheduler {
    ready: VecDeque<Arc<Task>>,
    queued: HashSet<i32>,
    last_pid: Option<i32>,
    stats: SchedStats,
}

impl CooperativeScheduler {
    pub fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            queued: HashSet::new(),
            last_pid: None,
            stats: SchedStats::default(),
        }
    }
}

impl Default for CooperativeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for CooperativeScheduler {
    fn schedule(&mut self) -> Option<Arc<Task>> {
        self.stats.total_schedules += 1;
        while let Some(task) = self.ready.pop_front() {
            self.queued.remove(&task.pid());
            if let Some(task) = runnable(task) {
                if self.last_pid != Some(task.pid()) {
                    self.stats.context_switches += 1;
                    self.last_pid = Some(task.pid());
                }
                return Some(task);
            }
        }
        None
    }

    fn add_task(&mut self, task: Arc<Task>) {
        if task.state() != TaskState::Ready {
            return;
        }
        if self.queued.insert(task.pid()) {
            self.ready.push_back(task);
        }
    }

    fn remove_task(&mut self, pid: i32) {
        if self.queued.remove(&pid) {
            self.ready.retain(|t| t.pid() != pid);
        }
        if self.last_pid == Some(pid) {
            self.last_pid = None;
        }
    }

    fn time_slice(&self) -> usize {
        usize::MAX
    }

    fn ready_snapshot(&self) -> Vec<Arc<Task>> {
        self.ready.iter().cloned().collect()
    }

    fn stats(&self) -> SchedStats {
        self.stats
    }
}
