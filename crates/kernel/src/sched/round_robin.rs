use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::sched::{runnable, SchedStats, Scheduler};
use crate::task::{Task, TaskState};

/// FIFO scheduling with a fixed instruction-count time slice.
pub struct RoundRobinScheduler {
    ready: VecDeque<Arc<Task>>,
    queued: HashSet<i32>,
    time_slice: usize,
    last_pid: Option<i32>,
    stats: SchedStats,
}

impl RoundRobinScheduler {
    pub fn new(time_slice: usize) -> Self {
        Self {
            ready: VecDeque::new(),
            queued: HashSet::new(),
            time_slice,
            last_pid: None,
            stats: SchedStats::default(),
        }
    }
}

impl Scheduler for RoundRobinScheduler {
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
        self.time_slice
    }

    fn ready_snapshot(&self) -> Vec<Arc<Task>> {
        self.ready.iter().cloned().collect()
    }

    fn stats(&self) -> SchedStats {
        self.stats
    }
}
