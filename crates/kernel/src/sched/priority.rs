use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use crate::sched::{runnable, SchedStats, Scheduler};
use crate::task::{Task, TaskState};

/// Max-heap entry: higher priority first, FIFO among equals (lower sequence
/// number wins).
struct Entry {
    priority: i32,
    seq: u64,
    task: Arc<Task>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Priority scheduling: the most urgent READY task always runs next.
pub struct PriorityScheduler {
    heap: BinaryHeap<Entry>,
    queued: HashSet<i32>,
    next_seq: u64,
    time_slice: usize,
    last_pid: Option<i32>,
    stats: SchedStats,
}

impl PriorityScheduler {
    pub fn new(time_slice: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            queued: HashSet::new(),
            next_seq: 0,
            time_slice,
            last_pid: None,
            stats: SchedStats::default(),
        }
    }
}

impl Scheduler for PriorityScheduler {
    fn schedule(&mut self) -> Option<Arc<Task>> {
        self.stats.total_schedules += 1;
        while let Some(entry) = self.heap.pop() {
            self.queued.remove(&entry.task.pid());
            if let Some(task) = runnable(entry.task) {
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
            let entry = Entry {
                priority: task.priority(),
                seq: self.next_seq,
                task,
            };
            self.next_seq += 1;
            self.heap.push(entry);
        }
    }

    fn remove_task(&mut self, pid: i32) {
        if self.queued.remove(&pid) {
            let drained: Vec<Entry> = self.heap.drain().filter(|e| e.task.pid() != pid).collect();
            self.heap.extend(drained);
        }
        if self.last_pid == Some(pid) {
            self.last_pid = None;
        }
    }

    fn time_slice(&self) -> usize {
        self.time_slice
    }

    fn ready_snapshot(&self) -> Vec<Arc<Task>> {
        let mut entries: Vec<&Entry> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.iter().map(|e| Arc::clone(&e.task)).collect()
    }

    fn stats(&self) -> SchedStats {
        self.stats
    }
}
