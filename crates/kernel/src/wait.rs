// Wait queues
// -----------
// Three parking places for WAITING tasks, matching the three wakeup
// sources:
//   - an I/O FIFO for UART readers (and the generic "wait for any child"
//     parking spot, which the termination path scans),
//   - a min-heap keyed by wakeup time for sleepers,
//   - a child-PID -> parent map for waits on a specific child.
// The maintenance loop drains the first two; exits drive the third.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::task::{Pid, Task, WaitReason};

/// Heap key: earliest wakeup first, FIFO among identical deadlines.
#[derive(Clone)]
struct SleepEntry {
    wake_at_ms: u64,
    seq: u64,
    task: Arc<Task>,
}

impl PartialEq for SleepEntry {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at_ms == other.wake_at_ms && self.seq == other.seq
    }
}
impl Eq for SleepEntry {}
impl PartialOrd for SleepEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SleepEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.wake_at_ms, self.seq).cmp(&(other.wake_at_ms, other.seq))
    }
}

#[derive(Default)]
pub struct WaitQueues {
    io: Mutex<VecDeque<Arc<Task>>>,
    sleep: Mutex<BinaryHeap<Reverse<SleepEntry>>>,
    child_exit: Mutex<HashMap<Pid, Arc<Task>>>,
    sleep_seq: Mutex<u64>,
}

impl WaitQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park on the I/O queue (UART readers and generic waiters).
    pub fn park_io(&self, task: Arc<Task>) {
        self.io.lock().push_back(task);
    }

    /// Park on the sleep heap until the task's recorded wakeup time.
    pub fn park_sleep(&self, task: Arc<Task>) {
        let mut seq = self.sleep_seq.lock();
        let entry = SleepEntry {
            wake_at_ms: task.wakeup_at_ms(),
            seq: *seq,
            task,
        };
        *seq += 1;
        self.sleep.lock().push(Reverse(entry));
    }

    /// Park a parent waiting for one specific child.
    pub fn park_child_wait(&self, child_pid: Pid, parent: Arc<Task>) {
        self.child_exit.lock().insert(child_pid, parent);
    }

    /// Take the parent parked on `child_pid`, if any.
    pub fn take_child_waiter(&self, child_pid: Pid) -> Option<Arc<Task>> {
        self.child_exit.lock().remove(&child_pid)
    }

    /// Remove and return every UART waiter (the UART wakes all readers;
    /// whoever runs first consumes the byte, the rest re-block).
    pub fn drain_uart_waiters(&self) -> Vec<Arc<Task>> {
        let mut io = self.io.lock();
        let mut woken = Vec::new();
        io.retain(|t| {
            if t.wait_reason() == WaitReason::UartInput {
                woken.push(Arc::clone(t));
                false
            } else {
                true
            }
        });
        woken
    }

    /// Remove a specific task from the generic I/O queue.
    pub fn remove_io(&self, pid: Pid) -> Option<Arc<Task>> {
        let mut io = self.io.lock();
        let i = io.iter().position(|t| t.pid() == pid)?;
        io.remove(i)
    }

    /// Pop every sleeper whose deadline has passed, earliest first.
    pub fn pop_due(&self, now_ms: u64) -> Vec<Arc<Task>> {
        let mut sleep = self.sleep.lock();
        let mut due = Vec::new();
        while let Some(Reverse(head)) = sleep.peek() {
            if head.wake_at_ms > now_ms {
                break;
            }
            let Reverse(entry) = sleep.pop().expect("peeked entry");
            due.push(entry.task);
        }
        due
    }

    /// Drop `pid` from every queue (external termination).
    pub fn purge(&self, pid: Pid) {
        self.io.lock().retain(|t| t.pid() != pid);
        let mut sleep = self.sleep.lock();
        let kept: Vec<Reverse<SleepEntry>> = sleep
            .drain()
            .filter(|Reverse(e)| e.task.pid() != pid)
            .collect();
        sleep.extend(kept);
        self.child_exit.lock().retain(|_, t| t.pid() != pid);
    }

    pub fn io_snapshot(&self) -> Vec<Arc<Task>> {
        self.io.lock().iter().cloned().collect()
    }

    /// (pid, wakeup time) pairs in deadline order.
    pub fn sleep_snapshot(&self) -> Vec<(Pid, u64)> {
        let sleep = self.sleep.lock();
        let mut entries: Vec<(Pid, u64)> = sleep
            .iter()
            .map(|Reverse(e)| (e.task.pid(), e.wake_at_ms))
            .collect();
        entries.sort_by_key(|&(_, at)| at);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;
    use memory::SpaceId;

    fn sleeper(pid: Pid, wake_at: u64) -> Arc<Task> {
        let t = Task::new(pid, "sleeper", 0, SpaceId(pid as u32), 0x7000, 0x1000);
        t.wait_until(wake_at);
        t
    }

    #[test]
    fn sleepers_pop_in_deadline_order() {
        let q = WaitQueues::new();
        q.park_sleep(sleeper(1, 50));
        q.park_sleep(sleeper(2, 20));
        q.park_sleep(sleeper(3, 100));

        assert!(q.pop_due(10).is_empty());
        let due: Vec<Pid> = q.pop_due(60).iter().map(|t| t.pid()).collect();
        assert_eq!(due, vec![2, 1]);
        let due: Vec<Pid> = q.pop_due(100).iter().map(|t| t.pid()).collect();
        assert_eq!(due, vec![3]);
    }

    #[test]
    fn equal_deadlines_stay_fifo() {
        let q = WaitQueues::new();
        for pid in 1..=3 {
            q.park_sleep(sleeper(pid, 40));
        }
        let due: Vec<Pid> = q.pop_due(40).iter().map(|t| t.pid()).collect();
        assert_eq!(due, vec![1, 2, 3]);
    }

    #[test]
    fn uart_drain_only_takes_uart_waiters() {
        let q = WaitQueues::new();
        let uart = Task::new(1, "r", 0, SpaceId(1), 0x7000, 0x1000);
        uart.wait_for(WaitReason::UartInput);
        let generic = Task::new(2, "w", 0, SpaceId(2), 0x7000, 0x1000);
        generic.wait_for(WaitReason::ProcessExit);
        q.park_io(uart);
        q.park_io(generic.clone());

        let woken = q.drain_uart_waiters();
        assert_eq!(woken.len(), 1);
        assert_eq!(woken[0].pid(), 1);
        assert_eq!(q.io_snapshot().len(), 1);
        assert_eq!(generic.state(), TaskState::Waiting);
    }
}
