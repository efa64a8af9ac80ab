mod common;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use common::*;
use kernel::sched::RoundRobinScheduler;
use kernel::task::{Task, TaskState};
use kernel::{Kernel, KernelConfig};
use memory::{EvictPolicy, FetchPolicy, Mmu, Ram};
use once_cell::sync::Lazy;
use rv32::Memory;

static EXIT42: Lazy<Vec<u8>> = Lazy::new(|| tiny_elf(&exit_program(42), TEXT_BASE));

fn new_kernel() -> Arc<Kernel> {
    let _ = env_logger::builder().is_test(true).try_init();
    let ram = Arc::new(Ram::new(4 * 1024 * 1024));
    let mmu = Arc::new(Mmu::paged(ram, FetchPolicy::Demand, EvictPolicy::Clock));
    Kernel::new(
        mmu,
        Box::new(RoundRobinScheduler::new(1000)),
        KernelConfig::default(),
    )
}

fn boot() -> (Arc<Kernel>, Vec<JoinHandle<()>>) {
    let kernel = new_kernel();
    let handles = kernel.start().unwrap();
    (kernel, handles)
}

fn shutdown(kernel: &Arc<Kernel>, handles: Vec<JoinHandle<()>>) {
    kernel.stop();
    for h in handles {
        let _ = h.join();
    }
}

fn await_state(task: &Arc<Task>, state: TaskState, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if task.state() == state {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn exit_round_trip() {
    let (kernel, handles) = boot();
    let task = kernel.create_task(&EXIT42, "exit42").unwrap();

    assert!(await_state(&task, TaskState::Terminated, Duration::from_secs(2)));
    assert_eq!(task.exit_code(), 42);

    // The zombie is preserved in the task table but never scheduled again.
    assert!(kernel.task(task.pid()).is_some());
    assert!(kernel
        .ready_snapshot()
        .iter()
        .all(|t| t.pid() != task.pid()));

    shutdown(&kernel, handles);
}

#[test]
fn fork_then_wait_reaps_the_child() {
    // fork; child exits 7; parent waits, loads *status, exits with it.
    let program = vec![
        addi(A7, ZERO, nr::FORK),
        ECALL,
        bne(A0, ZERO, 16), // parent skips the child block
        addi(A7, ZERO, nr::EXIT),
        addi(A0, ZERO, 7),
        ECALL,
        lui(A0, 0x20), // &status = 0x20000
        addi(A7, ZERO, nr::WAIT),
        ECALL,
        lui(A1, 0x20),
        lw(A0, A1, 0),
        addi(A7, ZERO, nr::EXIT),
        ECALL,
    ];
    let (kernel, handles) = boot();
    let elf = tiny_elf(&program, TEXT_BASE);
    let parent = kernel.create_task(&elf, "forker").unwrap();

    assert!(await_state(&parent, TaskState::Terminated, Duration::from_secs(2)));
    assert_eq!(parent.exit_code(), 7, "status word did not carry the child exit code");

    // The child was reaped by wait: gone from the table, parent remains as
    // a zombie with no children.
    assert!(!parent.has_children());
    let alive: Vec<i32> = kernel.tasks_snapshot().iter().map(|t| t.pid).collect();
    assert_eq!(alive, vec![parent.pid()]);

    shutdown(&kernel, handles);
}

#[test]
fn blocked_read_rewinds_to_the_ecall() {
    // read(0, 0x20000, 1); exit(result)
    let program = vec![
        addi(A0, ZERO, 0),
        lui(A1, 0x20),
        addi(A2, ZERO, 1),
        addi(A7, ZERO, nr::READ),
        ECALL, // offset 16
        addi(A7, ZERO, nr::EXIT),
        ECALL,
    ];
    let (kernel, handles) = boot();
    let elf = tiny_elf(&program, TEXT_BASE);
    let task = kernel.create_task(&elf, "reader").unwrap();

    // No UART input yet: the task blocks with its PC rewound onto the
    // ECALL so the call re-executes on wakeup.
    assert!(await_state(&task, TaskState::Waiting, Duration::from_secs(2)));
    assert_eq!(task.frame().pc, TEXT_BASE + 16);

    kernel.mmu().ram().uart().push_input(b"x");
    assert!(await_state(&task, TaskState::Terminated, Duration::from_secs(2)));
    assert_eq!(task.exit_code(), 1, "read should return one byte");

    // The byte landed in the task's buffer.
    let ctx = kernel.mmu().context(task.space());
    assert_eq!(ctx.load_byte(0x2_0000).unwrap(), b'x');

    shutdown(&kernel, handles);
}

#[test]
fn wait_with_no_children_fails_fast() {
    // wait(0) with no children; exit(result) - expect -1 (255 truncated).
    let program = vec![
        addi(A0, ZERO, 0),
        addi(A7, ZERO, nr::WAIT),
        ECALL,
        addi(A7, ZERO, nr::EXIT),
        ECALL,
    ];
    let (kernel, handles) = boot();
    let task = kernel
        .create_task(&tiny_elf(&program, TEXT_BASE), "childless")
        .unwrap();
    assert!(await_state(&task, TaskState::Terminated, Duration::from_secs(2)));
    assert_eq!(task.exit_code(), -1);
    shutdown(&kernel, handles);
}

#[test]
fn external_termination_stops_a_spinning_task() {
    // jal x0, 0 - an infinite loop.
    let (kernel, handles) = boot();
    let task = kernel
        .create_task(&tiny_elf(&[jal(ZERO, 0)], TEXT_BASE), "spinner")
        .unwrap();

    assert!(await_state(&task, TaskState::Running, Duration::from_secs(2)));
    kernel.terminate_task(task.pid());
    assert!(await_state(&task, TaskState::Terminated, Duration::from_secs(2)));
    shutdown(&kernel, handles);
}

#[test]
fn faulting_task_dies_but_the_kernel_survives() {
    // Jump into unmapped-forever territory by executing an illegal word.
    let (kernel, handles) = boot();
    let bad = kernel
        .create_task(&tiny_elf(&[0xffff_ffff], TEXT_BASE), "crasher")
        .unwrap();
    assert!(await_state(&bad, TaskState::Terminated, Duration::from_secs(2)));

    // The kernel keeps scheduling other work afterwards.
    let ok = kernel
        .create_task(&tiny_elf(&exit_program(3), TEXT_BASE), "after")
        .unwrap();
    assert!(await_state(&ok, TaskState::Terminated, Duration::from_secs(2)));
    assert_eq!(ok.exit_code(), 3);
    shutdown(&kernel, handles);
}

#[test]
fn threads_share_the_leader_address_space() {
    let kernel = new_kernel();
    let leader = kernel
        .create_task(&tiny_elf(&exit_program(0), TEXT_BASE), "leader")
        .unwrap();
    let thread = kernel.spawn_thread(&leader, TEXT_BASE).unwrap();

    assert_eq!(thread.tgid(), leader.pid());
    assert_eq!(thread.space(), leader.space());
    assert!(kernel.task(thread.pid()).is_some());

    // A store through the leader is visible to the thread.
    kernel
        .mmu()
        .loader_write(leader.space(), 0x3_0000, b"shared")
        .unwrap();
    let ctx = kernel.mmu().context(thread.space());
    assert_eq!(ctx.read_cstring(0x3_0000, 16).unwrap(), b"shared");
}

#[test]
#[should_panic(expected = "double schedule")]
fn double_handout_panics() {
    // Kernel not started: we play two harts by hand. A rogue re-enqueue
    // puts a held task back in the ready queue; the second claim must die.
    let kernel = new_kernel();
    let task = kernel
        .create_task(&tiny_elf(&exit_program(0), TEXT_BASE), "victim")
        .unwrap();

    let sched = kernel.scheduler_for_tests();
    let first = sched.acquire().schedule().unwrap();
    first.acquire_cpu(0);

    first.set_state(TaskState::Ready);
    sched.acquire().add_task(Arc::clone(&first));
    let second = sched.acquire().schedule().unwrap();
    second.acquire_cpu(1);
    let _ = task;
}
