mod common;

use std::sync::Arc;

use common::*;
use kernel::sched::RoundRobinScheduler;
use kernel::task::TaskState;
use kernel::{Kernel, KernelConfig};
use memory::{EvictPolicy, FetchPolicy, Mmu, Ram};
use rv32::Memory;

fn new_kernel() -> Arc<Kernel> {
    let ram = Arc::new(Ram::new(4 * 1024 * 1024));
    let mmu = Arc::new(Mmu::paged(ram, FetchPolicy::Demand, EvictPolicy::Clock));
    Kernel::new(
        mmu,
        Box::new(RoundRobinScheduler::new(1000)),
        KernelConfig::default(),
    )
}

#[test]
fn fork_clones_registers_except_a0() {
    let kernel = new_kernel();
    let parent = kernel
        .create_task(&tiny_elf(&exit_program(0), TEXT_BASE), "parent")
        .unwrap();

    parent.with_frame(|f| {
        for i in 1..32 {
            f.regs[i] = 0x1000 + i as u32;
        }
        f.regs[17] = 220; // fork
        f.pc = TEXT_BASE + 4;
    });
    let ctx = kernel.mmu().context(parent.space());
    kernel::syscall::dispatch(&kernel, &parent, &ctx);

    let child_pid = parent.frame().regs[10] as i32;
    assert!(child_pid > 0, "fork returns the child pid to the parent");
    let child = kernel.task(child_pid).expect("child is on the books");

    let pf = parent.frame();
    let cf = child.frame();
    assert_eq!(cf.pc, pf.pc, "the child resumes right after the ecall");
    for i in 0..32 {
        if i == 10 {
            assert_eq!(cf.regs[10], 0, "the child reads 0 from a0");
        } else {
            assert_eq!(cf.regs[i], pf.regs[i], "x{i} differs after fork");
        }
    }

    assert_eq!(child.state(), TaskState::Ready);
    assert_eq!(child.parent().unwrap().pid(), parent.pid());
    assert_eq!(parent.children().len(), 1);
}

#[test]
fn fork_duplicates_memory_not_aliases() {
    let kernel = new_kernel();
    let parent = kernel
        .create_task(&tiny_elf(&exit_program(0), TEXT_BASE), "parent")
        .unwrap();

    let mmu = kernel.mmu();
    mmu.loader_write(parent.space(), 0x3_0000, b"before-fork").unwrap();

    parent.with_frame(|f| {
        f.regs[17] = 220;
        f.pc = TEXT_BASE + 4;
    });
    let ctx = mmu.context(parent.space());
    kernel::syscall::dispatch(&kernel, &parent, &ctx);

    let child_pid = parent.frame().regs[10] as i32;
    let child = kernel.task(child_pid).unwrap();
    let child_ctx = mmu.context(child.space());
    assert_eq!(child_ctx.read_cstring(0x3_0000, 32).unwrap(), b"before-fork");

    // Writes after the fork stay on one side.
    mmu.loader_write(parent.space(), 0x3_0000, b"parent-side").unwrap();
    assert_eq!(child_ctx.read_cstring(0x3_0000, 32).unwrap(), b"before-fork");

    let parent_ctx = mmu.context(parent.space());
    assert_eq!(parent_ctx.read_cstring(0x3_0000, 32).unwrap(), b"parent-side");
}

#[test]
fn fork_failure_reports_minus_one() {
    // A machine with almost no memory: the clone cannot be backed.
    let ram = Arc::new(Ram::new(16 * 4096));
    let mmu = Arc::new(Mmu::paged(ram, FetchPolicy::Demand, EvictPolicy::Clock));
    let kernel = Kernel::new(
        mmu,
        Box::new(RoundRobinScheduler::new(1000)),
        KernelConfig::default(),
    );
    let parent = kernel
        .create_task(&tiny_elf(&exit_program(0), TEXT_BASE), "parent")
        .unwrap();

    // Fill most of RAM through the parent so the copy must fail.
    for page in 0..10u32 {
        kernel
            .mmu()
            .loader_write(parent.space(), 0x3_0000 + page * 0x1000, &[1])
            .unwrap();
    }

    parent.with_frame(|f| {
        f.regs[17] = 220;
        f.pc = TEXT_BASE + 4;
    });
    let ctx = kernel.mmu().context(parent.space());
    kernel::syscall::dispatch(&kernel, &parent, &ctx);

    assert_eq!(parent.frame().regs[10] as i32, -1);
    assert!(parent.children().is_empty());
    assert_eq!(kernel.all_tasks().len(), 1);
}
