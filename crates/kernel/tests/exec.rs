mod common;

use std::sync::Arc;

use common::*;
use kernel::sched::RoundRobinScheduler;
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

fn assert_conserved(kernel: &Kernel) {
    let paged = kernel.mmu().as_paged().unwrap();
    let (free, data, pt) = paged.accounting();
    assert_eq!(free + data + pt, paged.total_frames());
}

/// Drive the exec syscall directly against a parked task, as the dispatcher
/// would after an ECALL.
#[test]
fn exec_swaps_in_the_new_image() {
    let kernel = new_kernel();
    let task = kernel
        .create_task(&tiny_elf(&exit_program(1), TEXT_BASE), "execer")
        .unwrap();

    // Host-side target program: exits with 5.
    let path = std::env::temp_dir().join("rvsim-exec-target.elf");
    std::fs::write(&path, tiny_elf(&exit_program(5), TEXT_BASE)).unwrap();
    let mut path_bytes = path.to_str().unwrap().as_bytes().to_vec();
    path_bytes.push(0);

    // Plant path and argv = ["target"] in the caller's space.
    let mmu = kernel.mmu();
    let space = task.space();
    mmu.loader_write(space, 0x2_0000, &path_bytes).unwrap();
    mmu.loader_write(space, 0x2_0100, b"target\0").unwrap();
    mmu.loader_write(space, 0x2_0200, &0x0002_0100u32.to_le_bytes()).unwrap();
    mmu.loader_write(space, 0x2_0204, &0u32.to_le_bytes()).unwrap();

    task.with_frame(|f| {
        f.regs[17] = 221; // exec
        f.regs[10] = 0x2_0000;
        f.regs[11] = 0x2_0200;
        f.pc = TEXT_BASE + 4;
    });
    let ctx = mmu.context(space);
    kernel::syscall::dispatch(&kernel, &task, &ctx);

    let frame = task.frame();
    assert_eq!(frame.regs[10], 1, "exec returns argc");
    assert_eq!(frame.pc, TEXT_BASE, "pc points at the new entry");
    assert_ne!(task.space(), space, "address space was swapped");
    assert_eq!(frame.regs[2] % 16, 0, "sp is 16-byte aligned");

    // argv[0] is reachable through a1 in the fresh image.
    let new_ctx = mmu.context(task.space());
    let argv0 = new_ctx.load_word(frame.regs[11]).unwrap();
    assert_eq!(new_ctx.read_cstring(argv0, 64).unwrap(), b"target");

    // The old image's frames all came back.
    assert_conserved(&kernel);
}

#[test]
fn exec_of_a_bad_image_rolls_back() {
    let kernel = new_kernel();
    let task = kernel
        .create_task(&tiny_elf(&exit_program(1), TEXT_BASE), "execer")
        .unwrap();

    let path = std::env::temp_dir().join("rvsim-exec-junk.bin");
    std::fs::write(&path, b"this is not an elf").unwrap();
    let mut path_bytes = path.to_str().unwrap().as_bytes().to_vec();
    path_bytes.push(0);

    let mmu = kernel.mmu();
    let space = task.space();
    mmu.loader_write(space, 0x2_0000, &path_bytes).unwrap();

    task.with_frame(|f| {
        f.regs[17] = 221;
        f.regs[10] = 0x2_0000;
        f.regs[11] = 0;
        f.pc = TEXT_BASE + 4;
    });
    let ctx = mmu.context(space);
    kernel::syscall::dispatch(&kernel, &task, &ctx);

    let frame = task.frame();
    assert_eq!(frame.regs[10] as i32, -1);
    assert_eq!(task.space(), space, "caller keeps its image on failure");
    assert_eq!(frame.pc, TEXT_BASE + 4, "pc is not rewound for a failed exec");
    assert_conserved(&kernel);
}

#[test]
fn exec_of_a_missing_file_fails_cleanly() {
    let kernel = new_kernel();
    let task = kernel
        .create_task(&tiny_elf(&exit_program(1), TEXT_BASE), "execer")
        .unwrap();

    let mmu = kernel.mmu();
    let space = task.space();
    mmu.loader_write(space, 0x2_0000, b"/no/such/file\0").unwrap();

    task.with_frame(|f| {
        f.regs[17] = 221;
        f.regs[10] = 0x2_0000;
        f.regs[11] = 0;
        f.pc = TEXT_BASE + 4;
    });
    let ctx = mmu.context(space);
    kernel::syscall::dispatch(&kernel, &task, &ctx);

    assert_eq!(task.frame().regs[10] as i32, -1);
    assert_eq!(task.space(), space);
}
