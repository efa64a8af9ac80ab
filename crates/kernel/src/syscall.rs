// System-call layer
// -----------------
// Arguments arrive in a0-a5, the call number in a7, and the result goes
// back in a0 of the saved frame (the frame was saved before dispatch, so
// everything here edits the task record, never live hart registers).
//
// Blocking calls (read with no input, wait with live children) rewind the
// saved PC by 4 and leave a0 untouched: when the task is woken and
// redispatched it re-executes the ECALL with its arguments still in place.
// Sleep does not rewind - its wakeup time is already recorded and re-running
// the call would arm the timer again.

use std::sync::Arc;

use log::{debug, info, warn};
use memory::{AddressContext, Perms, UART_RX_DATA, UART_STATUS};
use rv32::registers::{A0, A1, A2, A3, A4, A5, A7, SP};
use rv32::Memory;

use crate::config::{EXEC_STACK_SIZE, STACK_TOP};
use crate::elf::ElfImage;
use crate::kernel::{now_ms, Kernel};
use crate::task::{Task, TaskState, TrapFrame};

/// Linux RISC-V call numbers, plus simulator-local extensions >= 1000.
pub mod nr {
    pub const READ: u32 = 63;
    pub const WRITE: u32 = 64;
    pub const EXIT: u32 = 93;
    pub const YIELD: u32 = 124;
    pub const GETPID: u32 = 172;
    pub const FORK: u32 = 220;
    pub const EXEC: u32 = 221;
    pub const WAIT: u32 = 260;

    pub const DEBUG_PRINT: u32 = 1000;
    pub const GET_TIME: u32 = 1001;
    pub const SLEEP: u32 = 1002;
}

const MAX_PATH: usize = 4096;
const MAX_ARGV: usize = 64;

/// Handle the ECALL recorded in `task`'s saved frame. `ctx` is bound to the
/// address space the task trapped in.
pub fn dispatch(kernel: &Arc<Kernel>, task: &Arc<Task>, ctx: &AddressContext) {
    let mut frame = task.frame();
    let number = frame.regs[A7];
    let args = [
        frame.regs[A0],
        frame.regs[A1],
        frame.regs[A2],
        frame.regs[A3],
        frame.regs[A4],
        frame.regs[A5],
    ];

    let ret: Option<i32> = match number {
        nr::EXIT => sys_exit(task, args[0] as i32),
        nr::WRITE => sys_write(task, ctx, args[0], args[1], args[2]),
        nr::READ => sys_read(kernel, task, ctx, &mut frame, args[0], args[1]),
        nr::YIELD => {
            task.set_state(TaskState::Ready);
            Some(0)
        }
        nr::GETPID => Some(task.pid()),
        nr::FORK => Some(sys_fork(kernel, task, &frame)),
        nr::EXEC => Some(sys_exec(kernel, task, ctx, &mut frame, args[0], args[1])),
        nr::WAIT => sys_wait(kernel, task, ctx, &mut frame, args[0]),
        nr::GET_TIME => Some(now_ms() as u32 as i32),
        nr::SLEEP => {
            task.wait_until(now_ms() + args[0] as u64);
            debug!("task {} sleeping {} ms", task.pid(), args[0]);
            Some(0)
        }
        nr::DEBUG_PRINT if kernel.config().enable_debug_syscalls => {
            sys_debug_print(task, ctx, args[0], args[1])
        }
        _ => {
            warn!("unknown syscall {} from task {}", number, task.pid());
            Some(-1)
        }
    };

    if let Some(value) = ret {
        frame.regs[A0] = value as u32;
        debug!("task {} syscall {} -> {}", task.pid(), number, value);
    }
    task.set_frame(frame);
}

/// Rewind the saved PC so the ECALL re-executes on wakeup.
fn rewind_to_ecall(ctx: &AddressContext, frame: &mut TrapFrame) {
    frame.pc = frame.pc.wrapping_sub(4);
    // Nothing guarantees the rewound address holds an ECALL; catch a layer
    // violation early in debug builds.
    debug_assert!(
        matches!(ctx.load_word(frame.pc), Err(_) | Ok(0x0000_0073) | Ok(0x0010_0073)),
        "pc rewind does not land on an environment call"
    );
}

fn sys_exit(task: &Arc<Task>, code: i32) -> Option<i32> {
    info!("task {} exiting with code {}", task.pid(), code);
    task.set_exit_code(code);
    task.set_state(TaskState::Terminated);
    Some(code)
}

/// write(fd, buf, n): stdout/stderr only; copies until NUL or `n` bytes.
fn sys_write(task: &Arc<Task>, ctx: &AddressContext, fd: u32, buf: u32, n: u32) -> Option<i32> {
    if fd != 1 && fd != 2 {
        return Some(-1);
    }
    match ctx.read_cstring(buf, n as usize) {
        Ok(bytes) => {
            use std::io::Write;
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(&bytes);
            let _ = out.flush();
            Some(bytes.len() as i32)
        }
        Err(fault) => {
            warn!("task {} write fault: {}", task.pid(), fault);
            Some(-1)
        }
    }
}

/// read(fd=0, buf, _n): one byte from the UART, or block until RX-ready.
fn sys_read(
    kernel: &Arc<Kernel>,
    task: &Arc<Task>,
    ctx: &AddressContext,
    frame: &mut TrapFrame,
    fd: u32,
    buf: u32,
) -> Option<i32> {
    if fd != 0 {
        return Some(-1);
    }
    let ram = kernel.mmu().ram();
    if ram.mmio_read(UART_STATUS) & 1 == 0 {
        task.wait_for(crate::task::WaitReason::UartInput);
        rewind_to_ecall(ctx, frame);
        return None;
    }
    let byte = ram.mmio_read(UART_RX_DATA) as u8;
    match ctx.store_byte(buf, byte) {
        Ok(()) => Some(1),
        Err(fault) => {
            warn!("task {} read fault: {}", task.pid(), fault);
            Some(-1)
        }
    }
}

/// fork(): duplicate the address space and registers; the child sees 0 in
/// a0, the parent sees the child PID.
fn sys_fork(kernel: &Arc<Kernel>, task: &Arc<Task>, frame: &TrapFrame) -> i32 {
    let child_pid = kernel.alloc_pid();
    let child_space = match kernel.mmu().clone_space(task.space(), child_pid) {
        Ok(space) => space,
        Err(fault) => {
            warn!("fork by task {} failed: {}", task.pid(), fault);
            return -1;
        }
    };

    let child = Task::new(
        child_pid,
        &task.name(),
        frame.pc,
        child_space,
        task.stack_base(),
        task.stack_size(),
    );
    let mut child_frame = *frame;
    child_frame.regs[A0] = 0;
    child.set_frame(child_frame);
    child.set_priority(task.priority());
    child.set_parent(task);
    task.add_child(Arc::clone(&child));

    kernel.register(child);
    info!("task {} forked child {}", task.pid(), child_pid);
    child_pid
}

/// exec(path, argv): replace the address space with a fresh image, build a
/// new stack carrying the argv strings, and return argc.
fn sys_exec(
    kernel: &Arc<Kernel>,
    task: &Arc<Task>,
    ctx: &AddressContext,
    frame: &mut TrapFrame,
    path_ptr: u32,
    argv_ptr: u32,
) -> i32 {
    let mmu = kernel.mmu();

    let path = match ctx.read_cstring(path_ptr, MAX_PATH) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => return -1,
    };
    let mut argv: Vec<Vec<u8>> = Vec::new();
    if argv_ptr != 0 {
        for i in 0..MAX_ARGV as u32 {
            let slot = match ctx.load_word(argv_ptr + i * 4) {
                Ok(p) => p,
                Err(_) => return -1,
            };
            if slot == 0 {
                break;
            }
            match ctx.read_cstring(slot, MAX_PATH) {
                Ok(arg) => argv.push(arg),
                Err(_) => return -1,
            }
        }
    }

    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) => {
            warn!("exec by task {}: cannot read '{}': {}", task.pid(), path, e);
            return -1;
        }
    };
    let image = match ElfImage::parse(&bytes) {
        Ok(image) => image,
        Err(e) => {
            warn!("exec by task {}: bad image '{}': {}", task.pid(), path, e);
            return -1;
        }
    };

    let pid = task.pid();
    let staged = match mmu.create_replacement_space(pid, kernel.config().task_memory_bytes) {
        Ok(space) => space,
        Err(fault) => {
            warn!("exec by task {}: {}", pid, fault);
            return -1;
        }
    };

    // Everything below must succeed before the old space is touched.
    let prepared: Result<(u32, u32, u32, u32), rv32::MemFault> = (|| {
        let stack_base = STACK_TOP - EXEC_STACK_SIZE;
        mmu.map_region(staged, stack_base, EXEC_STACK_SIZE as usize, Perms::rw())?;
        let entry = image
            .load(mmu, staged, &bytes)
            .map_err(|_| rv32::MemFault::OutOfMemory)?;

        // argv strings first, then the pointer array, 16-byte aligning the
        // stack pointer at each stage.
        let mut sp = STACK_TOP;
        let total: u32 = argv.iter().map(|a| a.len() as u32 + 1).sum();
        sp = (sp - total) & !0xf;
        let mut addrs = Vec::with_capacity(argv.len());
        let mut cursor = sp;
        for arg in &argv {
            mmu.loader_write(staged, cursor, arg)?;
            mmu.loader_write(staged, cursor + arg.len() as u32, &[0])?;
            addrs.push(cursor);
            cursor += arg.len() as u32 + 1;
        }

        sp = (sp - (argv.len() as u32 + 1) * 4) & !0xf;
        let argv_array = sp;
        for (i, addr) in addrs.iter().enumerate() {
            mmu.loader_write(staged, argv_array + i as u32 * 4, &addr.to_le_bytes())?;
        }
        mmu.loader_write(staged, argv_array + argv.len() as u32 * 4, &0u32.to_le_bytes())?;

        Ok((entry, sp, argv_array, stack_base))
    })();

    let (entry, sp, argv_array, stack_base) = match prepared {
        Ok(v) => v,
        Err(fault) => {
            mmu.destroy_space(staged);
            warn!("exec by task {} rolled back: {}", pid, fault);
            return -1;
        }
    };

    // Point of no return: adopt the staged space, drop the old image.
    let old = task.space();
    let owned = mmu.commit_replacement(old, staged, pid);
    task.set_space(owned);
    task.set_stack(stack_base, EXEC_STACK_SIZE);
    task.set_name(&path);

    frame.pc = entry;
    frame.regs[SP] = sp;
    frame.regs[A1] = argv_array;
    let argc = argv.len() as i32;
    info!("task {} exec '{}' ({} args)", pid, path, argc);
    argc
}

/// wait(status_ptr): reap one zombie child, or block until one appears.
fn sys_wait(
    kernel: &Arc<Kernel>,
    task: &Arc<Task>,
    ctx: &AddressContext,
    frame: &mut TrapFrame,
    status_ptr: u32,
) -> Option<i32> {
    if let Some(zombie) = task.zombie_child() {
        if status_ptr != 0 {
            if let Err(fault) = ctx.store_word(status_ptr, zombie.exit_code() as u32) {
                warn!("task {} wait status fault: {}", task.pid(), fault);
                return Some(-1);
            }
        }
        task.remove_child(zombie.pid());
        kernel.reap(&zombie);
        info!("task {} reaped child {}", task.pid(), zombie.pid());
        return Some(zombie.pid());
    }

    if task.has_children() {
        task.wait_for_child(-1);
        rewind_to_ecall(ctx, frame);
        return None;
    }

    Some(-1)
}

fn sys_debug_print(task: &Arc<Task>, ctx: &AddressContext, ptr: u32, len: u32) -> Option<i32> {
    match ctx.read_cstring(ptr, len as usize) {
        Ok(bytes) => {
            info!("[debug pid {}] {}", task.pid(), String::from_utf8_lossy(&bytes));
            Some(len as i32)
        }
        Err(_) => Some(-1),
    }
}
