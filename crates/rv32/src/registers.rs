//! Names for the RV32 integer register file.
//!
//! The hart keeps its registers as a plain `[u32; 32]` indexed by the raw
//! encoding fields, so register names exist in two places only: the ABI-name
//! table the disassembly rendering reads, and index constants for the
//! registers the kernel addresses by name. The syscall convention is the
//! reason most of the constants exist: the call number travels in a7, the
//! arguments in a0-a5, and the result is written back to a0 of the saved
//! frame.

/// x2, the stack pointer. Task creation points it just under the stack top,
/// 16-byte aligned; exec rebuilds it while laying out argv.
pub const SP: usize = 2;

/// x10 (a0): first syscall argument and the slot the result is written to.
pub const A0: usize = 10;
/// x11 (a1): second syscall argument; exec also returns the argv array
/// address here.
pub const A1: usize = 11;
/// x12 (a2): third syscall argument.
pub const A2: usize = 12;
/// x13 (a3): fourth syscall argument.
pub const A3: usize = 13;
/// x14 (a4): fifth syscall argument.
pub const A4: usize = 14;
/// x15 (a5): sixth syscall argument.
pub const A5: usize = 15;
/// x17 (a7): syscall number.
pub const A7: usize = 17;

const ABI_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

/// ABI name for register index `i` (panics on an out-of-range index).
pub fn abi_name(i: usize) -> &'static str {
    ABI_NAMES[i]
}
