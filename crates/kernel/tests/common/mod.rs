//! Shared helpers: a minimal ELF32 builder and pre-assembled RISC-V
//! programs used across the integration tests.

#![allow(dead_code)]

pub const TEXT_BASE: u32 = 0x1_0000;

const EM_RISCV: u16 = 243;
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

/// Build the smallest valid little-endian RISC-V ELF32 with one RWX
/// segment at `vaddr` and the entry point at its start.
pub fn tiny_elf(code: &[u32], vaddr: u32) -> Vec<u8> {
    let ehsize = 52u32;
    let phsize = 32u32;
    let file_off = ehsize + phsize;
    let bytes: Vec<u8> = code.iter().flat_map(|w| w.to_le_bytes()).collect();

    let mut out = Vec::new();
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
    out.extend_from_slice(&[0; 8]);
    out.extend_from_slice(&2u16.to_le_bytes()); // e_type = EXEC
    out.extend_from_slice(&EM_RISCV.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes()); // e_version
    out.extend_from_slice(&vaddr.to_le_bytes()); // e_entry
    out.extend_from_slice(&ehsize.to_le_bytes()); // e_phoff
    out.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
    out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    out.extend_from_slice(&(ehsize as u16).to_le_bytes());
    out.extend_from_slice(&(phsize as u16).to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());

    out.extend_from_slice(&PT_LOAD.to_le_bytes());
    out.extend_from_slice(&file_off.to_le_bytes());
    out.extend_from_slice(&vaddr.to_le_bytes());
    out.extend_from_slice(&vaddr.to_le_bytes());
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&(PF_R | PF_W | PF_X).to_le_bytes());
    out.extend_from_slice(&0x1000u32.to_le_bytes());

    out.extend_from_slice(&bytes);
    out
}

// Tiny assembler for the handful of encodings the tests need.

pub fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
    ((imm as u32 & 0xfff) << 20) | (rs1 << 15) | (rd << 7) | 0x13
}

pub fn lui(rd: u32, imm20: u32) -> u32 {
    (imm20 << 12) | (rd << 7) | 0x37
}

pub fn lw(rd: u32, rs1: u32, offset: i32) -> u32 {
    ((offset as u32 & 0xfff) << 20) | (rs1 << 15) | (0b010 << 12) | (rd << 7) | 0x03
}

pub fn sw(rs1: u32, rs2: u32, offset: i32) -> u32 {
    let imm = offset as u32 & 0xfff;
    ((imm >> 5) << 25) | (rs2 << 20) | (rs1 << 15) | (0b010 << 12) | ((imm & 0x1f) << 7) | 0x23
}

pub fn bne(rs1: u32, rs2: u32, offset: i32) -> u32 {
    let imm = offset as u32;
    (((imm >> 12) & 1) << 31)
        | (((imm >> 5) & 0x3f) << 25)
        | (rs2 << 20)
        | (rs1 << 15)
        | (0b001 << 12)
        | (((imm >> 1) & 0xf) << 8)
        | (((imm >> 11) & 1) << 7)
        | 0x63
}

pub fn jal(rd: u32, offset: i32) -> u32 {
    let imm = offset as u32;
    (((imm >> 20) & 1) << 31)
        | (((imm >> 1) & 0x3ff) << 21)
        | (((imm >> 11) & 1) << 20)
        | (((imm >> 12) & 0xff) << 12)
        | (rd << 7)
        | 0x6f
}

pub const ECALL: u32 = 0x0000_0073;

pub const ZERO: u32 = 0;
pub const SP: u32 = 2;
pub const A0: u32 = 10;
pub const A1: u32 = 11;
pub const A2: u32 = 12;
pub const A7: u32 = 17;

pub mod nr {
    pub const READ: i32 = 63;
    pub const EXIT: i32 = 93;
    pub const YIELD: i32 = 124;
    pub const FORK: i32 = 220;
    pub const WAIT: i32 = 260;
    pub const SLEEP: i32 = 1002;
}

/// `exit(code)`
pub fn exit_program(code: i32) -> Vec<u32> {
    vec![addi(A7, ZERO, nr::EXIT), addi(A0, ZERO, code), ECALL]
}

/// `sleep(ms); exit(code)`
pub fn sleep_program(ms: i32, code: i32) -> Vec<u32> {
    vec![
        addi(A7, ZERO, nr::SLEEP),
        addi(A0, ZERO, ms),
        ECALL,
        addi(A7, ZERO, nr::EXIT),
        addi(A0, ZERO, code),
        ECALL,
    ]
}
