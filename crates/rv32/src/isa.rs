//! Major-opcode table for the RV32IM base encoding.

#[repr(u8)]
#[derive(Debug, PartialEq, Eq)]
pub enum Opcode {
    /// Load instructions: LW, LH, LHU, LB, LBU.
    Load = 0x03,

    /// Memory ordering: FENCE (a no-op on this single-memory model).
    MiscMem = 0x0f,

    /// Immediate arithmetic ops: ADDI, SLTI, ANDI, ORI, shifts, etc.
    OpImm = 0x13,

    /// Add Upper Immediate to PC: rd = PC + (imm << 12)
    Auipc = 0x17,

    /// Store instructions: SW, SH, SB.
    Store = 0x23,

    /// Register-register arithmetic ops: ADD, SUB, AND, OR, and the
    /// M-extension multiply/divide group (funct7 = 0x01).
    Op = 0x33,

    /// Load Upper Immediate: loads imm[31:12] << 12 into `rd`.
    Lui = 0x37,

    /// Branch instructions: BEQ, BNE, BLT, BGE, BLTU, BGEU.
    Branch = 0x63,

    /// Jump and Link Register: PC = (rs1 + imm) & !1; rd = return address.
    Jalr = 0x67,

    /// Jump and Link: PC += imm; rd = return address.
    Jal = 0x6f,

    /// System instructions: ECALL, EBREAK, CSR stubs.
    System = 0x73,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        use Opcode::*;
        Some(match value {
            0x03 => Load,
            0x0f => MiscMem,
            0x13 => OpImm,
            0x17 => Auipc,
            0x23 => Store,
            0x33 => Op,
            0x37 => Lui,
            0x63 => Branch,
            0x67 => Jalr,
            0x6f => Jal,
            0x73 => System,
            _ => return None,
        })
    }
}

/// funct7 value that selects the M extension within the OP opcode.
pub const FUNCT7_MULDIV: u32 = 0x01;
