// ELF loading
// -----------
// Parsing is goblin's job; this layer validates what the machine actually
// requires (32-bit, little-endian, RISC-V) and maps PT_LOAD segments into
// an address space: page-align, map with the program-header permissions,
// copy the file image, zero the bss tail. Everything else in the file is
// ignored. The entry point comes straight from the ELF header.

use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD};
use goblin::elf::Elf;
use log::debug;
use memory::{Mmu, Perms, SpaceId};
use rv32::MemFault;
use thiserror::Error;

use crate::config::NX_BOUNDARY;

pub const EM_RISCV: u16 = 243;

const PAGE_MASK: u32 = 0xfff;

#[derive(Debug, Error)]
pub enum ElfError {
    #[error("malformed ELF: {0}")]
    Parse(String),

    #[error("not a 32-bit ELF")]
    NotClass32,

    #[error("not little-endian")]
    NotLittleEndian,

    #[error("wrong machine type {0} (expected RISC-V)")]
    WrongMachine(u16),

    #[error("segment data extends past end of file")]
    Truncated,

    #[error(transparent)]
    Mem(#[from] MemFault),
}

/// One PT_LOAD program header, reduced to what the loader needs.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub vaddr: u32,
    pub file_size: u32,
    pub mem_size: u32,
    pub file_offset: u32,
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

/// Parsed, validated image ready to map.
#[derive(Debug)]
pub struct ElfImage {
    pub entry: u32,
    pub segments: Vec<Segment>,
}

impl ElfImage {
    pub fn parse(bytes: &[u8]) -> Result<Self, ElfError> {
        let elf = Elf::parse(bytes).map_err(|e| ElfError::Parse(e.to_string()))?;

        if elf.is_64 {
            return Err(ElfError::NotClass32);
        }
        if !elf.little_endian {
            return Err(ElfError::NotLittleEndian);
        }
        if elf.header.e_machine != EM_RISCV {
            return Err(ElfError::WrongMachine(elf.header.e_machine));
        }

        let mut segments = Vec::new();
        for ph in elf.program_headers.iter().filter(|ph| ph.p_type == PT_LOAD) {
            let seg = Segment {
                vaddr: ph.p_vaddr as u32,
                file_size: ph.p_filesz as u32,
                mem_size: ph.p_memsz as u32,
                file_offset: ph.p_offset as u32,
                read: ph.p_flags & PF_R != 0,
                write: ph.p_flags & PF_W != 0,
                exec: ph.p_flags & PF_X != 0,
            };
            if (seg.file_offset as usize) + (seg.file_size as usize) > bytes.len() {
                return Err(ElfError::Truncated);
            }
            segments.push(seg);
        }

        Ok(Self {
            entry: elf.header.e_entry as u32,
            segments,
        })
    }

    /// Map and populate every segment in `space`; returns the entry point.
    pub fn load(&self, mmu: &Mmu, space: SpaceId, bytes: &[u8]) -> Result<u32, ElfError> {
        for seg in &self.segments {
            let start = seg.vaddr & !PAGE_MASK;
            let end = seg.vaddr.checked_add(seg.mem_size).ok_or(ElfError::Truncated)?;
            let span = (end - start).div_ceil(PAGE_MASK + 1) * (PAGE_MASK + 1);

            let mut perms = Perms { read: seg.read, write: seg.write, exec: seg.exec };
            // Pages reaching the stack ceiling never execute.
            if end > NX_BOUNDARY {
                perms.exec = false;
            }
            mmu.map_region(space, start, span as usize, perms)?;

            if seg.file_size > 0 {
                let off = seg.file_offset as usize;
                mmu.loader_write(space, seg.vaddr, &bytes[off..off + seg.file_size as usize])?;
            }
            if seg.mem_size > seg.file_size {
                let zeros = vec![0u8; (seg.mem_size - seg.file_size) as usize];
                mmu.loader_write(space, seg.vaddr + seg.file_size, &zeros)?;
            }
            debug!(
                "elf: segment [0x{:08x}, 0x{:08x}) r={} w={} x={}",
                seg.vaddr, end, perms.read, perms.write, perms.exec
            );
        }
        Ok(self.entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build the smallest valid ELF32 (RISC-V, little-endian) carrying one
    /// loadable segment.
    pub fn tiny_elf(code: &[u8], vaddr: u32, entry: u32) -> Vec<u8> {
        let ehsize = 52u32;
        let phsize = 32u32;
        let file_off = ehsize + phsize;

        let mut out = Vec::new();
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]); // ident
        out.extend_from_slice(&[0; 8]); // ident padding
        out.extend_from_slice(&2u16.to_le_bytes()); // e_type = EXEC
        out.extend_from_slice(&EM_RISCV.to_le_bytes()); // e_machine
        out.extend_from_slice(&1u32.to_le_bytes()); // e_version
        out.extend_from_slice(&entry.to_le_bytes()); // e_entry
        out.extend_from_slice(&ehsize.to_le_bytes()); // e_phoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&(ehsize as u16).to_le_bytes()); // e_ehsize
        out.extend_from_slice(&(phsize as u16).to_le_bytes()); // e_phentsize
        out.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
        assert_eq!(out.len(), ehsize as usize);

        out.extend_from_slice(&PT_LOAD.to_le_bytes()); // p_type
        out.extend_from_slice(&file_off.to_le_bytes()); // p_offset
        out.extend_from_slice(&vaddr.to_le_bytes()); // p_vaddr
        out.extend_from_slice(&vaddr.to_le_bytes()); // p_paddr
        out.extend_from_slice(&(code.len() as u32).to_le_bytes()); // p_filesz
        out.extend_from_slice(&(code.len() as u32).to_le_bytes()); // p_memsz
        out.extend_from_slice(&(PF_R | PF_W | PF_X).to_le_bytes()); // p_flags
        out.extend_from_slice(&0x1000u32.to_le_bytes()); // p_align
        assert_eq!(out.len(), file_off as usize);

        out.extend_from_slice(code);
        out
    }

    #[test]
    fn parses_a_minimal_image() {
        let bytes = tiny_elf(&[0x73, 0, 0, 0], 0x1_0000, 0x1_0000);
        let image = ElfImage::parse(&bytes).unwrap();
        assert_eq!(image.entry, 0x1_0000);
        assert_eq!(image.segments.len(), 1);
        let seg = image.segments[0];
        assert_eq!(seg.vaddr, 0x1_0000);
        assert_eq!(seg.file_size, 4);
        assert!(seg.read && seg.write && seg.exec);
    }

    #[test]
    fn rejects_wrong_machine() {
        let mut bytes = tiny_elf(&[0; 4], 0x1000, 0x1000);
        bytes[18] = 0x3e; // EM_X86_64
        bytes[19] = 0;
        assert!(matches!(
            ElfImage::parse(&bytes),
            Err(ElfError::WrongMachine(0x3e))
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(ElfImage::parse(b"not an elf"), Err(ElfError::Parse(_))));
    }
}
