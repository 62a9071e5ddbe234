//! ELF payload loading (§1 "out of scope, treated as an external
//! collaborator... only the contract is specified"; §6).
//!
//! The loader itself is a thin wrapper around `goblin`; what this module
//! actually specifies is the *contract* between the loader and the memory
//! manager — [`ElfTarget`] is implemented by `Machine`, so loading a payload
//! never has to know about KVM slots or page tables directly, the same
//! dependency direction `crate::mem` and `crate::hypercall` already follow.

use goblin::elf::{program_header::PT_LOAD, Elf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ElfError {
    #[error("failed to parse ELF payload: {0}")]
    Parse(#[from] goblin::error::Error),

    #[error("payload is not a 64-bit little-endian executable")]
    UnsupportedFormat,

    #[error("payload requests a base address overlapping the monitor's reserved region")]
    OverlapsReserved,

    #[error("failed to map a PT_LOAD segment: {0}")]
    Map(String),
}

/// What the loader needs from the memory manager to place a payload in
/// guest-physical/virtual space. `Machine` implements this atop
/// `mem::Heap`/`mem::RegionTable`/`mem::PageTableBuilder`.
pub trait ElfTarget {
    /// Ensure `[start, start+len)` (guest-virtual, bottom zone) is mapped
    /// and writable, growing `brk` if necessary.
    fn ensure_mapped(&mut self, start: u64, len: u64) -> Result<(), String>;
    /// Write `data` at guest-virtual `addr`.
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), String>;
    /// Zero-fill `[addr, addr+len)` (for `.bss`-style PT_LOAD tail).
    fn zero(&mut self, addr: u64, len: u64) -> Result<(), String>;
}

/// Auxiliary-vector-relevant facts about a loaded image (System V ABI
/// `AT_PHDR`/`AT_PHENT`/`AT_PHNUM`/`AT_ENTRY`; also what the GDB stub's
/// `AT_DYNLINK` wait mode needs to find the dynamic linker's entry point).
#[derive(Debug, Clone, Copy)]
pub struct ElfImage {
    pub entry: u64,
    pub phdr_addr: u64,
    pub phent_size: u16,
    pub phnum: u16,
    pub is_pie: bool,
    pub interpreter_entry: Option<u64>,
}

/// Load `bytes` (a statically- or dynamically-linked payload) into guest
/// memory through `target`, returning the facts needed to build the auxv
/// and, for PIE/dynamic payloads, to plant the `AT_START` breakpoint.
pub fn load(bytes: &[u8], base: u64, target: &mut dyn ElfTarget) -> Result<ElfImage, ElfError> {
    let elf = Elf::parse(bytes)?;
    if !elf.is_64 || !elf.little_endian {
        return Err(ElfError::UnsupportedFormat);
    }

    let is_pie = elf.header.e_type == goblin::elf::header::ET_DYN;
    let load_bias = if is_pie { base } else { 0 };

    let mut phdr_addr = 0u64;
    for phdr in &elf.program_headers {
        if phdr.p_type != PT_LOAD {
            continue;
        }
        let vaddr = phdr.p_vaddr + load_bias;
        let memsz = phdr.p_memsz;
        let filesz = phdr.p_filesz;

        target
            .ensure_mapped(vaddr, memsz)
            .map_err(ElfError::Map)?;

        let file_start = phdr.p_offset as usize;
        let file_end = file_start + filesz as usize;
        let segment_data = bytes.get(file_start..file_end).unwrap_or(&[]);
        target.write(vaddr, segment_data).map_err(ElfError::Map)?;

        if memsz > filesz {
            target
                .zero(vaddr + filesz, memsz - filesz)
                .map_err(ElfError::Map)?;
        }

        // The program header table is conventionally covered by the first
        // PT_LOAD segment; recover its guest-virtual address from the ELF
        // header's file offset once we know the bias.
        if phdr.p_offset <= elf.header.e_phoff
            && elf.header.e_phoff < phdr.p_offset + filesz
        {
            phdr_addr = vaddr + (elf.header.e_phoff - phdr.p_offset);
        }
    }

    Ok(ElfImage {
        entry: elf.header.e_entry + load_bias,
        phdr_addr,
        phent_size: elf.header.e_phentsize,
        phnum: elf.header.e_phnum,
        is_pie,
        // A dynamically-linked payload's interpreter must be loaded
        // separately (out of scope here per §1); the monitor's `AT_START`
        // wait mode needs only to know that one exists.
        interpreter_entry: elf.interpreter.map(|_| 0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingTarget {
        mapped: RefCell<Vec<(u64, u64)>>,
        written: RefCell<Vec<(u64, usize)>>,
    }

    impl ElfTarget for RecordingTarget {
        fn ensure_mapped(&mut self, start: u64, len: u64) -> Result<(), String> {
            self.mapped.borrow_mut().push((start, len));
            Ok(())
        }
        fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), String> {
            self.written.borrow_mut().push((addr, data.len()));
            Ok(())
        }
        fn zero(&mut self, _addr: u64, _len: u64) -> Result<(), String> {
            Ok(())
        }
    }

    #[test]
    fn rejects_non_elf_input() {
        let mut target = RecordingTarget::default();
        let bytes = b"not an elf file";
        assert!(load(bytes, 0, &mut target).is_err());
    }
}
