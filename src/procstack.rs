//! Initial System V ABI process stack: `argc`/`argv`/`envp`/the auxiliary
//! vector, built on the guest's top-zone stack before its first instruction
//! runs.
//!
//! No file in the filtered original source builds this layout — the real
//! monitor's equivalent lives in the assembly/linker machinery already ruled
//! out of scope (`kvm::vm::VmFd::create_vcpu`'s doc comment). What follows is
//! the standard x86-64 Linux process-entry stack layout from `execve(2)` and
//! the System V ABI, not a port of any corpus file.

use crate::config::{INITIAL_STACK_SIZE, MIB};
use crate::elf::ElfImage;
use crate::error::KmError;
use crate::machine::Machine;

const AT_NULL: u64 = 0;
const AT_PHDR: u64 = 3;
const AT_PHENT: u64 = 4;
const AT_PHNUM: u64 = 5;
const AT_PAGESZ: u64 = 6;
const AT_BASE: u64 = 7;
const AT_ENTRY: u64 = 9;
const AT_SECURE: u64 = 23;
const AT_RANDOM: u64 = 25;
const AT_EXECFN: u64 = 31;

/// Keep the very top of the top zone unused so no auxv/string address is
/// ever exactly `GUEST_MEM_TOP_VA` (an exclusive bound elsewhere).
const TOP_GUARD: u64 = 4 * crate::config::PAGE_SIZE;

fn host_random_bytes() -> [u8; 16] {
    use std::io::Read;
    let mut buf = [0u8; 16];
    if let Ok(mut f) = std::fs::File::open("/dev/urandom") {
        if f.read_exact(&mut buf).is_ok() {
            return buf;
        }
    }
    // Startup is already a controlled, single-shot environment; AT_RANDOM
    // only needs to be present, not cryptographically strong, if the host
    // genuinely has no /dev/urandom.
    buf
}

fn push_cstr(machine: &Machine, cursor: &mut u64, bytes: &[u8]) -> Result<u64, KmError> {
    *cursor -= (bytes.len() + 1) as u64;
    machine.write_guest_gva(*cursor, bytes)?;
    machine.write_guest_gva(*cursor + bytes.len() as u64, &[0u8])?;
    Ok(*cursor)
}

fn push_u64(machine: &Machine, cursor: &mut u64, value: u64) -> Result<(), KmError> {
    machine.write_guest_gva(*cursor, &value.to_le_bytes())?;
    *cursor += 8;
    Ok(())
}

/// Reserve the stack region and write `argc`/`argv`/`envp`/auxv onto it,
/// returning the initial `rsp` (pointing at `argc`, per the ABI's
/// no-return-address process entry convention).
pub fn build(
    machine: &Machine,
    elf: &ElfImage,
    load_bias: u64,
    execfn: &str,
    argv: &[String],
    envp: &[String],
) -> Result<u64, KmError> {
    let top = machine.grow_stack(crate::config::GUEST_MEM_TOP_VA.saturating_sub(INITIAL_STACK_SIZE))?;
    debug_assert!(crate::config::GUEST_MEM_TOP_VA - top <= INITIAL_STACK_SIZE + MIB);

    let mut cursor = crate::config::GUEST_MEM_TOP_VA - TOP_GUARD;

    let random_bytes = host_random_bytes();
    cursor -= random_bytes.len() as u64;
    let random_addr = cursor;
    machine.write_guest_gva(random_addr, &random_bytes)?;

    let execfn_addr = push_cstr(machine, &mut cursor, execfn.as_bytes())?;

    let mut envp_addrs = Vec::with_capacity(envp.len());
    for var in envp {
        envp_addrs.push(push_cstr(machine, &mut cursor, var.as_bytes())?);
    }

    let mut argv_addrs = Vec::with_capacity(argv.len());
    for arg in argv {
        argv_addrs.push(push_cstr(machine, &mut cursor, arg.as_bytes())?);
    }

    cursor &= !0xf; // 16-byte align the boundary between strings and pointers

    let mut auxv: Vec<(u64, u64)> = vec![
        (AT_PHDR, elf.phdr_addr),
        (AT_PHENT, elf.phent_size as u64),
        (AT_PHNUM, elf.phnum as u64),
        (AT_PAGESZ, crate::config::PAGE_SIZE),
        (AT_ENTRY, elf.entry),
        (AT_SECURE, 0),
        (AT_RANDOM, random_addr),
        (AT_EXECFN, execfn_addr),
    ];
    if elf.is_pie {
        auxv.push((AT_BASE, load_bias));
    }
    auxv.push((AT_NULL, 0));

    let ptr_count = 1 // argc
        + argv_addrs.len() + 1 // argv[] + NULL
        + envp_addrs.len() + 1 // envp[] + NULL
        + auxv.len() * 2;
    let ptr_bytes = ptr_count as u64 * 8;

    let rsp = (cursor - ptr_bytes) & !0xf;
    let mut w = rsp;

    push_u64(machine, &mut w, argv.len() as u64)?;
    for addr in &argv_addrs {
        push_u64(machine, &mut w, *addr)?;
    }
    push_u64(machine, &mut w, 0)?;
    for addr in &envp_addrs {
        push_u64(machine, &mut w, *addr)?;
    }
    push_u64(machine, &mut w, 0)?;
    for (key, val) in &auxv {
        push_u64(machine, &mut w, *key)?;
        push_u64(machine, &mut w, *val)?;
    }

    Ok(rsp)
}
