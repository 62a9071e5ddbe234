//! Minimal x86-64 instruction decoder used to recover the guest-virtual
//! address behind an `EFAULT` from `KVM_RUN` (§4.D, ported from
//! `km_decode.c`'s `km_x86_decode_fault`).
//!
//! KVM reports page faults against the guest-physical address that actually
//! faulted, but `SIGSEGV` and the GDB stub want the guest-*virtual* address
//! the instruction referenced. Recovering it means decoding just enough of
//! the faulting instruction — legacy prefixes, `REX`, ModR/M, SIB, and the
//! displacement — to compute the effective address. This only needs to
//! handle the instruction shapes the guest's libc/runtime actually faults
//! on: `MOV`/`TEST`/`XCHG` with a ModR/M memory operand, and the `MOVS`
//! string instruction; anything else is left unresolved.

use kvm_bindings::kvm_regs;

/// Supplies instruction bytes at a guest-virtual address, returning `None`
/// when the address itself isn't mapped (decoding stops immediately).
pub trait GvaReader {
    fn read_u8(&self, gva: u64) -> Option<u8>;
}

/// Register file slice the decoder needs (general-purpose registers only —
/// no segment or flag state is read).
struct Instruction {
    failed_addr: Option<u64>,
    curip: u64,
    curbyte: u8,
    rex_w: bool,
    rex_r: bool,
    rex_x: bool,
    rex_b: bool,
    modrm_mode: u8,
    modrm_reg1: u8,
    modrm_reg2: u8,
    sib_present: bool,
    sib_scale: u8,
    sib_index: u8,
    sib_base: u8,
    disp: i64,
}

fn reg_value(regs: &kvm_regs, ext: bool, reg: u8) -> Option<u64> {
    let r = &regs;
    Some(match (ext, reg) {
        (false, 0) => r.rax,
        (false, 1) => r.rcx,
        (false, 2) => r.rdx,
        (false, 3) => r.rbx,
        (false, 4) => r.rsp,
        (false, 5) => r.rbp,
        (false, 6) => r.rsi,
        (false, 7) => r.rdi,
        (true, 0) => r.r8,
        (true, 1) => r.r9,
        (true, 2) => r.r10,
        (true, 3) => r.r11,
        (true, 4) => r.r12,
        (true, 5) => r.r13,
        (true, 6) => r.r14,
        (true, 7) => r.r15,
        _ => return None,
    })
}

fn consume_byte(mem: &dyn GvaReader, ins: &mut Instruction) {
    ins.curip += 1;
    get_byte(mem, ins);
}

fn get_byte(mem: &dyn GvaReader, ins: &mut Instruction) {
    match mem.read_u8(ins.curip) {
        Some(b) => ins.curbyte = b,
        None => ins.failed_addr = Some(ins.curip),
    }
}

/// Consume 0-byte legacy prefixes that precede the opcode we care about
/// (`km_decode.c: decode_legacy_prefixes`). Segment overrides and
/// operand/address-size prefixes don't change the addressing computation
/// for the opcodes this decoder handles, so they're skipped without effect.
fn decode_legacy_prefixes(mem: &dyn GvaReader, ins: &mut Instruction) {
    loop {
        match ins.curbyte {
            0x26 | 0x2e | 0x36 | 0x3e | 0x66 | 0x67 | 0x80..=0x83 | 0x8f | 0xc0 | 0xc1 | 0xc6
            | 0xc7 | 0xd0..=0xd3 | 0xf0 | 0xf2 | 0xf3 | 0xf6 | 0xf7 | 0xfe | 0xff => {
                consume_byte(mem, ins);
                if ins.failed_addr.is_some() {
                    return;
                }
            }
            _ => return,
        }
    }
}

fn decode_rex_prefix(mem: &dyn GvaReader, ins: &mut Instruction) {
    if ins.curbyte & 0xf0 != 0x40 {
        return;
    }
    ins.rex_w = ins.curbyte & 0x08 != 0;
    ins.rex_r = ins.curbyte & 0x04 != 0;
    ins.rex_x = ins.curbyte & 0x02 != 0;
    ins.rex_b = ins.curbyte & 0x01 != 0;
    consume_byte(mem, ins);
}

fn is_mem_source(opcode: u8) -> bool {
    opcode & 0xfe == 0x8a
}

fn decode_opcode(mem: &dyn GvaReader, regs: &kvm_regs, ins: &mut Instruction) {
    if ins.failed_addr.is_some() {
        return;
    }
    let opcode = ins.curbyte;
    consume_byte(mem, ins);
    if ins.failed_addr.is_some() {
        return;
    }

    if (0x84..=0x8b).contains(&opcode) {
        ins.modrm_mode = (ins.curbyte >> 6) & 0x03;
        ins.modrm_reg1 = (ins.curbyte >> 3) & 0x07;
        ins.modrm_reg2 = ins.curbyte & 0x07;
        consume_byte(mem, ins);
        if ins.failed_addr.is_some() {
            return;
        }
        if ins.modrm_mode == 0x03 {
            return; // register-to-register, no memory operand
        }
        if ins.modrm_reg2 == 0x04 {
            ins.sib_present = true;
            ins.sib_scale = (ins.curbyte >> 6) & 0x03;
            ins.sib_index = (ins.curbyte >> 3) & 0x07;
            ins.sib_base = ins.curbyte & 0x07;
            consume_byte(mem, ins);
            if ins.failed_addr.is_some() {
                return;
            }
        }
        match ins.modrm_mode {
            0 => {}
            1 => {
                ins.disp = ins.curbyte as i8 as i64;
                consume_byte(mem, ins);
                if ins.failed_addr.is_some() {
                    return;
                }
            }
            2 => {
                let mut bytes = [0u8; 4];
                for b in &mut bytes {
                    *b = ins.curbyte;
                    consume_byte(mem, ins);
                    if ins.failed_addr.is_some() {
                        return;
                    }
                }
                ins.disp = i32::from_le_bytes(bytes) as i64;
            }
            3 => return,
            _ => unreachable!(),
        }

        if !ins.sib_present {
            let regp = if is_mem_source(opcode) {
                reg_value(regs, ins.rex_r, ins.modrm_reg1)
            } else {
                reg_value(regs, ins.rex_b, ins.modrm_reg2)
            };
            if let Some(base) = regp {
                ins.failed_addr = Some(base.wrapping_add(ins.disp as u64));
            }
            return;
        }

        if let (Some(base), Some(index)) = (
            reg_value(regs, ins.rex_b, ins.sib_base),
            reg_value(regs, ins.rex_x, ins.sib_index),
        ) {
            let scale = 1u64 << ins.sib_scale;
            ins.failed_addr =
                Some(base.wrapping_add(index.wrapping_mul(scale)).wrapping_add(ins.disp as u64));
        }
    } else if opcode == 0xa5 {
        // MOVS/MOVSW/MOVSD/MOVSQ: address is whichever of RSI/RDI actually
        // faults; without a fault-direction hint we report the source.
        ins.failed_addr = Some(regs.rsi);
    }
}

/// Decode the instruction at `rip` far enough to recover the guest-virtual
/// address it referenced, or `None` if the decoder doesn't recognize the
/// opcode (§4.D "recover the GVA... or surface the raw GPA unresolved").
pub fn decode_fault_address(mem: &dyn GvaReader, regs: &kvm_regs, rip: u64) -> Option<u64> {
    let mut ins = Instruction {
        failed_addr: None,
        curip: rip,
        curbyte: 0,
        rex_w: false,
        rex_r: false,
        rex_x: false,
        rex_b: false,
        modrm_mode: 0,
        modrm_reg1: 0,
        modrm_reg2: 0,
        sib_present: false,
        sib_scale: 0,
        sib_index: 0,
        sib_base: 0,
        disp: 0,
    };
    get_byte(mem, &mut ins);
    if ins.failed_addr.is_some() {
        return ins.failed_addr;
    }
    decode_legacy_prefixes(mem, &mut ins);
    if ins.failed_addr.is_some() {
        return ins.failed_addr;
    }
    decode_rex_prefix(mem, &mut ins);
    if ins.failed_addr.is_some() {
        return ins.failed_addr;
    }
    decode_opcode(mem, regs, &mut ins);
    ins.failed_addr
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeMem(HashMap<u64, u8>);
    impl GvaReader for FakeMem {
        fn read_u8(&self, gva: u64) -> Option<u8> {
            self.0.get(&gva).copied()
        }
    }

    fn regs() -> kvm_regs {
        kvm_regs {
            rax: 0x1000,
            rbx: 0x2000,
            ..Default::default()
        }
    }

    #[test]
    fn decodes_mov_reg_indirect_with_8bit_disp() {
        // 48 8b 43 10  => mov rax, [rbx+0x10]
        let bytes = [0x48u8, 0x8b, 0x43, 0x10];
        let mem = FakeMem(bytes.iter().enumerate().map(|(i, b)| (i as u64, *b)).collect());
        let addr = decode_fault_address(&mem, &regs(), 0).unwrap();
        assert_eq!(addr, 0x2010);
    }

    #[test]
    fn register_to_register_has_no_memory_operand() {
        // 48 89 d8 => mov rax, rbx (mod=3)
        let bytes = [0x48u8, 0x89, 0xd8];
        let mem = FakeMem(bytes.iter().enumerate().map(|(i, b)| (i as u64, *b)).collect());
        assert_eq!(decode_fault_address(&mem, &regs(), 0), None);
    }

    #[test]
    fn unmapped_rip_fails_immediately() {
        let mem = FakeMem(HashMap::new());
        assert_eq!(decode_fault_address(&mem, &regs(), 0x1234), Some(0x1234));
    }
}
