//! Long-mode CPU bring-up for the payload's vCPUs (§4.E "Creation").
//!
//! Ported from `carbon::boot::paging::setup_cpu_regs`: build a GDT with a
//! 64-bit code/data/TSS descriptor, enable protected mode, paging, and long
//! mode, then load `rip`/`rsp`. Two differences from the original: the page
//! tables already exist (`Machine::init_page_tables` built them into the
//! reserved region before any vCPU was created, rather than this function
//! doing it inline), and the IDT is left at limit 0 and `EFER.SCE` stays
//! clear — see `kvm::vm::VmFd::create_vcpu`'s doc comment for why a guest
//! fault or `SYSCALL` triple-faults to a clean shutdown instead of reaching a
//! guest-resident handler.

use crate::config::{RSV_GDT_OFFSET, RSV_MEM_START, RSV_PML4_OFFSET};
use crate::error::KmError;
use crate::kvm::VcpuFd;
use crate::machine::Machine;
use kvm_bindings::{kvm_fpu, kvm_regs, kvm_segment};

const X86_CR0_PE: u64 = 0x1;
const X86_CR0_PG: u64 = 0x8000_0000;
const X86_CR4_PAE: u64 = 0x20;
const EFER_LME: u64 = 0x100;
const EFER_LMA: u64 = 0x400;

const GDT_CODE: u16 = 2;
const GDT_DATA: u16 = 3;
const GDT_TSS: u16 = 4;

/// Layout: 0x00 NULL, 0x08 reserved, 0x10 64-bit code, 0x18 data, 0x20 TSS.
const GDT_TABLE: [u64; 5] = [
    gdt_entry(0, 0, 0),
    gdt_entry(0, 0, 0),
    gdt_entry(0xa09b, 0, 0xfffff),
    gdt_entry(0xc093, 0, 0xfffff),
    gdt_entry(0x808b, 0, 0xfffff),
];

const fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    ((base as u64 & 0xff00_0000) << 32)
        | ((base as u64 & 0x00ff_ffff) << 16)
        | (limit as u64 & 0x0000_ffff)
        | (((limit as u64 & 0x000f_0000) >> 16) << 48)
        | ((flags as u64) << 40)
}

fn kvm_segment_from_gdt(entry: u64, table_index: u8) -> kvm_segment {
    kvm_segment {
        base: ((entry >> 16) & 0xff_ffff) | (((entry >> 56) & 0xff) << 24),
        limit: ((entry & 0xffff) | (((entry >> 48) & 0xf) << 16)) as u32,
        selector: u16::from(table_index) * 8,
        type_: ((entry >> 40) & 0xf) as u8,
        present: ((entry >> 47) & 0x1) as u8,
        dpl: ((entry >> 45) & 0x3) as u8,
        db: ((entry >> 54) & 0x1) as u8,
        s: ((entry >> 44) & 0x1) as u8,
        l: ((entry >> 53) & 0x1) as u8,
        g: ((entry >> 55) & 0x1) as u8,
        ..Default::default()
    }
}

/// Configure `vcpu`'s GDT, control registers, EFER, and general registers so
/// it starts executing at `entry` with stack pointer `rsp`.
pub fn setup_cpu_regs(vcpu: &VcpuFd, machine: &Machine, entry: u64, rsp: u64) -> Result<(), KmError> {
    let gdt_gpa = RSV_MEM_START + RSV_GDT_OFFSET;
    let gdt_bytes: &[u8] = unsafe {
        std::slice::from_raw_parts(GDT_TABLE.as_ptr() as *const u8, std::mem::size_of_val(&GDT_TABLE))
    };
    machine.write_guest(gdt_gpa, gdt_bytes)?;

    let fpu = kvm_fpu {
        fcw: 0x37f,
        mxcsr: 0x1f80,
        ..Default::default()
    };
    vcpu.set_fpu(&fpu)?;

    let code_seg = kvm_segment_from_gdt(GDT_TABLE[GDT_CODE as usize], GDT_CODE as u8);
    let data_seg = kvm_segment_from_gdt(GDT_TABLE[GDT_DATA as usize], GDT_DATA as u8);
    let tss_seg = kvm_segment_from_gdt(GDT_TABLE[GDT_TSS as usize], GDT_TSS as u8);

    let mut sregs = vcpu.get_sregs()?;
    sregs.gdt.base = gdt_gpa;
    sregs.gdt.limit = (std::mem::size_of_val(&GDT_TABLE) - 1) as u16;
    sregs.idt.base = 0;
    sregs.idt.limit = 0;

    sregs.cs = code_seg;
    sregs.ds = data_seg;
    sregs.es = data_seg;
    sregs.fs = data_seg;
    sregs.gs = data_seg;
    sregs.ss = data_seg;
    sregs.tr = tss_seg;

    sregs.cr0 |= X86_CR0_PE;
    sregs.efer |= EFER_LME | EFER_LMA;
    sregs.cr3 = RSV_MEM_START + RSV_PML4_OFFSET;
    sregs.cr4 |= X86_CR4_PAE;
    sregs.cr0 |= X86_CR0_PG;

    vcpu.set_sregs(&sregs)?;

    let regs = kvm_regs {
        rflags: 0x2,
        rip: entry,
        rsp,
        rbp: rsp,
        ..Default::default()
    };
    vcpu.set_regs(&regs)?;

    tracing::debug!(rip = entry, rsp, cr3 = sregs.cr3, "vcpu ready to run");
    Ok(())
}
