//! Synthetic signal frame construction and `sigreturn` unwinding (§4.H
//! "Delivery", "Sigreturn"; §9 "Signal-frame layout" — this layout is the
//! ABI between the monitor and the in-guest trampoline and must stay
//! bit-for-bit stable across versions).
//!
//! Layout, low to high address:
//!
//! ```text
//! +0   return_addr        (8 bytes, guest-virtual address of __km_sigreturn
//!                           or sa_restorer)
//! +8   siginfo             (32 bytes: signo, errno, code, pad, addr, value)
//! +40  uc_flags            (8 bytes)
//! +48  uc_sigmask          (8 bytes)
//! +56  uc_mcontext.gregs   (23 * 8 bytes, in kernel sigcontext order)
//! +240 uc_mcontext.rflags  (8 bytes; the gregs array proper excludes rflags
//!                           in the kernel layout, so it is carried alongside)
//! +248 fpregs              (512 bytes, FXSAVE area)
//! ```
//!
//! The monitor only needs to round-trip this structure through its own
//! trampoline, so field order is chosen for simplicity rather than matching
//! glibc's `ucontext_t` verbatim; what must be preserved is that
//! `deliver_signal` and `sigreturn` agree on it.

use super::sigset::SigSet;
use super::SignalError;
use crate::mem::GuestMemory;
use kvm_bindings::kvm_regs;

pub const SIGINFO_SIZE: u64 = 32;
pub const GREGS_COUNT: u64 = 23;
pub const FRAME_SIZE: u64 = 8 + SIGINFO_SIZE + 8 + 8 + GREGS_COUNT * 8 + 8 + 512;

/// Offsets of each gregs slot, matching the kernel's `sigcontext` order
/// (`R8..R15, RDI, RSI, RBP, RBX, RDX, RAX, RCX, RSP, RIP, ...`). Only the
/// registers this monitor actually restores are listed; the remainder of
/// the 23-slot array is reserved (segment selectors, trap/err numbers).
mod greg {
    pub const R8: u64 = 0;
    pub const R9: u64 = 1;
    pub const R10: u64 = 2;
    pub const R11: u64 = 3;
    pub const R12: u64 = 4;
    pub const R13: u64 = 5;
    pub const R14: u64 = 6;
    pub const R15: u64 = 7;
    pub const RDI: u64 = 8;
    pub const RSI: u64 = 9;
    pub const RBP: u64 = 10;
    pub const RBX: u64 = 11;
    pub const RDX: u64 = 12;
    pub const RAX: u64 = 13;
    pub const RCX: u64 = 14;
    pub const RSP: u64 = 15;
    pub const RIP: u64 = 16;
}

/// Parameters needed to build a signal-delivery frame for one VCPU.
pub struct FrameInput {
    pub signo: i32,
    pub code: i32,
    pub faulting_address: u64,
    pub value: u64,
    pub handler: u64,
    pub restorer: u64,
    pub regs: kvm_regs,
    pub rflags: u64,
    pub mask_before: SigSet,
}

/// Result of building a frame: the new register values the caller must
/// write back with `VcpuFd::set_regs`.
pub struct FrameOutput {
    pub rip: u64,
    pub rsp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
}

/// Choose the stack the frame is written onto (§4.H "Choose stack").
pub fn select_stack(current_rsp: u64, altstack: Option<(u64, u64)>, use_onstack: bool) -> u64 {
    if use_onstack {
        if let Some((base, size)) = altstack {
            let top = base + size;
            let already_on_altstack = current_rsp > base && current_rsp <= top;
            if !already_on_altstack {
                return top;
            }
        }
    }
    current_rsp.wrapping_sub(128) // skip the red zone
}

/// Build the frame in guest memory and return the registers the VCPU should
/// resume with (§4.H "Delivery").
pub fn build_frame(mem: &GuestMemory, input: &FrameInput, stack_top: u64) -> Result<FrameOutput, SignalError> {
    // Align to 16n+8, matching the SysV ABI's stack alignment at function
    // entry (the call instruction itself would have pushed the 8).
    let candidate = stack_top.saturating_sub(FRAME_SIZE) & !0xf_u64;
    let frame_addr = candidate + 8;

    mem.write_u64(frame_addr, input.restorer)
        .map_err(SignalError::Mem)?;

    let info_addr = frame_addr + 8;
    mem.write_u64(info_addr, input.signo as u64).map_err(SignalError::Mem)?;
    mem.write_u64(info_addr + 8, input.code as u64).map_err(SignalError::Mem)?;
    mem.write_u64(info_addr + 16, input.faulting_address).map_err(SignalError::Mem)?;
    mem.write_u64(info_addr + 24, input.value).map_err(SignalError::Mem)?;

    let uc_addr = info_addr + SIGINFO_SIZE;
    mem.write_u64(uc_addr, 0).map_err(SignalError::Mem)?; // uc_flags
    mem.write_u64(uc_addr + 8, input.mask_before.bits())
        .map_err(SignalError::Mem)?;

    let gregs_addr = uc_addr + 16;
    let w = |slot: u64, val: u64| mem.write_u64(gregs_addr + slot * 8, val);
    w(greg::R8, input.regs.r8).map_err(SignalError::Mem)?;
    w(greg::R9, input.regs.r9).map_err(SignalError::Mem)?;
    w(greg::R10, input.regs.r10).map_err(SignalError::Mem)?;
    w(greg::R11, input.regs.r11).map_err(SignalError::Mem)?;
    w(greg::R12, input.regs.r12).map_err(SignalError::Mem)?;
    w(greg::R13, input.regs.r13).map_err(SignalError::Mem)?;
    w(greg::R14, input.regs.r14).map_err(SignalError::Mem)?;
    w(greg::R15, input.regs.r15).map_err(SignalError::Mem)?;
    w(greg::RDI, input.regs.rdi).map_err(SignalError::Mem)?;
    w(greg::RSI, input.regs.rsi).map_err(SignalError::Mem)?;
    w(greg::RBP, input.regs.rbp).map_err(SignalError::Mem)?;
    w(greg::RBX, input.regs.rbx).map_err(SignalError::Mem)?;
    w(greg::RDX, input.regs.rdx).map_err(SignalError::Mem)?;
    w(greg::RAX, input.regs.rax).map_err(SignalError::Mem)?;
    w(greg::RCX, input.regs.rcx).map_err(SignalError::Mem)?;
    w(greg::RSP, input.regs.rsp).map_err(SignalError::Mem)?;
    w(greg::RIP, input.regs.rip).map_err(SignalError::Mem)?;

    let rflags_addr = gregs_addr + GREGS_COUNT * 8;
    mem.write_u64(rflags_addr, input.rflags).map_err(SignalError::Mem)?;
    // The 512-byte FXSAVE region that follows is left zeroed; the monitor
    // does not model guest FP state beyond what the driver itself restores.

    Ok(FrameOutput {
        rip: input.handler,
        rsp: frame_addr,
        rdi: input.signo as u64,
        rsi: info_addr,
        rdx: uc_addr,
    })
}

/// Registers and mask recovered from a frame at `sigreturn` time (§4.H
/// "Sigreturn").
pub struct UnwoundFrame {
    pub regs: kvm_regs,
    pub rflags: u64,
    pub mask: SigSet,
}

/// Read back a frame at `frame_addr` (the monitor derives this from the
/// current RSP, accounting for the hypercall-args block the `SYSCALL` entry
/// pushed ahead of it).
pub fn unwind_frame(mem: &GuestMemory, frame_addr: u64) -> Result<UnwoundFrame, SignalError> {
    let uc_addr = frame_addr + 8 + SIGINFO_SIZE;
    let mask = SigSet::from_bits(mem.read_u64(uc_addr + 8).map_err(SignalError::Mem)?);

    let gregs_addr = uc_addr + 16;
    let r = |slot: u64| mem.read_u64(gregs_addr + slot * 8).map_err(SignalError::Mem);

    let regs = kvm_regs {
        r8: r(greg::R8)?,
        r9: r(greg::R9)?,
        r10: r(greg::R10)?,
        r11: r(greg::R11)?,
        r12: r(greg::R12)?,
        r13: r(greg::R13)?,
        r14: r(greg::R14)?,
        r15: r(greg::R15)?,
        rdi: r(greg::RDI)?,
        rsi: r(greg::RSI)?,
        rbp: r(greg::RBP)?,
        rbx: r(greg::RBX)?,
        rdx: r(greg::RDX)?,
        rax: r(greg::RAX)?,
        rcx: r(greg::RCX)?,
        rsp: r(greg::RSP)?,
        rip: r(greg::RIP)?,
        ..Default::default()
    };
    let rflags = mem
        .read_u64(gregs_addr + GREGS_COUNT * 8)
        .map_err(SignalError::Mem)?;

    Ok(UnwoundFrame { regs, rflags, mask })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_regs() -> kvm_regs {
        kvm_regs {
            rax: 1,
            rbx: 2,
            rcx: 3,
            rdx: 4,
            rsi: 5,
            rdi: 6,
            rsp: 0x1000,
            rbp: 7,
            rip: 0x4000,
            r8: 8,
            r9: 9,
            r10: 10,
            r11: 11,
            r12: 12,
            r13: 13,
            r14: 14,
            r15: 15,
            ..Default::default()
        }
    }

    #[test]
    fn frame_roundtrips_registers_and_mask() {
        let mut mem = GuestMemory::new();
        mem.map_region(0x10000, 0x10000).unwrap();

        let mut mask = SigSet::empty();
        mask.add(libc::SIGUSR1);

        let input = FrameInput {
            signo: libc::SIGUSR1,
            code: 0,
            faulting_address: 0,
            value: 0,
            handler: 0x5000,
            restorer: 0x6000,
            regs: sample_regs(),
            rflags: 0x202,
            mask_before: mask,
        };
        let stack_top = 0x18000;
        let out = build_frame(&mem, &input, stack_top).unwrap();
        assert_eq!(out.rip, 0x5000);

        let unwound = unwind_frame(&mem, out.rsp).unwrap();
        assert_eq!(unwound.regs.rax, 1);
        assert_eq!(unwound.regs.rip, 0x4000);
        assert_eq!(unwound.rflags, 0x202);
        assert!(unwound.mask.is_member(libc::SIGUSR1));
    }

    #[test]
    fn select_stack_prefers_altstack_when_onstack() {
        let rsp = select_stack(0x2000, Some((0x8000, 0x2000)), true);
        assert_eq!(rsp, 0xa000);
    }

    #[test]
    fn select_stack_falls_back_to_red_zone() {
        let rsp = select_stack(0x2000, None, true);
        assert_eq!(rsp, 0x2000 - 128);
    }
}
