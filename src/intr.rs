//! Guest exception → POSIX signal translation (§4.I).
//!
//! Entered from the hypercall dispatch table via `HC_guest_interrupt`: the
//! guest's interrupt stub pushes the vector (and, for vectors that carry
//! one, the CPU error code) before issuing the hypercall, then this handler
//! maps that vector onto a [`SignalRecord`] the run loop posts at the end of
//! its current iteration. `HC_guest_interrupt` itself never asks the run
//! loop to stop the VCPU — delivery happens through the normal signal path.

use crate::decode::{decode_fault_address, GvaReader};
use crate::signal::{SignalRecord, SI_KERNEL};
use kvm_bindings::kvm_regs;

/// AMD64 ABI exception vectors this monitor translates (table 3.1).
pub mod vector {
    pub const DIVIDE_ERROR: u64 = 0;
    pub const DEBUG: u64 = 1;
    pub const BREAKPOINT: u64 = 3;
    pub const OVERFLOW: u64 = 4;
    pub const BOUND_RANGE: u64 = 5;
    pub const INVALID_OPCODE: u64 = 6;
    pub const DEVICE_NOT_AVAILABLE: u64 = 7;
    pub const DOUBLE_FAULT: u64 = 8;
    pub const INVALID_TSS: u64 = 10;
    pub const SEGMENT_NOT_PRESENT: u64 = 11;
    pub const STACK_FAULT: u64 = 12;
    pub const GENERAL_PROTECTION: u64 = 13;
    pub const PAGE_FAULT: u64 = 14;
    pub const FPU_ERROR: u64 = 16;
    pub const ALIGNMENT_CHECK: u64 = 17;
    pub const MACHINE_CHECK: u64 = 18;
    pub const SIMD_FP: u64 = 19;
}

/// The guest interrupt frame `HC_guest_interrupt`'s stub pushes before
/// trapping to the monitor.
#[derive(Debug, Clone, Copy)]
pub struct InterruptFrame {
    pub vector: u64,
    pub error_code: u64,
    /// CR2 at fault time, valid only for `#PF`.
    pub cr2: u64,
}

/// `0F 05` — the two-byte `SYSCALL` opcode the monitor emulates inline when
/// `#UD` fires on it (§4.I).
const SYSCALL_OPCODE: [u8; 2] = [0x0f, 0x05];

/// Outcome of translating a guest exception.
pub enum InterruptOutcome {
    /// A signal should be posted to the faulting VCPU.
    Signal(SignalRecord),
    /// `#UD` on a `SYSCALL` opcode: the caller should re-dispatch through
    /// the hypercall table using the Linux `SYSCALL` register convention
    /// (`rax=no, rdi,rsi,rdx,r10,r8,r9`) instead of posting a signal.
    EmulateSyscall,
}

/// Translate one guest exception into a signal (or a `SYSCALL` emulation
/// request), given the frame the interrupt stub captured, the VCPU's
/// current registers, and a way to read guest memory for the `#UD` opcode
/// check and the instruction decoder.
pub fn translate_exception(
    frame: &InterruptFrame,
    regs: &kvm_regs,
    mem: &dyn GvaReader,
) -> InterruptOutcome {
    let record = |signo: i32, faulting_address: u64| SignalRecord {
        signo,
        code: SI_KERNEL,
        sender_pid: 0,
        faulting_address,
        value: 0,
    };

    match frame.vector {
        vector::PAGE_FAULT => InterruptOutcome::Signal(record(libc::SIGSEGV, frame.cr2)),
        vector::GENERAL_PROTECTION => {
            let addr = decode_fault_address(mem, regs, regs.rip).unwrap_or(0);
            InterruptOutcome::Signal(record(libc::SIGSEGV, addr))
        }
        vector::INVALID_OPCODE => {
            let is_syscall = mem.read_u8(regs.rip) == Some(SYSCALL_OPCODE[0])
                && mem.read_u8(regs.rip + 1) == Some(SYSCALL_OPCODE[1]);
            if is_syscall {
                InterruptOutcome::EmulateSyscall
            } else {
                InterruptOutcome::Signal(record(libc::SIGILL, regs.rip))
            }
        }
        vector::DIVIDE_ERROR => InterruptOutcome::Signal(record(libc::SIGFPE, regs.rip)),
        vector::BOUND_RANGE | vector::FPU_ERROR | vector::SIMD_FP => {
            InterruptOutcome::Signal(record(libc::SIGFPE, regs.rip))
        }
        vector::BREAKPOINT | vector::DEBUG => InterruptOutcome::Signal(record(libc::SIGTRAP, regs.rip)),
        vector::STACK_FAULT | vector::SEGMENT_NOT_PRESENT | vector::INVALID_TSS => {
            InterruptOutcome::Signal(record(libc::SIGSEGV, regs.rip))
        }
        vector::ALIGNMENT_CHECK => InterruptOutcome::Signal(record(libc::SIGBUS, regs.rip)),
        vector::DOUBLE_FAULT | vector::MACHINE_CHECK | vector::DEVICE_NOT_AVAILABLE => {
            InterruptOutcome::Signal(record(libc::SIGSEGV, regs.rip))
        }
        _ => InterruptOutcome::Signal(record(libc::SIGILL, regs.rip)),
    }
}

/// Registers the Linux `SYSCALL` ABI maps a hypercall args block to, for the
/// `#UD`-on-`0F 05` emulation path.
pub struct SyscallArgs {
    pub no: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
}

pub fn syscall_args_from_regs(regs: &kvm_regs) -> SyscallArgs {
    SyscallArgs {
        no: regs.rax,
        a1: regs.rdi,
        a2: regs.rsi,
        a3: regs.rdx,
        a4: regs.r10,
        a5: regs.r8,
        a6: regs.r9,
    }
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

    #[test]
    fn page_fault_reports_cr2() {
        let frame = InterruptFrame {
            vector: vector::PAGE_FAULT,
            error_code: 0,
            cr2: 0xdead_b000,
        };
        let regs = kvm_regs::default();
        let mem = FakeMem(HashMap::new());
        match translate_exception(&frame, &regs, &mem) {
            InterruptOutcome::Signal(rec) => {
                assert_eq!(rec.signo, libc::SIGSEGV);
                assert_eq!(rec.faulting_address, 0xdead_b000);
            }
            _ => panic!("expected signal"),
        }
    }

    #[test]
    fn undefined_opcode_on_syscall_bytes_emulates() {
        let frame = InterruptFrame {
            vector: vector::INVALID_OPCODE,
            error_code: 0,
            cr2: 0,
        };
        let mut regs = kvm_regs::default();
        regs.rip = 0x1000;
        let mem = FakeMem(HashMap::from([(0x1000, 0x0f), (0x1001, 0x05)]));
        assert!(matches!(
            translate_exception(&frame, &regs, &mem),
            InterruptOutcome::EmulateSyscall
        ));
    }

    #[test]
    fn undefined_opcode_on_other_bytes_is_sigill() {
        let frame = InterruptFrame {
            vector: vector::INVALID_OPCODE,
            error_code: 0,
            cr2: 0,
        };
        let mut regs = kvm_regs::default();
        regs.rip = 0x2000;
        let mem = FakeMem(HashMap::from([(0x2000, 0xff)]));
        match translate_exception(&frame, &regs, &mem) {
            InterruptOutcome::Signal(rec) => assert_eq!(rec.signo, libc::SIGILL),
            _ => panic!("expected signal"),
        }
    }
}
