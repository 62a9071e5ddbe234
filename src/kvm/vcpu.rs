//! vCPU register access and the raw `KVM_RUN` exit classification (§4.F).
//!
//! This is the bottom of the run loop: [`VcpuFd::run`] performs one
//! `KVM_RUN` and translates the kernel's exit reason into [`VcpuExit`]. The
//! run loop proper (pause handling, hypercall dispatch, signal draining)
//! lives in `crate::runloop`, the way `carbon`'s device-dispatch loop drives
//! `VcpuFd::run_with_io` from outside the KVM wrapper.

use super::KvmError;
use kvm_bindings::{kvm_fpu, kvm_guest_debug, kvm_regs, kvm_sregs, KVM_GUESTDBG_ENABLE, KVM_GUESTDBG_USE_HW_BP, KVM_GUESTDBG_SINGLESTEP};
use kvm_ioctls::VcpuExit as KvmVcpuExit;

/// Wrapper around the KVM vCPU file descriptor.
pub struct VcpuFd {
    vcpu: kvm_ioctls::VcpuFd,
}

/// I/O direction and payload of a `KVM_EXIT_IO` (§4.G hypercall preamble).
#[derive(Debug, Clone)]
pub struct IoExit {
    pub port: u16,
    pub size: u8,
    pub is_out: bool,
    /// The bytes written on an `OUT` (little-endian, zero-extended); the
    /// hypercall ABI packs the guest-physical address of the `HcArgs`
    /// struct here (§4.G).
    pub data: u64,
}

/// A `KVM_EXIT_DEBUG` event (§4.F "DEBUG" handling, §4.K breakpoints).
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugExit {
    pub pc: u64,
    pub dr6: u64,
    pub dr7: u64,
    pub exception: u32,
}

/// Exit reasons relevant to this monitor (a strict subset of
/// `kvm_ioctls::VcpuExit` — no MMIO/HLT handling, since the payload never
/// executes `HLT` and there are no MMIO devices to fault on).
#[derive(Debug)]
pub enum VcpuExit {
    Io(IoExit),
    Debug(DebugExit),
    Shutdown,
    InternalError,
    FailEntry(u64),
    Interrupted,
    Unknown(&'static str),
}

impl VcpuFd {
    pub fn new(vcpu: kvm_ioctls::VcpuFd) -> Self {
        Self { vcpu }
    }

    pub fn get_regs(&self) -> Result<kvm_regs, KvmError> {
        self.vcpu.get_regs().map_err(KvmError::GetRegisters)
    }

    pub fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError> {
        self.vcpu.set_regs(regs).map_err(KvmError::SetRegisters)
    }

    pub fn get_sregs(&self) -> Result<kvm_sregs, KvmError> {
        self.vcpu.get_sregs().map_err(KvmError::GetRegisters)
    }

    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError> {
        self.vcpu.set_sregs(sregs).map_err(KvmError::SetRegisters)
    }

    /// Set the initial x87/SSE control state (`km_cpu_init.c`'s FPU reset
    /// values — all exceptions masked, round-to-nearest, double precision).
    pub fn set_fpu(&self, fpu: &kvm_fpu) -> Result<(), KvmError> {
        self.vcpu.set_fpu(fpu).map_err(KvmError::SetFpu)
    }

    /// Program hardware breakpoints / single-step mode (§4.K "HW", §4.F DEBUG
    /// handling). `hw_bps` holds up to 4 `(addr, dr7_bits)` pairs already
    /// encoded by `crate::gdb::breakpoints`.
    pub fn set_guest_debug(&self, hw_bps: &[(u64, u32)], single_step: bool) -> Result<(), KvmError> {
        let mut dbg = kvm_guest_debug {
            control: KVM_GUESTDBG_ENABLE,
            ..Default::default()
        };
        if single_step {
            dbg.control |= KVM_GUESTDBG_SINGLESTEP;
        }
        if !hw_bps.is_empty() {
            dbg.control |= KVM_GUESTDBG_USE_HW_BP;
            let mut dr7: u64 = 0x400; // reserved bit 10 always set
            for (i, (addr, bits)) in hw_bps.iter().enumerate().take(4) {
                dbg.arch.debugreg[i] = *addr;
                dr7 |= (*bits as u64) << (16 + i * 4); // condition+len
                dr7 |= 1 << (i * 2); // local enable
            }
            dbg.arch.debugreg[7] = dr7;
        }
        self.vcpu
            .set_guest_debug(&dbg)
            .map_err(KvmError::SetGuestDebug)
    }

    /// Run until the next exit and classify it (§4.F run loop body).
    pub fn run(&mut self) -> Result<VcpuExit, KvmError> {
        match self.vcpu.run() {
            Ok(KvmVcpuExit::IoIn(port, _data)) => Ok(VcpuExit::Io(IoExit {
                port,
                size: 0,
                is_out: false,
                data: 0,
            })),
            Ok(KvmVcpuExit::IoOut(port, data)) => Ok(VcpuExit::Io(IoExit {
                port,
                size: data.len() as u8,
                is_out: true,
                data: le_bytes_to_u64(data),
            })),
            Ok(KvmVcpuExit::Debug(dbg)) => Ok(VcpuExit::Debug(DebugExit {
                pc: dbg.pc,
                dr6: dbg.dr6,
                dr7: dbg.dr7,
                exception: dbg.exception,
            })),
            Ok(KvmVcpuExit::Shutdown) => Ok(VcpuExit::Shutdown),
            Ok(KvmVcpuExit::InternalError) => Ok(VcpuExit::InternalError),
            Ok(KvmVcpuExit::FailEntry(reason, _cpu)) => Ok(VcpuExit::FailEntry(reason)),
            Ok(other) => Ok(VcpuExit::Unknown(exit_name(&other))),
            Err(e) if e.errno() == libc::EINTR => Ok(VcpuExit::Interrupted),
            Err(e) => Err(KvmError::Run(e)),
        }
    }
}

fn le_bytes_to_u64(data: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..data.len().min(8)].copy_from_slice(&data[..data.len().min(8)]);
    u64::from_le_bytes(buf)
}

fn exit_name(exit: &KvmVcpuExit) -> &'static str {
    match exit {
        KvmVcpuExit::Hlt => "Hlt",
        KvmVcpuExit::MmioRead(..) => "MmioRead",
        KvmVcpuExit::MmioWrite(..) => "MmioWrite",
        KvmVcpuExit::Hypercall(_) => "Hypercall",
        KvmVcpuExit::Exception => "Exception",
        KvmVcpuExit::IrqWindowOpen => "IrqWindowOpen",
        KvmVcpuExit::SystemEvent(..) => "SystemEvent",
        _ => "Other",
    }
}
