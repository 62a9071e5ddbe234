//! VM-level KVM operations: memory-slot registration and vCPU creation
//! (§4.A, §4.E).
//!
//! Unlike `carbon::kvm::VmFd`, this VM never creates an in-kernel IRQ chip
//! or PIT — the monitor has no interrupt controller to emulate, only the
//! hypercall/fault surface the guest's `SYSCALL`/exceptions exit through.

use super::{KvmError, VcpuFd};
use kvm_bindings::{kvm_msr_entry, kvm_userspace_memory_region, CpuId, Msrs};

/// MSR indices the monitor programs on every new vCPU (§4.E "get": "program
/// the SYSCALL MSRs (LSTAR pointing at the in-guest `__km_syscall_handler`)").
mod msr {
    pub const STAR: u32 = 0xc000_0081;
    pub const LSTAR: u32 = 0xc000_0082;
    pub const CSTAR: u32 = 0xc000_0083;
    pub const SYSCALL_MASK: u32 = 0xc000_0084;
    pub const KERNEL_GS_BASE: u32 = 0xc000_0102;
    pub const IA32_TSC: u32 = 0x10;
}

/// Wrapper around the KVM VM file descriptor.
pub struct VmFd {
    vm: kvm_ioctls::VmFd,
    cpuid: CpuId,
}

impl VmFd {
    pub fn new(vm: kvm_ioctls::VmFd, cpuid: CpuId) -> Self {
        Self { vm, cpuid }
    }

    /// Register a guest memory region (§4.A `alloc`). `slot` indexes the
    /// fixed `KM_MEM_SLOTS`-entry table; passing `memory_size: 0` unplugs a
    /// previously registered slot (§4.A `free`).
    ///
    /// # Safety
    ///
    /// `userspace_addr` must point at host memory of at least `memory_size`
    /// bytes that remains valid (not freed or remapped) for as long as the
    /// slot stays registered.
    pub unsafe fn set_user_memory_region(
        &self,
        slot: u32,
        guest_addr: u64,
        memory_size: u64,
        userspace_addr: u64,
    ) -> Result<(), KvmError> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_addr,
            memory_size,
            userspace_addr,
            flags: 0,
        };
        unsafe {
            self.vm
                .set_user_memory_region(region)
                .map_err(KvmError::SetMemoryRegion)
        }
    }

    /// Create vCPU `id`, apply CPUID, and program the boot MSRs (§4.E "get").
    ///
    /// `lstar` is the guest-virtual address the original monitor's
    /// `__km_syscall_handler`/interrupt-gate stubs live at — small
    /// assembly routines the *monitor's own binary* maps into guest space
    /// (`km_guest.h`'s `.km_guest_text` section), not something the payload
    /// supplies. That mapped-in runtime is out of this core's scope (§1:
    /// only the memory-manager/hypercall contract is specified), so `lstar`
    /// here is a placeholder GVA with nothing mapped behind it: `EFER.SCE`
    /// is left clear, so `SYSCALL` always raises `#UD` and falls to
    /// whatever the guest's IDT points at for vector 6. With no guest-side
    /// handler mapped either, that currently triple-faults to
    /// `KVM_EXIT_SHUTDOWN`, which `run_vcpu` already treats as a clean exit.
    pub fn create_vcpu(&self, id: u64, lstar: u64, is_bsp: bool) -> Result<VcpuFd, KvmError> {
        let vcpu = self.vm.create_vcpu(id).map_err(KvmError::CreateVcpu)?;
        vcpu.set_cpuid2(&self.cpuid).map_err(KvmError::SetCpuid)?;

        let msr_entry = |index: u32, data: u64| kvm_msr_entry {
            index,
            data,
            ..Default::default()
        };
        let mut entries = vec![
            msr_entry(msr::STAR, 0),
            msr_entry(msr::CSTAR, 0),
            msr_entry(msr::SYSCALL_MASK, 0x0003_0700), // mask TF/IF/DF on entry
            msr_entry(msr::LSTAR, lstar),
            msr_entry(msr::KERNEL_GS_BASE, 0),
        ];
        if is_bsp {
            entries.push(msr_entry(msr::IA32_TSC, 0));
        }
        let msrs = Msrs::from_entries(&entries).map_err(|_| {
            KvmError::SetMsrs(kvm_ioctls::Error::new(libc::EINVAL))
        })?;
        vcpu.set_msrs(&msrs).map_err(KvmError::SetMsrs)?;

        tracing::debug!(vcpu_id = id, lstar, "vCPU created and MSRs programmed");
        Ok(VcpuFd::new(vcpu))
    }
}
