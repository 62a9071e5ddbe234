//! Kernel virtualization driver wrapper (§4.E "Creation", §6 ioctl surface).
//!
//! Generalizes `carbon::kvm`: instead of booting a Linux kernel with an
//! in-kernel PIC/IOAPIC/PIT, this monitor runs a single payload thread per
//! VCPU and never routes hardware interrupts, so VM setup skips
//! `create_irq_chip`/`create_pit2`/`set_tss_address` entirely — none of the
//! original `km` ever calls them, since there is no legacy PC platform to
//! emulate, only a long-mode process.
//!
//! The driver is modeled as a small trait ([`DriverCaps`]) describing which
//! optional ioctls are available, matching the §9 design note: "express
//! [KVM vs. the alternative driver] as a tagged variant or a small trait
//! with two implementations, not inheritance." Only the KVM implementation
//! is provided here; the alternative driver's extra ioctls
//! (`KONTEXT_REUSE`, `GET_IDENTITY`, ...) are represented as an optional
//! capability probed at startup and left unimplemented (§6: "optional
//! operations exist when running on the alternative driver").

pub mod caps;
pub mod vcpu;
pub mod vm;

pub use caps::{CpuCaps, DriverCaps};
pub use vcpu::VcpuFd;
pub use vm::VmFd;

use kvm_bindings::KVM_MAX_CPUID_ENTRIES;
use kvm_ioctls::Kvm;
use thiserror::Error;

/// KVM's stable userspace API version (see `linux/kvm.h`); `GET_API_VERSION`
/// must echo this back or the monitor refuses to run (§4.E, §7 "Driver ioctl
/// failures at setup").
const KVM_API_VERSION: i32 = 12;

/// Errors from the virtualization driver, one variant per failing ioctl.
#[derive(Error, Debug)]
pub enum KvmError {
    #[error("failed to open the virtualization device: {0}")]
    OpenDevice(#[source] kvm_ioctls::Error),

    #[error("KVM API version mismatch")]
    ApiVersionMismatch,

    #[error("failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    #[error("failed to create vCPU: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    #[error("failed to register guest memory region: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),

    #[error("failed to get registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    #[error("failed to set registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    #[error("failed to get supported CPUID: {0}")]
    GetSupportedCpuid(#[source] kvm_ioctls::Error),

    #[error("failed to set CPUID: {0}")]
    SetCpuid(#[source] kvm_ioctls::Error),

    #[error("failed to set MSRs: {0}")]
    SetMsrs(#[source] kvm_ioctls::Error),

    #[error("failed to set FPU state: {0}")]
    SetFpu(#[source] kvm_ioctls::Error),

    #[error("failed to run vCPU: {0}")]
    Run(#[source] kvm_ioctls::Error),

    #[error("failed to set guest debug registers: {0}")]
    SetGuestDebug(#[source] kvm_ioctls::Error),

    #[error("KVM_RUN shared-memory region smaller than expected ({0} bytes)")]
    RunRegionTooSmall(usize),

    #[error("vCPU capacity ({0}) exceeded")]
    VcpuCapacityExceeded(usize),
}

/// Result of opening the driver and creating the VM object (§4.E "Creation").
pub struct Driver {
    pub vm: VmFd,
    pub caps: DriverCaps,
    pub cpu_caps: CpuCaps,
    pub run_region_size: usize,
}

/// Open `/dev/kvm`, verify the API version, create the VM, and collect the
/// capability/CPUID information later steps (page-table builder, MSR setup)
/// need.
pub fn open(force_pdpe1g: Option<bool>) -> Result<Driver, KvmError> {
    let kvm = Kvm::new().map_err(KvmError::OpenDevice)?;

    if kvm.get_api_version() != KVM_API_VERSION {
        return Err(KvmError::ApiVersionMismatch);
    }

    let run_region_size = kvm.get_vcpu_mmap_size().map_err(KvmError::CreateVm)?;
    if run_region_size < std::mem::size_of::<kvm_bindings::kvm_run>() {
        return Err(KvmError::RunRegionTooSmall(run_region_size));
    }

    let supported_cpuid = kvm
        .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
        .map_err(KvmError::GetSupportedCpuid)?;

    let cpu_caps = CpuCaps::from_supported_cpuid(&supported_cpuid);
    let patched_cpuid = cpu_caps.patch(supported_cpuid, force_pdpe1g);

    let vm_fd = kvm.create_vm().map_err(KvmError::CreateVm)?;
    let vm = VmFd::new(vm_fd, patched_cpuid);

    Ok(Driver {
        vm,
        caps: DriverCaps::kvm(),
        cpu_caps,
        run_region_size,
    })
}
