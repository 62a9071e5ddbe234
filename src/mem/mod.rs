//! Guest physical memory management (§4.A, §4.B, §4.C).
//!
//! Generalizes `carbon::boot::memory::GuestMemory` (a single fixed-size
//! `vm_memory::GuestMemoryMmap` region) into the monitor's "memreg" model: a
//! fixed `KM_MEM_SLOTS`-entry table of geometrically-sized regions that grow
//! and shrink as the guest calls `brk`/`mmap`, each one registered as its own
//! KVM memory slot so the guest-physical-to-host mapping stays contiguous
//! without ever having to `mremap` a single giant region.

pub mod heap;
pub mod pagetable;
pub mod region;

pub use heap::Heap;
pub use pagetable::PageTableBuilder;
pub use region::{GuestMemory, RegionTable};

use thiserror::Error;

/// Errors from guest memory setup and the brk/tbrk heap operations.
#[derive(Error, Debug)]
pub enum MemError {
    #[error("failed to map guest memory: {0}")]
    Mmap(#[source] std::io::Error),

    #[error("guest memory access out of bounds at {0:#x}")]
    OutOfBounds(u64),

    #[error("no free memreg slots (all {0} slots in use)")]
    SlotTableFull(usize),

    #[error("requested brk/tbrk would exceed guest virtual address space")]
    OutOfAddressSpace,

    #[error("guest physical memory below the {0} GiB minimum")]
    BelowMinimumPhysmem(u64),

    #[error("failed to register KVM memory slot: {0}")]
    Kvm(#[from] crate::kvm::KvmError),
}
