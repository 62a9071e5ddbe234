//! Compile-time constants and environment-variable plumbing.
//!
//! Mirrors the constants `km_mem.h`/`km.h` hardcode in the original monitor:
//! guest address-space layout, hypercall ABI, and the pool sizes that bound
//! VCPUs, memory slots, and signal records. Keeping them in one module (the
//! way `carbon::boot::layout` groups its boot-protocol addresses) makes the
//! full address map readable in one place.

/// Standard 4 KiB page.
pub const PAGE_SIZE: u64 = 0x1000;
pub const MIB: u64 = 1 << 20;
pub const GIB: u64 = 1 << 30;

/// Reserved guest-physical area holding the page-table hierarchy (§6).
pub const RSV_MEM_START: u64 = PAGE_SIZE;
pub const RSV_MEM_SIZE: u64 = PAGE_SIZE * 63;

/// Offsets within the reserved area for the page-table levels (§6: "PML4@page0,
/// PDPT@1, PDPT2@2, PD@3, PD2@4, PT@5").
pub const RSV_PML4_OFFSET: u64 = 0 * PAGE_SIZE;
pub const RSV_PDPT_OFFSET: u64 = 1 * PAGE_SIZE;
pub const RSV_PDPT2_OFFSET: u64 = 2 * PAGE_SIZE;
pub const RSV_PD_OFFSET: u64 = 3 * PAGE_SIZE;
pub const RSV_PD2_OFFSET: u64 = 4 * PAGE_SIZE;
pub const RSV_PT_OFFSET: u64 = 5 * PAGE_SIZE;

/// GDT for the payload's single initial vCPU, past the page-table levels
/// above (§4.E "Creation"). The IDT needs no offset of its own: it is left
/// at limit 0 (see `bringup::setup_cpu_regs`).
pub const RSV_GDT_OFFSET: u64 = 6 * PAGE_SIZE;

/// Size of the initial process stack reserved in the top zone before the
/// payload's first instruction runs (`crate::procstack`).
pub const INITIAL_STACK_SIZE: u64 = 8 * MIB;

/// Guest virtual-address constants (§6).
pub const GUEST_MEM_START_VA: u64 = 2 * MIB;
pub const GUEST_MEM_TOP_VA: u64 = 128 * 1024 * GIB - 2 * MIB;

/// Host side: guest-physical address `p` lives at `KM_USER_MEM_BASE + p`.
pub const KM_USER_MEM_BASE: u64 = 16 * 1024 * GIB;

/// Bounds from §3 (Machine/VCPU data model) and §6 (hypercall ABI).
pub const KM_MEM_SLOTS: usize = 64;
pub const KVM_MAX_VCPUS: usize = 288;
pub const KM_MAX_HCALL: usize = 512;
pub const HC_START: usize = KM_MAX_HCALL - 10;
pub const KM_HCALL_PORT_BASE: u16 = 0x8000;
pub const SIGNAL_FREE_POOL_SIZE: usize = 8;
pub const GDB_MAX_HW_BREAKPOINTS: usize = 4;
pub const PID_TABLE_SIZE: usize = 128;

/// Pause-poll back-off (§4.E, §5).
pub const PAUSE_POLL_INTERVAL_MS: u64 = 1;
pub const PAUSE_POLL_MAX_ITERATIONS: u32 = 100;

/// The real-time signal used to knock a VCPU thread out of a blocking
/// `KVM_RUN` (`KM_SIGVCPUSTOP`, §4.E, §5). `SIGRTMIN` is computed rather
/// than hardcoded since glibc reserves a varying number of low RT signals.
pub fn sigvcpustop() -> i32 {
    unsafe { libc::SIGRTMIN() }
}

/// Default GDB remote-serial-protocol port (§6).
pub const GDB_DEFAULT_PORT: u16 = 2159;
pub const GDB_PACKET_BUF_SIZE: usize = 16 * 1024;

/// Sentinel hypercall numbers occupying `[HC_START, KM_MAX_HCALL)` (§4.G, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SentinelHcall {
    GuestInterrupt = HC_START,
    Unmapself,
    Snapshot,
    SnapshotGetdata,
    SnapshotPutdata,
    /// `km_unittest.c`'s internal-invariant probe, wired in only under
    /// `cfg(test)` so test guests can assert monitor-side state without a
    /// production-visible hypercall number.
    Unittest,
}

/// Environment variables that change fork-child / GDB-attach behavior (§6).
pub mod env {
    /// Spin-block in each fork child until a debugger clears `keep_waiting`.
    pub const KM_WAIT_FOR_GDB_ATTACH: &str = "KM_WAIT_FOR_GDB_ATTACH";
    /// Require the gdb client to reattach after a fork in the child.
    pub const KM_GDB_CHILD_FORK_WAIT: &str = "KM_GDB_CHILD_FORK_WAIT";

    pub fn wait_for_gdb_attach() -> bool {
        std::env::var_os(KM_WAIT_FOR_GDB_ATTACH).is_some()
    }

    pub fn gdb_child_fork_wait() -> bool {
        std::env::var_os(KM_GDB_CHILD_FORK_WAIT).is_some()
    }
}
