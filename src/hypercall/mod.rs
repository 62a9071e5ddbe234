//! Hypercall dispatch table (§4.G).
//!
//! The guest never calls these directly; a `OUT` on `KM_HCALL_PORT_BASE +
//! hc_no` traps into the run loop (§4.F), which looks the index up here.
//! Handlers operate through [`HypercallContext`] rather than on concrete
//! `Machine`/`VcpuFd` types, so this module stays ignorant of KVM the same
//! way `crate::mem` stays ignorant of it — the trait is the "small
//! interface" the §9 design note asks for instead of a driver-specific
//! inheritance hierarchy.

pub mod handlers;
pub mod table;

pub use table::{errno_ret, HcArgs, HcResult, HypercallContext, HypercallTable};
