//! The 512-entry hypercall table and the args block it operates on (§4.F
//! "Hypercall preamble", §4.G, §6 "Hypercall ABI").

use crate::config::{HC_START, KM_MAX_HCALL};
use crate::mem::{GuestMemory, MemError};
use crate::signal::{SignalAction, SigSet};

/// What the run loop should do after a hypercall returns (§4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HcResult {
    Continue,
    Stop,
    AllStop,
    DoFork,
}

/// The `{ hc_ret, arg1..arg6 }` block the guest writes to its stack before
/// trapping (§6 "Hypercall ABI"). All fields are 8 bytes, little-endian.
#[derive(Debug, Clone, Copy, Default)]
pub struct HcArgs {
    pub hc_ret: i64,
    pub arg: [u64; 6],
}

impl HcArgs {
    pub const SIZE: u64 = 8 * 7;

    pub fn read(mem: &GuestMemory, gpa: u64) -> Result<Self, MemError> {
        let mut args = HcArgs::default();
        args.hc_ret = mem.read_u64(gpa)? as i64;
        for i in 0..6 {
            args.arg[i] = mem.read_u64(gpa + 8 + i as u64 * 8)?;
        }
        Ok(args)
    }

    pub fn write_ret(&self, mem: &GuestMemory, gpa: u64) -> Result<(), MemError> {
        mem.write_u64(gpa, self.hc_ret as u64)
    }
}

/// `-errno`, the convention every hypercall handler uses for failure
/// (§7 "Per-hypercall errors").
pub fn errno_ret(errno: i32) -> i64 {
    -(errno as i64)
}

/// Everything a hypercall handler needs from the rest of the monitor,
/// without naming `Machine` or `VcpuFd` concretely. `Machine` implements
/// this for the handlers registered in [`HypercallTable::with_linux_abi`].
pub trait HypercallContext {
    fn guest_mem(&self) -> &GuestMemory;

    /// Copy `len` bytes starting at guest-virtual `gva` into a host buffer
    /// the handler can hand to a real syscall (e.g. `write`'s payload).
    fn read_guest_bytes(&self, gva: u64, len: usize) -> Result<Vec<u8>, MemError>;
    fn write_guest_bytes(&mut self, gva: u64, data: &[u8]) -> Result<(), MemError>;

    /// §4.C: move `brk`/`tbrk`, wiring up any newly mapped memregs into the
    /// driver as a side effect. Returns the resulting boundary.
    fn set_brk(&mut self, target: u64) -> Result<u64, MemError>;
    fn set_tbrk(&mut self, target: u64) -> Result<u64, MemError>;
    fn current_brk(&self) -> u64;
    fn current_tbrk(&self) -> u64;

    fn sigaction(&mut self, signo: i32, new: Option<SignalAction>) -> Option<SignalAction>;
    fn sigprocmask(&mut self, how: i32, set: Option<SigSet>) -> SigSet;
    fn sigaltstack(
        &mut self,
        base: u64,
        size: u64,
        flags: i32,
    ) -> Result<(), crate::signal::SignalError>;

    /// Raw passthrough for host-visible fds (stdio and anything the guest
    /// opened via the fd-translation layer — out of scope here, see §6).
    fn host_write(&mut self, fd: i32, data: &[u8]) -> std::io::Result<usize>;
    fn host_read(&mut self, fd: i32, buf: &mut [u8]) -> std::io::Result<usize>;

    fn request_exit(&mut self, status: i32);
    /// `flags`/`child_stack` as passed to `clone(2)` (arg0/arg1); `0` for a
    /// plain `fork(2)`.
    fn request_fork(&mut self, flags: u64, child_stack: u64);

    /// Monitor-local pid namespace (`km_sid_pgid.c`): the payload's own pid.
    fn getpid(&self) -> i32;
    /// `setsid(2)`. Returns the new session id, or `-errno` on failure.
    fn setsid(&mut self) -> i64;
    /// `setpgid(2)`. `pid`/`pgid` of `0` mean "the caller".
    fn setpgid(&mut self, pid: i32, pgid: i32) -> i64;
    fn getpgid(&self, pid: i32) -> i64;
}

type HandlerFn = fn(&mut dyn HypercallContext, &mut HcArgs) -> HcResult;

/// Array of handlers indexed by hypercall number. Slots below
/// [`HC_START`](crate::config::HC_START) are Linux syscall numbers; slots at
/// or above it are monitor-internal (§4.G).
pub struct HypercallTable {
    handlers: Vec<Option<HandlerFn>>,
}

impl HypercallTable {
    pub fn empty() -> Self {
        HypercallTable {
            handlers: vec![None; KM_MAX_HCALL],
        }
    }

    pub fn register(&mut self, hc_no: usize, f: HandlerFn) {
        self.handlers[hc_no] = Some(f);
    }

    pub fn with_linux_abi() -> Self {
        let mut table = Self::empty();
        super::handlers::register_all(&mut table);
        table
    }

    /// Dispatch `hc_no`. An unregistered slot writes `-ENOSYS` and returns
    /// `Continue` (§8 "either the hypercall is unimplemented... or the
    /// handler returns in finite time").
    pub fn dispatch(
        &self,
        ctx: &mut dyn HypercallContext,
        hc_no: usize,
        args: &mut HcArgs,
    ) -> HcResult {
        match self.handlers.get(hc_no).copied().flatten() {
            Some(handler) => handler(ctx, args),
            None => {
                args.hc_ret = errno_ret(libc::ENOSYS);
                HcResult::Continue
            }
        }
    }
}

/// `hc_no` for a sentinel slot above [`HC_START`].
pub fn sentinel(offset: crate::config::SentinelHcall) -> usize {
    offset as usize
}

pub const MONITOR_HCALL_RANGE: std::ops::Range<usize> = HC_START..KM_MAX_HCALL;

#[cfg(test)]
mod tests {
    use super::*;

    struct NullCtx;
    impl HypercallContext for NullCtx {
        fn guest_mem(&self) -> &GuestMemory {
            unimplemented!()
        }
        fn read_guest_bytes(&self, _gva: u64, _len: usize) -> Result<Vec<u8>, MemError> {
            Ok(vec![])
        }
        fn write_guest_bytes(&mut self, _gva: u64, _data: &[u8]) -> Result<(), MemError> {
            Ok(())
        }
        fn set_brk(&mut self, target: u64) -> Result<u64, MemError> {
            Ok(target)
        }
        fn set_tbrk(&mut self, target: u64) -> Result<u64, MemError> {
            Ok(target)
        }
        fn current_brk(&self) -> u64 {
            0
        }
        fn current_tbrk(&self) -> u64 {
            0
        }
        fn sigaction(&mut self, _signo: i32, _new: Option<SignalAction>) -> Option<SignalAction> {
            None
        }
        fn sigprocmask(&mut self, _how: i32, _set: Option<SigSet>) -> SigSet {
            SigSet::empty()
        }
        fn sigaltstack(
            &mut self,
            _base: u64,
            _size: u64,
            _flags: i32,
        ) -> Result<(), crate::signal::SignalError> {
            Ok(())
        }
        fn host_write(&mut self, _fd: i32, data: &[u8]) -> std::io::Result<usize> {
            Ok(data.len())
        }
        fn host_read(&mut self, _fd: i32, _buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(0)
        }
        fn request_exit(&mut self, _status: i32) {}
        fn request_fork(&mut self, _flags: u64, _child_stack: u64) {}
        fn getpid(&self) -> i32 {
            1
        }
        fn setsid(&mut self) -> i64 {
            1
        }
        fn setpgid(&mut self, _pid: i32, _pgid: i32) -> i64 {
            0
        }
        fn getpgid(&self, _pid: i32) -> i64 {
            1
        }
    }

    #[test]
    fn unregistered_slot_returns_enosys() {
        let table = HypercallTable::empty();
        let mut ctx = NullCtx;
        let mut args = HcArgs::default();
        let result = table.dispatch(&mut ctx, 5, &mut args);
        assert_eq!(result, HcResult::Continue);
        assert_eq!(args.hc_ret, errno_ret(libc::ENOSYS));
    }

    #[test]
    fn registered_slot_runs_handler() {
        let mut table = HypercallTable::empty();
        table.register(42, |_ctx, args| {
            args.hc_ret = 7;
            HcResult::Continue
        });
        let mut ctx = NullCtx;
        let mut args = HcArgs::default();
        table.dispatch(&mut ctx, 42, &mut args);
        assert_eq!(args.hc_ret, 7);
    }
}
