//! Fork/clone orchestration (§4.J).
//!
//! The actual host `fork(2)` must happen on the single thread driving the
//! monitor's main loop, with every other VCPU quiesced first — §5's
//! ordering guarantee that "the parent's peers resume only after the child
//! has fully re-initialized its VM" depends on it. This module captures the
//! pre-fork snapshot and the parent-side pid bookkeeping; performing the
//! actual `fork()` and re-running VM setup in the child is `crate::machine`'s
//! job (it alone holds the driver handles this module must not depend on).

use crate::config::PID_TABLE_SIZE;
use crate::signal::{AltStack, SigSet};
use kvm_bindings::kvm_regs;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForkError {
    #[error("fork already in progress on another vcpu")]
    AlreadyInProgress,

    #[error("pid table exhausted ({0} slots in use)")]
    PidTableFull(usize),

    #[error("host fork() failed: {0}")]
    Fork(#[source] std::io::Error),
}

/// Everything the child needs transplanted onto its single surviving VCPU
/// (§4.J "Pre-fork").
#[derive(Debug, Clone, Copy)]
pub struct PreForkSnapshot {
    pub regs: kvm_regs,
    pub sregs: kvm_bindings::kvm_sregs,
    pub stack_top: u64,
    pub thread_pointer: u64,
    pub altstack: Option<AltStack>,
    pub blocked: SigSet,
    /// If `clone` supplied a child stack, its guest-virtual top; the
    /// hypercall-args block is copied there with `hc_ret = 0` before the
    /// host fork so the child resumes as if the hypercall simply returned.
    pub child_stack_top: Option<u64>,
}

/// `clone(2)`'s `flags`/`child_stack` args, captured verbatim off the
/// hypercall args block (§4.J "Pre-fork"); `child_stack == 0` means "reuse
/// the caller's stack", matching plain `fork(2)`.
#[derive(Debug, Clone, Copy)]
pub struct CloneRequest {
    pub flags: u64,
    pub child_stack: u64,
}

impl CloneRequest {
    pub fn child_stack_top(&self) -> Option<u64> {
        (self.child_stack != 0).then_some(self.child_stack)
    }
}

/// What `Machine::fork_child` hands back to the run loop: the parent keeps
/// driving its own VCPU and only needs the child's monitor pid to correct
/// `hc_ret`; the child gets a brand-new `Machine` to drive instead (§4.J "In
/// the parent" / "In the child").
pub enum ForkOutcome {
    Parent { child_monitor_pid: i32 },
    Child(Box<crate::machine::Machine>),
}

/// Guards the monitor-wide single-fork-at-a-time invariant (§4.J
/// "Pre-fork"). `Machine` holds one of these; `begin`/`end` bracket the
/// host `fork()` call.
#[derive(Debug, Default)]
pub struct ForkGuard {
    in_progress: bool,
}

impl ForkGuard {
    pub fn begin(&mut self) -> Result<(), ForkError> {
        if self.in_progress {
            return Err(ForkError::AlreadyInProgress);
        }
        self.in_progress = true;
        Ok(())
    }

    pub fn end(&mut self) {
        self.in_progress = false;
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }
}

/// One entry in the parent's Linux-pid → monitor-pid table (§4.J "In the
/// parent"), plus the session/process-group fields `km_sid_pgid.c` tracks
/// alongside it — `exit`/`wait4` and job-control hypercalls (`setsid`,
/// `setpgid`, `getpgid`) are meaningless without a place to keep them.
#[derive(Debug, Clone, Copy)]
struct PidSlot {
    linux_pid: i32,
    monitor_pid: i32,
    reaped: bool,
    sid: i32,
    pgid: i32,
}

/// Bounded table mapping host `fork()` return values to the monitor's own
/// pid namespace. Freed entries are marked `reaped` and only reused once no
/// slot is fully free, matching §4.J's reuse policy.
#[derive(Debug)]
pub struct PidTable {
    slots: Vec<PidSlot>,
    next_monitor_pid: i32,
    /// The payload's own pid, 1 in the monitor's pid namespace (§4.J "the
    /// monitor-local namespace").
    own_pid: i32,
    own_sid: i32,
    own_pgid: i32,
}

impl Default for PidTable {
    fn default() -> Self {
        PidTable::new()
    }
}

impl PidTable {
    pub fn new() -> Self {
        PidTable {
            slots: Vec::new(),
            next_monitor_pid: 2,
            own_pid: 1,
            own_sid: 1,
            own_pgid: 1,
        }
    }

    pub fn own_pid(&self) -> i32 {
        self.own_pid
    }

    /// Record a freshly forked child, returning its monitor-local pid. A
    /// child starts in its parent's session and inherits the caller's pgid
    /// (`km_sid_pgid.c`'s fork-time copy), both overridable afterwards via
    /// `setsid`/`setpgid`.
    pub fn insert(&mut self, linux_pid: i32) -> Result<i32, ForkError> {
        let monitor_pid = self.next_monitor_pid;
        self.next_monitor_pid += 1;
        let sid = self.own_sid;
        let pgid = self.own_pgid;

        if let Some(free) = self.slots.iter_mut().find(|s| s.reaped) {
            free.linux_pid = linux_pid;
            free.monitor_pid = monitor_pid;
            free.reaped = false;
            free.sid = sid;
            free.pgid = pgid;
            return Ok(monitor_pid);
        }
        if self.slots.len() >= PID_TABLE_SIZE {
            return Err(ForkError::PidTableFull(self.slots.len()));
        }
        self.slots.push(PidSlot {
            linux_pid,
            monitor_pid,
            reaped: false,
            sid,
            pgid,
        });
        Ok(monitor_pid)
    }

    /// `setsid(2)`: the caller becomes leader of a new session and process
    /// group, both equal to its own pid. `pid` is the monitor-local pid of
    /// the caller (the payload itself, or a reaped-tracked child).
    pub fn setsid(&mut self, pid: i32) -> i32 {
        if pid == self.own_pid {
            self.own_sid = pid;
            self.own_pgid = pid;
        } else if let Some(slot) = self.slots.iter_mut().find(|s| s.monitor_pid == pid) {
            slot.sid = pid;
            slot.pgid = pid;
        }
        pid
    }

    /// `setpgid(2)`: `pgid == 0` means "use `pid` itself as the new group".
    pub fn setpgid(&mut self, pid: i32, pgid: i32) {
        let pgid = if pgid == 0 { pid } else { pgid };
        if pid == 0 || pid == self.own_pid {
            self.own_pgid = pgid;
        } else if let Some(slot) = self.slots.iter_mut().find(|s| s.monitor_pid == pid) {
            slot.pgid = pgid;
        }
    }

    pub fn getpgid(&self, pid: i32) -> Option<i32> {
        if pid == 0 || pid == self.own_pid {
            Some(self.own_pgid)
        } else {
            self.slots.iter().find(|s| s.monitor_pid == pid).map(|s| s.pgid)
        }
    }

    pub fn getsid(&self, pid: i32) -> Option<i32> {
        if pid == 0 || pid == self.own_pid {
            Some(self.own_sid)
        } else {
            self.slots.iter().find(|s| s.monitor_pid == pid).map(|s| s.sid)
        }
    }

    pub fn monitor_pid_of(&self, linux_pid: i32) -> Option<i32> {
        self.slots
            .iter()
            .find(|s| !s.reaped && s.linux_pid == linux_pid)
            .map(|s| s.monitor_pid)
    }

    /// Mark the entry for `monitor_pid` reaped (after `wait` observes it).
    pub fn reap(&mut self, monitor_pid: i32) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.monitor_pid == monitor_pid) {
            slot.reaped = true;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| !s.reaped).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Steps the child performs before it may resume guest code (§4.J "In the
/// child"), expressed as an ordered checklist `Machine::fork_child` drives.
/// Kept here, not in `machine.rs`, so the required ordering is documented
/// next to the snapshot it operates on.
pub const CHILD_REINIT_STEPS: &[&str] = &[
    "reset monitor mutexes and condvars",
    "disconnect from gdb without signaling",
    "close parent vm-driver fds and re-run machine_setup",
    "re-register each populated physical slot with the driver",
    "create one vcpu and transplant the pre-fork snapshot",
    "honor KM_WAIT_FOR_GDB_ATTACH / KM_GDB_CHILD_FORK_WAIT",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_guard_rejects_concurrent_fork() {
        let mut guard = ForkGuard::default();
        guard.begin().unwrap();
        assert!(matches!(guard.begin(), Err(ForkError::AlreadyInProgress)));
        guard.end();
        assert!(guard.begin().is_ok());
    }

    #[test]
    fn pid_table_assigns_increasing_monitor_pids() {
        let mut table = PidTable::new();
        let a = table.insert(100).unwrap();
        let b = table.insert(200).unwrap();
        assert!(b > a);
        assert_eq!(table.monitor_pid_of(100), Some(a));
    }

    #[test]
    fn reaped_slots_are_reused_before_growing() {
        let mut table = PidTable::new();
        let a = table.insert(100).unwrap();
        table.reap(a);
        assert_eq!(table.len(), 0);
        let b = table.insert(300).unwrap();
        assert_eq!(table.slots.len(), 1);
        assert_eq!(table.monitor_pid_of(300), Some(b));
    }

    #[test]
    fn child_inherits_parent_session_and_group() {
        let mut table = PidTable::new();
        table.setsid(table.own_pid());
        table.setpgid(table.own_pid(), 0);
        let child = table.insert(100).unwrap();
        assert_eq!(table.getsid(child), Some(table.own_pid()));
        assert_eq!(table.getpgid(child), Some(table.own_pid()));
    }

    #[test]
    fn setpgid_zero_pgid_uses_pid_itself() {
        let mut table = PidTable::new();
        let child = table.insert(100).unwrap();
        table.setpgid(child, 0);
        assert_eq!(table.getpgid(child), Some(child));
    }

    #[test]
    fn setsid_makes_caller_its_own_leader() {
        let mut table = PidTable::new();
        let child = table.insert(100).unwrap();
        let new_sid = table.setsid(child);
        assert_eq!(new_sid, child);
        assert_eq!(table.getsid(child), Some(child));
        assert_eq!(table.getpgid(child), Some(child));
    }
}
