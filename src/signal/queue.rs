//! Pending-signal records and the bounded free pool they're drawn from
//! (§3 "Signal record", §4.H "Posting"/"Dequeue").

use super::sigset::SigSet;
use crate::config::SIGNAL_FREE_POOL_SIZE;
use std::collections::VecDeque;

/// `{ signo, code, pid_of_sender, faulting_address, value }` (§3).
#[derive(Debug, Clone, Copy)]
pub struct SignalRecord {
    pub signo: i32,
    pub code: i32,
    pub sender_pid: i32,
    pub faulting_address: u64,
    pub value: u64,
}

/// Signals whose `SIG_DFL` action terminates the payload with a core dump
/// (§4.H "Classification tables").
pub const PROGRAM_ERROR: &[i32] = &[
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGABRT,
    libc::SIGTRAP,
    libc::SIGSYS,
];

/// Signals whose default action is to be silently ignored.
pub const DEFAULT_IGNORE: &[i32] = &[libc::SIGCHLD, libc::SIGURG, libc::SIGWINCH];

/// Signals that can never be caught, blocked, or ignored.
pub const UNCATCHABLE: &[i32] = &[libc::SIGKILL, libc::SIGSTOP];

/// Delivered even while blocked, when posted from the kernel fault path
/// (`si_code == SI_KERNEL`).
pub const IGNORE_BLOCKING: &[i32] = &[libc::SIGBUS, libc::SIGFPE, libc::SIGILL, libc::SIGSEGV];

pub fn is_program_error(signo: i32) -> bool {
    PROGRAM_ERROR.contains(&signo)
}

pub fn is_default_ignore(signo: i32) -> bool {
    DEFAULT_IGNORE.contains(&signo)
}

pub fn is_uncatchable(signo: i32) -> bool {
    UNCATCHABLE.contains(&signo)
}

pub fn is_ignore_blocking(signo: i32) -> bool {
    IGNORE_BLOCKING.contains(&signo)
}

/// Whether non-realtime signals should be coalesced (dropped if one with the
/// same `signo` is already pending).
fn is_realtime(signo: i32) -> bool {
    signo >= libc::SIGRTMIN()
}

/// Bounds the total number of in-flight `SignalRecord`s across every queue
/// (per-VCPU and machine-wide) the way the original draws from a single
/// fixed-size pool; exhaustion is fatal (§7 "Resource exhaustion").
#[derive(Debug, Default)]
pub struct SignalPool {
    in_use: usize,
}

impl SignalPool {
    pub fn try_alloc(&mut self) -> Option<()> {
        if self.in_use >= SIGNAL_FREE_POOL_SIZE {
            None
        } else {
            self.in_use += 1;
            Some(())
        }
    }

    pub fn free(&mut self) {
        self.in_use = self.in_use.saturating_sub(1);
    }
}

/// FIFO pending-signal list (per-VCPU or machine-wide), with
/// highest-priority-first dequeue among unblocked entries (§4.H "Dequeue").
#[derive(Debug, Default)]
pub struct SignalQueue {
    records: VecDeque<SignalRecord>,
}

impl SignalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post `record`, coalescing non-RT signals already pending (§4.H
    /// "Posting" step 1). Returns `false` (caller should not allocate from
    /// the pool) if the signal was coalesced away.
    pub fn post(&mut self, record: SignalRecord) -> bool {
        if !is_realtime(record.signo) && self.records.iter().any(|r| r.signo == record.signo) {
            return false;
        }
        self.records.push_back(record);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove and return the highest-priority unblocked record, if any.
    /// Program-error signals win ties; otherwise lowest signal number first.
    pub fn dequeue(&mut self, blocked: SigSet) -> Option<SignalRecord> {
        let deliverable = |r: &SignalRecord| {
            !blocked.is_member(r.signo) || (is_ignore_blocking(r.signo) && r.code == SI_KERNEL)
        };
        let best_idx = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| deliverable(r))
            .min_by_key(|(_, r)| (!is_program_error(r.signo), r.signo))
            .map(|(i, _)| i)?;
        self.records.remove(best_idx)
    }
}

/// `si_code` value the kernel fault path stamps on synthesized signals,
/// mirroring glibc's `SI_KERNEL`.
pub const SI_KERNEL: i32 = 0x80;

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(signo: i32) -> SignalRecord {
        SignalRecord {
            signo,
            code: 0,
            sender_pid: 0,
            faulting_address: 0,
            value: 0,
        }
    }

    #[test]
    fn non_rt_signals_coalesce() {
        let mut q = SignalQueue::new();
        assert!(q.post(rec(libc::SIGUSR1)));
        assert!(!q.post(rec(libc::SIGUSR1)));
        assert_eq!(q.records.len(), 1);
    }

    #[test]
    fn rt_signals_do_not_coalesce() {
        let mut q = SignalQueue::new();
        let rt = libc::SIGRTMIN();
        assert!(q.post(rec(rt)));
        assert!(q.post(rec(rt)));
        assert_eq!(q.records.len(), 2);
    }

    #[test]
    fn program_error_signals_dequeue_first() {
        let mut q = SignalQueue::new();
        q.post(rec(libc::SIGUSR1));
        q.post(rec(libc::SIGSEGV));
        let first = q.dequeue(SigSet::empty()).unwrap();
        assert_eq!(first.signo, libc::SIGSEGV);
    }

    #[test]
    fn blocked_signals_are_not_dequeued() {
        let mut q = SignalQueue::new();
        q.post(rec(libc::SIGUSR1));
        let mut blocked = SigSet::empty();
        blocked.add(libc::SIGUSR1);
        assert!(q.dequeue(blocked).is_none());
    }

    #[test]
    fn ignore_blocking_signals_deliver_from_kernel_fault_path() {
        let mut q = SignalQueue::new();
        let mut rec = rec(libc::SIGSEGV);
        rec.code = SI_KERNEL;
        q.post(rec);
        let mut blocked = SigSet::empty();
        blocked.add(libc::SIGSEGV);
        assert!(q.dequeue(blocked).is_some());
    }

    #[test]
    fn pool_exhaustion_is_observable() {
        let mut pool = SignalPool::default();
        for _ in 0..SIGNAL_FREE_POOL_SIZE {
            assert!(pool.try_alloc().is_some());
        }
        assert!(pool.try_alloc().is_none());
        pool.free();
        assert!(pool.try_alloc().is_some());
    }
}
