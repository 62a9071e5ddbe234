//! POSIX signal emulation (§4.H). The guest never receives a real Linux
//! signal — everything here is bookkeeping the monitor does on the guest's
//! behalf: tracking dispositions, queueing pending signals, and building the
//! synthetic stack frame that redirects a VCPU into the guest's handler.
//!
//! This module intentionally knows nothing about KVM or VCPU identity; it
//! operates on plain register/memory values passed in by the caller
//! (eventually `crate::runloop`), keeping the dependency direction the same
//! one way `crate::mem` already follows.

mod frame;
mod queue;
mod sigset;

pub use frame::{build_frame, select_stack, unwind_frame, FrameInput, FrameOutput, UnwoundFrame};
pub use queue::{
    is_default_ignore, is_ignore_blocking, is_program_error, is_uncatchable, SignalPool,
    SignalQueue, SignalRecord, SI_KERNEL,
};
pub use sigset::SigSet;

use crate::mem::{GuestMemory, MemError};
use kvm_bindings::kvm_regs;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignalError {
    #[error(transparent)]
    Mem(#[from] MemError),

    #[error("signal {0} has no sigaltstack installed but SA_ONSTACK was requested")]
    NoAltstack(i32),

    #[error("sigaltstack size {0} is below MINSIGSTKSZ ({MINSIGSTKSZ})")]
    AltstackTooSmall(u64),

    #[error("signal free pool exhausted, cannot post signal {0}")]
    PoolExhausted(i32),
}

/// Matches glibc's `MINSIGSTKSZ`.
pub const MINSIGSTKSZ: u64 = 2048;
/// `sigaltstack.ss_flags` value meaning "no alternate stack" (`SS_DISABLE`).
pub const SS_DISABLE: i32 = 2;
/// `sigaction.sa_flags` bit: deliver on the alternate stack.
pub const SA_ONSTACK: u64 = 0x0800_0000;
/// `sigaction.sa_flags` bit: don't add the delivered signal to its own mask.
pub const SA_NODEFER: u64 = 0x4000_0000;
/// Sentinel handler values, matching `SIG_DFL`/`SIG_IGN`.
pub const SIG_DFL: u64 = 0;
pub const SIG_IGN: u64 = 1;

/// One guest `struct sigaction` entry (§3 "Signal disposition").
#[derive(Debug, Clone, Copy)]
pub struct SignalAction {
    pub handler: u64,
    pub restorer: u64,
    pub mask: SigSet,
    pub flags: u64,
}

impl Default for SignalAction {
    fn default() -> Self {
        SignalAction {
            handler: SIG_DFL,
            restorer: 0,
            mask: SigSet::empty(),
            flags: 0,
        }
    }
}

/// An installed `sigaltstack` (§4.H "Choose stack").
#[derive(Debug, Clone, Copy)]
pub struct AltStack {
    pub base: u64,
    pub size: u64,
    pub disabled: bool,
}

/// Validate a guest-supplied `sigaltstack` before installing it.
pub fn validate_altstack(base: u64, size: u64, flags: i32) -> Result<AltStack, SignalError> {
    if flags & SS_DISABLE != 0 {
        return Ok(AltStack {
            base,
            size,
            disabled: true,
        });
    }
    if size < MINSIGSTKSZ {
        return Err(SignalError::AltstackTooSmall(size));
    }
    Ok(AltStack {
        base,
        size,
        disabled: false,
    })
}

/// Whether `signo`'s default action (absent a caught handler) terminates the
/// process with a core dump (§4.H "Delivery": "program-error or SIGQUIT").
pub fn default_action_dumps_core(signo: i32) -> bool {
    is_program_error(signo) || signo == libc::SIGQUIT
}

/// Post a signal to `queue`, charging the shared `pool` for the new record
/// unless it coalesced with one already pending (§4.H "Posting").
pub fn post_signal(
    queue: &mut SignalQueue,
    pool: &mut SignalPool,
    record: SignalRecord,
) -> Result<(), SignalError> {
    if pool.try_alloc().is_none() {
        return Err(SignalError::PoolExhausted(record.signo));
    }
    if !queue.post(record) {
        pool.free(); // coalesced away, give the slot back
    }
    Ok(())
}

/// Everything `deliver_signal` needs about the VCPU it's delivering into.
pub struct DeliveryContext<'a> {
    pub mem: &'a GuestMemory,
    pub regs: kvm_regs,
    pub rflags: u64,
    pub blocked: SigSet,
    pub altstack: Option<AltStack>,
}

/// Build the frame and compute the new blocked-signal mask for delivering
/// `record` through `action` (§4.H "Delivery"). Returns the register values
/// the caller should apply and the mask to install while the handler runs.
pub fn deliver_signal(
    ctx: &DeliveryContext,
    action: &SignalAction,
    record: &SignalRecord,
) -> Result<(FrameOutput, SigSet), SignalError> {
    let onstack = action.flags & SA_ONSTACK != 0;
    let altstack = ctx.altstack.filter(|a| !a.disabled).map(|a| (a.base, a.size));
    if onstack && altstack.is_none() {
        return Err(SignalError::NoAltstack(record.signo));
    }
    let stack_top = select_stack(ctx.regs.rsp, altstack, onstack);

    let input = FrameInput {
        signo: record.signo,
        code: record.code,
        faulting_address: record.faulting_address,
        value: record.value,
        handler: action.handler,
        restorer: action.restorer,
        regs: ctx.regs,
        rflags: ctx.rflags,
        mask_before: ctx.blocked,
    };
    let out = build_frame(ctx.mem, &input, stack_top)?;

    let mut new_mask = ctx.blocked.union(action.mask);
    if action.flags & SA_NODEFER == 0 {
        new_mask.add(record.signo);
    }
    Ok((out, new_mask))
}

/// Recover the saved registers, flags, and mask from a `sigreturn` (§4.H
/// "Sigreturn").
pub fn sigreturn(mem: &GuestMemory, frame_addr: u64) -> Result<UnwoundFrame, SignalError> {
    unwind_frame(mem, frame_addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_action_dumps_core_includes_sigquit_alongside_program_errors() {
        assert!(default_action_dumps_core(libc::SIGSEGV));
        assert!(default_action_dumps_core(libc::SIGQUIT));
        assert!(!default_action_dumps_core(libc::SIGTERM));
    }

    #[test]
    fn post_signal_frees_pool_slot_on_coalesce() {
        let mut queue = SignalQueue::new();
        let mut pool = SignalPool::default();
        let rec = SignalRecord {
            signo: libc::SIGUSR1,
            code: 0,
            sender_pid: 0,
            faulting_address: 0,
            value: 0,
        };
        post_signal(&mut queue, &mut pool, rec).unwrap();
        post_signal(&mut queue, &mut pool, rec).unwrap();
        assert!(pool.try_alloc().is_some()); // only one slot actually charged
    }

    #[test]
    fn validate_altstack_rejects_undersized_stack() {
        assert!(matches!(
            validate_altstack(0x1000, 64, 0),
            Err(SignalError::AltstackTooSmall(64))
        ));
    }

    #[test]
    fn validate_altstack_allows_disabled_regardless_of_size() {
        assert!(validate_altstack(0, 0, SS_DISABLE).unwrap().disabled);
    }

    #[test]
    fn deliver_signal_requires_altstack_for_onstack_handlers() {
        let mem = GuestMemory::new();
        let ctx = DeliveryContext {
            mem: &mem,
            regs: kvm_regs::default(),
            rflags: 0,
            blocked: SigSet::empty(),
            altstack: None,
        };
        let action = SignalAction {
            handler: 0x1000,
            flags: SA_ONSTACK,
            ..Default::default()
        };
        let rec = SignalRecord {
            signo: libc::SIGUSR1,
            code: 0,
            sender_pid: 0,
            faulting_address: 0,
            value: 0,
        };
        assert!(matches!(
            deliver_signal(&ctx, &action, &rec),
            Err(SignalError::NoAltstack(_))
        ));
    }

    #[test]
    fn deliver_signal_masks_the_delivered_signal_unless_nodefer() {
        let mut mem = GuestMemory::new();
        mem.map_region(0x10000, 0x10000).unwrap();
        let mut regs = kvm_regs::default();
        regs.rsp = 0x18000;
        let ctx = DeliveryContext {
            mem: &mem,
            regs,
            rflags: 0,
            blocked: SigSet::empty(),
            altstack: None,
        };
        let action = SignalAction {
            handler: 0x4000,
            ..Default::default()
        };
        let rec = SignalRecord {
            signo: libc::SIGUSR1,
            code: 0,
            sender_pid: 0,
            faulting_address: 0,
            value: 0,
        };
        let (_, mask) = deliver_signal(&ctx, &action, &rec).unwrap();
        assert!(mask.is_member(libc::SIGUSR1));
    }
}
