//! End-to-end signal posting, delivery, and `sigreturn` unwinding against
//! real `GuestMemory`, exercising the path `crate::runloop` drives: post a
//! signal into a queue bounded by the shared free-signal pool, deliver it
//! (building the guest-side frame and the new blocked mask), then unwind the
//! frame as `sigreturn` would and confirm the original register state comes
//! back out.

use kestrel::signal::{
    deliver_signal, post_signal, sigreturn, DeliveryContext, SignalAction, SignalPool,
    SignalQueue, SignalRecord, SA_NODEFER, SIG_DFL,
};
use kestrel::mem::GuestMemory;
use kvm_bindings::kvm_regs;

fn sample_regs() -> kvm_regs {
    kvm_regs {
        rax: 0x42,
        rbx: 0x43,
        rsp: 0x20000,
        rip: 0x1000,
        ..Default::default()
    }
}

#[test]
fn posted_signal_delivers_and_unwinds_back_to_original_registers() {
    let mut mem = GuestMemory::new();
    mem.map_region(0x10000, 0x20000).unwrap();

    let mut queue = SignalQueue::new();
    let mut pool = SignalPool::default();
    let record = SignalRecord {
        signo: libc::SIGUSR1,
        code: 0,
        sender_pid: 1,
        faulting_address: 0,
        value: 7,
    };
    post_signal(&mut queue, &mut pool, record).unwrap();

    let action = SignalAction {
        handler: 0x5000,
        restorer: 0x6000,
        ..Default::default()
    };
    let ctx = DeliveryContext {
        mem: &mem,
        regs: sample_regs(),
        rflags: 0x202,
        blocked: kestrel::signal::SigSet::empty(),
        altstack: None,
    };
    let (frame, new_mask) = deliver_signal(&ctx, &action, &record).unwrap();
    assert_eq!(frame.rip, action.handler);
    assert_eq!(frame.rdi, libc::SIGUSR1 as u64);
    assert!(new_mask.is_member(libc::SIGUSR1)); // SA_NODEFER not set, self-masked

    let unwound = sigreturn(&mem, frame.rsp).unwrap();
    assert_eq!(unwound.regs.rax, 0x42);
    assert_eq!(unwound.regs.rbx, 0x43);
    assert_eq!(unwound.regs.rip, 0x1000);
    assert_eq!(unwound.rflags, 0x202);
}

#[test]
fn nodefer_leaves_the_delivered_signal_unmasked() {
    let mut mem = GuestMemory::new();
    mem.map_region(0x10000, 0x20000).unwrap();

    let ctx = DeliveryContext {
        mem: &mem,
        regs: sample_regs(),
        rflags: 0,
        blocked: kestrel::signal::SigSet::empty(),
        altstack: None,
    };
    let action = SignalAction {
        handler: 0x5000,
        flags: SA_NODEFER,
        ..Default::default()
    };
    let record = SignalRecord {
        signo: libc::SIGUSR2,
        code: 0,
        sender_pid: 0,
        faulting_address: 0,
        value: 0,
    };
    let (_, mask) = deliver_signal(&ctx, &action, &record).unwrap();
    assert!(!mask.is_member(libc::SIGUSR2));
}

#[test]
fn sig_dfl_is_the_default_disposition() {
    assert_eq!(SignalAction::default().handler, SIG_DFL);
}

#[test]
fn signal_pool_exhaustion_rejects_further_posts() {
    let mut queue = SignalQueue::new();
    let mut pool = SignalPool::default();
    let mut posted = 0;
    loop {
        let record = SignalRecord {
            signo: (posted % 30) + 1,
            code: 0,
            sender_pid: 0,
            faulting_address: 0,
            value: 0,
        };
        match post_signal(&mut queue, &mut pool, record) {
            Ok(()) => posted += 1,
            Err(_) => break,
        }
        if posted > kestrel::config::SIGNAL_FREE_POOL_SIZE as i32 + 4 {
            panic!("pool should have been exhausted by now");
        }
    }
    assert!(posted > 0);
}
