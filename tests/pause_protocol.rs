//! §4.E pause/resume protocol against a real KVM-backed `Machine`. No VCPU
//! needs to actually run `KVM_RUN` for this: `pause_all` only polls VCPU
//! state and signals live threads, so with no VCPU acquired it quiesces
//! immediately and these tests can exercise the request/resume/wait
//! transitions directly. Skips if `/dev/kvm` isn't available.

use kestrel::machine::{Machine, PauseKind};

fn machine() -> Option<Machine> {
    let driver = kestrel::kvm::open(None).ok()?;
    let m = Machine::new(driver.vm, driver.cpu_caps);
    m.map_reserved_region().unwrap();
    m.init_page_tables().unwrap();
    Some(m)
}

#[test]
fn pause_all_with_no_live_vcpus_returns_immediately_and_sets_requested() {
    let Some(m) = machine() else {
        eprintln!("skipping: /dev/kvm not available");
        return;
    };
    assert!(!m.pause_requested());
    m.pause_all(PauseKind::All, libc::SIGUSR1, &[]);
    assert!(m.pause_requested());
}

#[test]
fn resume_all_clears_the_request_and_wakes_waiters() {
    let Some(m) = machine() else {
        eprintln!("skipping: /dev/kvm not available");
        return;
    };
    m.pause_all(PauseKind::All, libc::SIGUSR1, &[]);
    assert!(m.pause_requested());

    m.resume_all();
    assert!(!m.pause_requested());

    // wait_for_resume must not block once the request has been cleared.
    m.wait_for_resume();
}

#[test]
fn wait_for_resume_blocks_until_resume_all_is_called_from_another_thread() {
    let Some(m) = machine() else {
        eprintln!("skipping: /dev/kvm not available");
        return;
    };
    let m = std::sync::Arc::new(m);
    m.pause_all(PauseKind::All, libc::SIGUSR1, &[]);

    let waiter = {
        let m = m.clone();
        std::thread::spawn(move || m.wait_for_resume())
    };

    std::thread::sleep(std::time::Duration::from_millis(20));
    assert!(!waiter.is_finished(), "waiter should still be blocked");

    m.resume_all();
    waiter.join().expect("waiter thread panicked");
}

#[test]
fn vcpu_acquired_then_parked_is_excluded_from_guest_only_pause() {
    let Some(m) = machine() else {
        eprintln!("skipping: /dev/kvm not available");
        return;
    };
    let id = m.get(kestrel::config::GUEST_MEM_START_VA).unwrap();
    m.put(id); // back to ParkedIdle

    // GuestOnly only waits on VCPUs actually InGuest; a parked one must not
    // block quiescence.
    m.pause_all(PauseKind::GuestOnly, libc::SIGUSR1, &[]);
    assert!(m.pause_requested());
    m.resume_all();
}

#[test]
fn terminate_with_signal_sets_the_128_plus_signo_exit_status_once() {
    let Some(m) = machine() else {
        eprintln!("skipping: /dev/kvm not available");
        return;
    };
    assert_eq!(m.exit_status(), None);
    m.terminate_with_signal(libc::SIGSEGV);
    assert_eq!(m.exit_status(), Some(128 + libc::SIGSEGV));

    // A later signal must not override whichever one terminated first.
    m.terminate_with_signal(libc::SIGTERM);
    assert_eq!(m.exit_status(), Some(128 + libc::SIGSEGV));
}
