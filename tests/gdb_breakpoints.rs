//! `BreakpointTable` bookkeeping from a cross-module angle: a refcounted
//! multi-client software breakpoint at the same address, and the DR7
//! encoding `Machine::set_hw_breakpoints` would hand to
//! `VcpuFd::set_guest_debug`. Also exercises the one path that needs a real
//! KVM-backed `Machine` (`set_hw_breakpoints`/`hw_breakpoints`), skipped if
//! `/dev/kvm` isn't available in the test environment.

use kestrel::gdb::breakpoints::{BreakpointError, BreakpointKind, BreakpointTable};

#[test]
fn two_clients_inserting_the_same_sw_breakpoint_only_unshadow_after_both_remove() {
    let mut t = BreakpointTable::new();
    let orig = t.insert_sw(0x4000, 0x55);
    assert_eq!(orig, 0x55);
    let orig2 = t.insert_sw(0x4000, 0xcc); // already patched; must see the real original
    assert_eq!(orig2, 0x55);

    assert_eq!(t.remove_sw(0x4000).unwrap(), None, "still one client holding it");
    assert_eq!(t.remove_sw(0x4000).unwrap(), Some(0x55), "last client restores the byte");
    assert!(matches!(t.remove_sw(0x4000), Err(BreakpointError::NotFound(0x4000))));
}

#[test]
fn hw_breakpoints_of_different_kinds_at_the_same_address_are_distinct_slots() {
    let mut t = BreakpointTable::new();
    t.insert_hw(0x1000, 1, BreakpointKind::HwExec).unwrap();
    t.insert_hw(0x1000, 4, BreakpointKind::WWrite).unwrap();
    assert_eq!(t.hw_len(), 2);

    t.remove_hw(0x1000, BreakpointKind::HwExec).unwrap();
    assert_eq!(t.hw_len(), 1);
    let encoded = t.hw_encoded();
    assert_eq!(encoded.len(), 1);
    assert_eq!(encoded[0].0, 0x1000);
}

#[test]
fn hw_encoded_matches_the_dr7_bit_layout_for_each_kind() {
    let mut t = BreakpointTable::new();
    t.insert_hw(0x2000, 2, BreakpointKind::WRead).unwrap();
    let (addr, bits) = t.hw_encoded()[0];
    assert_eq!(addr, 0x2000);
    assert_eq!(bits & 0b11, 0b11, "read/write condition bits");
    assert_eq!((bits >> 2) & 0b11, 0b01, "len 2 -> code 1");
}

/// Covers `Machine::set_hw_breakpoints`/`hw_breakpoints` end to end against a
/// real `VcpuFd`. Requires `/dev/kvm`; the monitor's own CI sandbox carries
/// it, but a plain dev container might not, so this skips rather than fails.
#[test]
fn machine_programs_and_reports_back_hw_breakpoints() {
    let Ok(driver) = kestrel::kvm::open(None) else {
        eprintln!("skipping: /dev/kvm not available");
        return;
    };
    let machine = kestrel::machine::Machine::new(driver.vm, driver.cpu_caps);
    machine.map_reserved_region().unwrap();
    machine.init_page_tables().unwrap();

    let id = machine.get(kestrel::config::GUEST_MEM_START_VA).unwrap();

    let mut bps = [None; kestrel::config::GDB_MAX_HW_BREAKPOINTS];
    bps[0] = Some((0x3000, 0b0000_0000));
    machine.set_hw_breakpoints(id, bps).unwrap();
    assert_eq!(machine.hw_breakpoints(id)[0], Some((0x3000, 0)));

    machine.put(id);
}
