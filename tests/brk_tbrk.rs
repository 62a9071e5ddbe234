//! `Heap::set_brk`/`set_tbrk` driven against real `GuestMemory`/`RegionTable`/
//! `PageTableBuilder` instances (no KVM needed — mapping a memreg only
//! touches the page-table builder and an anonymous mmap), checking the
//! properties §4.C calls out: growth maps whole memregs, shrinking frees
//! them without unmapping the underlying host memory, and the two zones
//! never cross.

use kestrel::config::{GUEST_MEM_START_VA, GUEST_MEM_TOP_VA, MIB};
use kestrel::mem::region::{MemGeometry, RegionTable};
use kestrel::mem::{GuestMemory, Heap, PageTableBuilder};

fn harness(max_physmem: u64) -> (GuestMemory, RegionTable, PageTableBuilder, Heap) {
    let mut mem = GuestMemory::new();
    mem.map_region(kestrel::config::RSV_MEM_START, kestrel::config::RSV_MEM_SIZE)
        .unwrap();
    let geo = MemGeometry::new(max_physmem);
    let regions = RegionTable::new(geo);
    let pt = PageTableBuilder::new(kestrel::config::RSV_MEM_START, false);
    pt.init(&mem).unwrap();
    let heap = Heap::new(max_physmem);
    (mem, regions, pt, heap)
}

#[test]
fn growing_brk_then_shrinking_frees_the_same_slots() {
    let (mut mem, mut regions, pt, mut heap) = harness(4 * kestrel::config::GIB);

    let (brk, grown) = heap
        .set_brk(GUEST_MEM_START_VA + 20 * MIB, &mut mem, &mut regions, &pt)
        .unwrap();
    assert_eq!(brk, GUEST_MEM_START_VA + 20 * MIB);
    assert!(!grown.is_empty());
    for m in &grown {
        assert!(regions.is_allocated(m.slot));
    }

    let (shrunk, new_mappings) = heap
        .set_brk(GUEST_MEM_START_VA, &mut mem, &mut regions, &pt)
        .unwrap();
    assert_eq!(shrunk, GUEST_MEM_START_VA);
    assert!(new_mappings.is_empty(), "shrinking must not report new mappings");
    for m in &grown {
        assert!(!regions.is_allocated(m.slot), "slot {} should be freed", m.slot);
    }
}

#[test]
fn tbrk_grows_downward_from_the_top_of_the_address_space() {
    let (mut mem, mut regions, pt, mut heap) = harness(4 * kestrel::config::GIB);

    let target = GUEST_MEM_TOP_VA - 8 * MIB;
    let (tbrk, grown) = heap.set_tbrk(target, &mut mem, &mut regions, &pt).unwrap();
    assert_eq!(tbrk, target);
    assert!(!grown.is_empty());
    assert!(tbrk < GUEST_MEM_TOP_VA);
}

#[test]
fn brk_cannot_grow_past_the_current_tbrk() {
    let (mut mem, mut regions, pt, mut heap) = harness(4 * kestrel::config::GIB);

    let (tbrk, _) = heap
        .set_tbrk(GUEST_MEM_TOP_VA - 4 * MIB, &mut mem, &mut regions, &pt)
        .unwrap();
    let (brk, _) = heap
        .set_brk(GUEST_MEM_START_VA + 30 * MIB, &mut mem, &mut regions, &pt)
        .unwrap();
    assert!(brk <= tbrk, "brk ({brk:#x}) must not grow past tbrk ({tbrk:#x})");
}

#[test]
fn brk_past_the_configured_physical_memory_size_returns_out_of_address_space() {
    let (mut mem, mut regions, pt, mut heap) = harness(4 * kestrel::config::GIB);

    let err = heap
        .set_brk(GUEST_MEM_START_VA + 4 * kestrel::config::GIB + 1, &mut mem, &mut regions, &pt)
        .unwrap_err();
    assert!(matches!(err, kestrel::mem::MemError::OutOfAddressSpace));
}

#[test]
fn tbrk_past_the_configured_physical_memory_size_returns_out_of_address_space() {
    let (mut mem, mut regions, pt, mut heap) = harness(4 * kestrel::config::GIB);

    let deep_target = GUEST_MEM_TOP_VA - 4 * kestrel::config::GIB - 4 * MIB;
    let err = heap
        .set_tbrk(deep_target, &mut mem, &mut regions, &pt)
        .unwrap_err();
    assert!(matches!(err, kestrel::mem::MemError::OutOfAddressSpace));
}

#[test]
fn repeated_brk_growth_to_the_same_target_is_idempotent() {
    let (mut mem, mut regions, pt, mut heap) = harness(4 * kestrel::config::GIB);
    let target = GUEST_MEM_START_VA + 6 * MIB;

    heap.set_brk(target, &mut mem, &mut regions, &pt).unwrap();
    let (brk, second_call_mappings) = heap.set_brk(target, &mut mem, &mut regions, &pt).unwrap();
    assert_eq!(brk, target);
    assert!(second_call_mappings.is_empty(), "already-mapped memregs must not be re-reported");
}
