//! Cross-boundary properties of the memreg geometry and slot table that a
//! single module's unit tests don't exercise: round-tripping real addresses
//! through `gpa_to_memreg_idx` back to `memreg_base`/`memreg_top`, and the
//! slot table rejecting an index past `KM_MEM_SLOTS`.

use kestrel::config::{GIB, KM_MEM_SLOTS, MIB};
use kestrel::mem::region::{MemGeometry, RegionTable};

#[test]
fn every_memreg_index_round_trips_through_base_and_top() {
    let geo = MemGeometry::new(64 * GIB);
    for idx in 0..geo.gpa_to_memreg_idx(32 * GIB - 1) + 1 {
        let base = geo.memreg_base(idx);
        let top = geo.memreg_top(idx);
        assert!(top > base, "memreg {idx} has non-positive size");
        assert_eq!(geo.gpa_to_memreg_idx(base), idx);
        assert_eq!(geo.gpa_to_memreg_idx(top - 1), idx);
        assert_eq!(top - base, geo.memreg_size(idx));
    }
}

#[test]
fn mirrored_regions_above_the_midpoint_round_trip_too() {
    let geo = MemGeometry::new(64 * GIB);
    let last = geo.gpa_to_memreg_idx(64 * GIB - 1);
    let near_top = geo.memreg_base(last);
    assert_eq!(geo.gpa_to_memreg_idx(near_top), last);
    assert_eq!(geo.memreg_top(last), 64 * GIB);
}

#[test]
fn adjacent_memregs_tile_the_address_space_without_gaps() {
    let geo = MemGeometry::new(16 * GIB);
    let last = geo.gpa_to_memreg_idx(16 * GIB - 1);
    for idx in 0..last {
        assert_eq!(geo.memreg_top(idx), geo.memreg_base(idx + 1));
    }
}

#[test]
fn region_table_rejects_an_index_past_its_capacity() {
    let geo = MemGeometry::new(64 * GIB);
    let mut table = RegionTable::new(geo);
    let err = table.alloc(KM_MEM_SLOTS as u32, 2 * MIB, 2 * MIB);
    assert!(err.is_err());
}

#[test]
fn freeing_an_unallocated_slot_is_a_no_op() {
    let geo = MemGeometry::new(64 * GIB);
    let mut table = RegionTable::new(geo);
    table.free(5); // never allocated
    assert!(!table.is_allocated(5));
}
