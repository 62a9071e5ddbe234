//! `brk`/`tbrk` guest heap growth (§4.C, ported from `km_mem.c`'s
//! `km_mem_brk`/`km_mem_tbrk`).
//!
//! The bottom zone (`brk`) grows up from `GUEST_MEM_START_VA` and holds
//! guest text/data/heap. The top zone (`tbrk`) grows down from
//! `GUEST_MEM_TOP_VA` and holds the stack and `mmap` allocations; its guest
//! virtual addresses sit at `gpa + va_offset` so that bottom and top zones
//! never alias in guest-virtual space even though both are backed by the
//! low half of guest-physical memory.

use super::pagetable::{PageTableBuilder, Zone};
use super::region::{MemGeometry, RegionTable};
use super::{GuestMemory, MemError};
use crate::config::{GUEST_MEM_START_VA, GUEST_MEM_TOP_VA, MIB};

/// A memreg newly brought into the guest's physical address space, returned
/// to the caller so it can register the matching KVM memory slot
/// (`crate::mem` stays unaware of `crate::kvm` to keep the dependency
/// direction one way).
#[derive(Debug, Clone, Copy)]
pub struct NewMapping {
    pub slot: u32,
    pub gpa: u64,
    pub host_addr: u64,
    pub size: u64,
}

/// Tracks the guest's current `brk`/`tbrk` boundaries and drives region
/// allocation/page-table updates as they move.
pub struct Heap {
    brk: u64,
    tbrk: u64,
    va_offset: u64,
}

impl Heap {
    pub fn new(guest_max_physmem: u64) -> Self {
        let va_offset = GUEST_MEM_TOP_VA - (guest_max_physmem - 2 * MIB);
        Self {
            brk: GUEST_MEM_START_VA,
            tbrk: GUEST_MEM_TOP_VA,
            va_offset,
        }
    }

    pub fn brk(&self) -> u64 {
        self.brk
    }

    pub fn tbrk(&self) -> u64 {
        self.tbrk
    }

    /// guest-virtual to guest-physical, adjusting for the top zone's offset
    /// (`km_mem.h: gva_to_gpa`).
    pub fn gva_to_gpa(&self, gva: u64) -> u64 {
        if gva > self.va_offset {
            gva - self.va_offset
        } else {
            gva
        }
    }

    /// §4.C `brk`: move the bottom-zone boundary to `new_brk`, mapping or
    /// unmapping whole memregs as needed and returning any newly mapped
    /// regions for KVM slot registration.
    pub fn set_brk(
        &mut self,
        new_brk: u64,
        mem: &mut GuestMemory,
        regions: &mut RegionTable,
        pt: &PageTableBuilder,
    ) -> Result<(u64, Vec<NewMapping>), MemError> {
        let geo = *regions.geometry();
        let new_brk = new_brk.max(GUEST_MEM_START_VA).min(self.tbrk);
        // The bottom zone's guest-virtual address is its guest-physical
        // address directly (§4.A); anything at or past `guest_max_physmem`
        // has no memreg and would otherwise underflow inside
        // `MemGeometry::gpa_to_memreg_idx` (§8 "brk past the configured
        // physical memory size returns -ENOMEM").
        if new_brk >= geo.guest_max_physmem {
            return Err(MemError::OutOfAddressSpace);
        }
        let mut mappings = Vec::new();

        if new_brk > self.brk {
            mappings = self.grow(self.brk, new_brk, mem, regions, &geo, pt, Zone::Bottom, 0)?;
        } else if new_brk < self.brk {
            self.shrink(new_brk, self.brk, mem, regions, &geo, pt, Zone::Bottom, 0)?;
        }
        self.brk = new_brk;
        Ok((self.brk, mappings))
    }

    /// §4.C `tbrk`: move the top-zone boundary down to `new_tbrk`.
    pub fn set_tbrk(
        &mut self,
        new_tbrk: u64,
        mem: &mut GuestMemory,
        regions: &mut RegionTable,
        pt: &PageTableBuilder,
    ) -> Result<(u64, Vec<NewMapping>), MemError> {
        let new_tbrk = new_tbrk.min(GUEST_MEM_TOP_VA).max(self.brk);
        let geo = *regions.geometry();
        // Anything below `va_offset` isn't actually in the top zone's
        // identity-translated range (`gva_to_gpa` would hand back the raw
        // gva instead of a real offset), and anything whose translated gpa
        // reaches `guest_max_physmem` has no backing memreg — both would
        // otherwise underflow inside `MemGeometry::gpa_to_memreg_idx`.
        if new_tbrk < self.va_offset || self.gva_to_gpa(new_tbrk) >= geo.guest_max_physmem {
            return Err(MemError::OutOfAddressSpace);
        }
        let mut mappings = Vec::new();

        if new_tbrk < self.tbrk {
            // The top zone grows toward lower addresses; translate to
            // guest-physical (same geometry as the bottom zone, mirrored).
            let old_gpa = self.gva_to_gpa(self.tbrk - 1) + 1;
            let new_gpa = self.gva_to_gpa(new_tbrk);
            mappings = self.grow(new_gpa, old_gpa, mem, regions, &geo, pt, Zone::Top, self.va_offset)?;
        } else if new_tbrk > self.tbrk {
            let old_gpa = self.gva_to_gpa(self.tbrk);
            let new_gpa = self.gva_to_gpa(new_tbrk - 1) + 1;
            self.shrink(old_gpa, new_gpa, mem, regions, &geo, pt, Zone::Top, self.va_offset)?;
        }
        self.tbrk = new_tbrk;
        Ok((self.tbrk, mappings))
    }

    #[allow(clippy::too_many_arguments)]
    fn grow(
        &self,
        old_gpa: u64,
        new_gpa: u64,
        mem: &mut GuestMemory,
        regions: &mut RegionTable,
        geo: &MemGeometry,
        pt: &PageTableBuilder,
        zone: Zone,
        va_offset: u64,
    ) -> Result<Vec<NewMapping>, MemError> {
        let mut mappings = Vec::new();
        let mut idx = geo.gpa_to_memreg_idx(old_gpa.max(GUEST_MEM_START_VA));
        let last_idx = geo.gpa_to_memreg_idx((new_gpa - 1).max(GUEST_MEM_START_VA));
        while idx <= last_idx {
            if !regions.is_allocated(idx) {
                let gpa = geo.memreg_base(idx);
                let size = geo.memreg_size(idx);
                let host_addr = mem.map_region(gpa, size)?;
                regions.alloc(idx, gpa, size)?;
                let va = if zone == Zone::Top { gpa + va_offset } else { gpa };
                pt.map(mem, zone, va, gpa, size)?;
                mappings.push(NewMapping {
                    slot: idx,
                    gpa,
                    host_addr,
                    size,
                });
            }
            idx += 1;
        }
        Ok(mappings)
    }

    #[allow(clippy::too_many_arguments)]
    fn shrink(
        &self,
        new_gpa: u64,
        old_gpa: u64,
        mem: &GuestMemory,
        regions: &mut RegionTable,
        geo: &MemGeometry,
        pt: &PageTableBuilder,
        zone: Zone,
        va_offset: u64,
    ) -> Result<(), MemError> {
        let first_free = geo.gpa_to_memreg_idx(new_gpa.max(GUEST_MEM_START_VA));
        let last_idx = geo.gpa_to_memreg_idx((old_gpa - 1).max(GUEST_MEM_START_VA));
        let mut idx = first_free;
        while idx <= last_idx {
            if regions.is_allocated(idx) {
                let gpa = geo.memreg_base(idx);
                let size = geo.memreg_size(idx);
                let va = if zone == Zone::Top { gpa + va_offset } else { gpa };
                // The memreg's mmap stays resident (munmap happens only on
                // process exit); only the page-table mapping and the KVM
                // slot go away, matching `km_mem.c`'s "free" path, which
                // keeps host memory around in case brk grows back.
                pt.unmap(mem, zone, va, size)?;
                regions.free(idx);
            }
            idx += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GIB;

    #[test]
    fn new_heap_starts_at_guest_mem_bounds() {
        let heap = Heap::new(512 * GIB);
        assert_eq!(heap.brk(), GUEST_MEM_START_VA);
        assert_eq!(heap.tbrk(), GUEST_MEM_TOP_VA);
    }

    #[test]
    fn gva_to_gpa_is_identity_below_the_offset() {
        let heap = Heap::new(512 * GIB);
        assert_eq!(heap.gva_to_gpa(4 * MIB), 4 * MIB);
    }

    #[test]
    fn grow_bottom_allocates_whole_memregs() {
        let mut mem = GuestMemory::new();
        mem.map_region(crate::config::RSV_MEM_START, crate::config::RSV_MEM_SIZE)
            .unwrap();
        let geo = MemGeometry::new(4 * GIB);
        let mut regions = RegionTable::new(geo);
        let pt = PageTableBuilder::new(crate::config::RSV_MEM_START, false);
        pt.init(&mem).unwrap();
        let mut heap = Heap::new(4 * GIB);
        let (new_brk, mappings) = heap
            .set_brk(GUEST_MEM_START_VA + 10 * MIB, &mut mem, &mut regions, &pt)
            .unwrap();
        assert_eq!(new_brk, GUEST_MEM_START_VA + 10 * MIB);
        assert!(!mappings.is_empty());
    }
}
