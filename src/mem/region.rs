//! Geometric memreg table and guest-virtual/guest-physical translation
//! (§4.A, ported from `km_mem.h`'s `MEM_IDX`/`memreg_base`/`memreg_top`).
//!
//! Physical memory is carved into regions whose size doubles from 2 MiB at
//! the bottom of the address space until it crosses the midpoint, then
//! mirrors back down to 2 MiB at the top. A region's index is recovered from
//! its address with a single `leading_zeros` instead of a table scan, the
//! same trick `km_mem.h` plays with `__builtin_clzl`.

use super::MemError;
use crate::config::{GIB, KM_MEM_SLOTS, MIB};
use std::sync::Arc;
use vm_memory::{
    Bytes, GuestAddress, GuestMemory as VmGuestMemory, GuestMemoryMmap, GuestMemoryRegion,
    GuestRegionMmap,
};

/// Index of a memreg for guest-physical address `addr` in the *bottom* half
/// of the address space (`km_mem.h: MEM_IDX`).
fn mem_idx(addr: u64) -> u32 {
    debug_assert!(addr > 0, "MEM_IDX is undefined at address 0");
    43 - addr.leading_zeros()
}

/// Describes the doubling/mirroring geometry for a given `guest_max_physmem`
/// (`km_mem.h`'s `machine.guest_mid_physmem`/`mid_mem_idx`/`last_mem_idx`).
#[derive(Debug, Clone, Copy)]
pub struct MemGeometry {
    pub guest_max_physmem: u64,
    guest_mid_physmem: u64,
    mid_mem_idx: u32,
    last_mem_idx: u32,
}

impl MemGeometry {
    pub fn new(guest_max_physmem: u64) -> Self {
        let guest_mid_physmem = guest_max_physmem / 2;
        let mid_mem_idx = mem_idx(guest_mid_physmem);
        Self {
            guest_max_physmem,
            guest_mid_physmem,
            mid_mem_idx,
            last_mem_idx: 2 * mid_mem_idx,
        }
    }

    /// `km_mem.h: memreg_base` — guest-physical start of region `idx`.
    pub fn memreg_base(&self, idx: u32) -> u64 {
        if idx <= self.mid_mem_idx {
            MIB << idx
        } else {
            self.guest_max_physmem - self.memreg_top(self.last_mem_idx - idx)
        }
    }

    /// `km_mem.h: memreg_top` — guest-physical end (exclusive) of region `idx`.
    pub fn memreg_top(&self, idx: u32) -> u64 {
        if idx <= self.mid_mem_idx {
            (MIB << 1) << idx
        } else {
            self.guest_max_physmem - self.memreg_base(self.last_mem_idx - idx)
        }
    }

    /// `km_mem.h: memreg_size`.
    pub fn memreg_size(&self, idx: u32) -> u64 {
        if idx <= self.mid_mem_idx {
            MIB << idx
        } else {
            MIB << (self.last_mem_idx - idx)
        }
    }

    /// `km_mem.h: gva_to_memreg_idx` — which slot covers guest-physical `gpa`.
    pub fn gpa_to_memreg_idx(&self, gpa: u64) -> u32 {
        if gpa <= self.guest_mid_physmem {
            mem_idx(gpa)
        } else {
            self.last_mem_idx - mem_idx(self.guest_max_physmem - gpa - 1)
        }
    }
}

/// One registered KVM memory slot (§4.A `alloc`/`free`).
#[derive(Debug, Clone, Copy)]
pub struct MemSlot {
    pub gpa: u64,
    pub size: u64,
}

/// The fixed `KM_MEM_SLOTS`-entry table of regions backing guest physical
/// memory (§4.A). Each populated entry mirrors one `GuestRegionMmap` and one
/// registered KVM memory slot.
pub struct RegionTable {
    geometry: MemGeometry,
    slots: [Option<MemSlot>; KM_MEM_SLOTS],
}

impl RegionTable {
    pub fn new(geometry: MemGeometry) -> Self {
        Self {
            geometry,
            slots: [None; KM_MEM_SLOTS],
        }
    }

    pub fn geometry(&self) -> &MemGeometry {
        &self.geometry
    }

    /// Register guest-physical range `[gpa, gpa+size)` in slot `idx`
    /// (§4.A `alloc`: "register a new region with KVM").
    pub fn alloc(&mut self, idx: u32, gpa: u64, size: u64) -> Result<(), MemError> {
        let slot = idx as usize;
        if slot >= KM_MEM_SLOTS {
            return Err(MemError::SlotTableFull(KM_MEM_SLOTS));
        }
        self.slots[slot] = Some(MemSlot { gpa, size });
        Ok(())
    }

    /// Unregister slot `idx` (§4.A `free`).
    pub fn free(&mut self, idx: u32) {
        let slot = idx as usize;
        if slot < KM_MEM_SLOTS {
            self.slots[slot] = None;
        }
    }

    pub fn slot(&self, idx: u32) -> Option<MemSlot> {
        self.slots.get(idx as usize).copied().flatten()
    }

    pub fn is_allocated(&self, idx: u32) -> bool {
        self.slot(idx).is_some()
    }
}

/// Guest physical memory backed by per-region `vm-memory` mmaps.
///
/// Unlike `carbon::boot::memory::GuestMemory` (one contiguous region from
/// address 0), regions here are mapped at guest-physical addresses chosen by
/// the memreg table and folded into a single `GuestMemoryMmap` as they're
/// allocated, mirroring how `km_mem.c` grows guest memory one memreg at a
/// time instead of reserving it all up front.
pub struct GuestMemory {
    inner: GuestMemoryMmap,
}

impl GuestMemory {
    pub fn new() -> Self {
        Self {
            inner: GuestMemoryMmap::from_ranges(&[]).expect("empty guest memory map"),
        }
    }

    /// Map a new anonymous region at guest-physical `gpa` and fold it into
    /// the memory map (§4.A `alloc`). Returns the host virtual address KVM
    /// needs for `set_user_memory_region`.
    pub fn map_region(&mut self, gpa: u64, size: u64) -> Result<u64, MemError> {
        let region = GuestRegionMmap::from_range(GuestAddress(gpa), size as usize, None)
            .map_err(|e| MemError::Mmap(std::io::Error::other(e.to_string())))?;
        let host_addr = region.as_ptr() as u64;
        self.inner = self
            .inner
            .insert_region(Arc::new(region))
            .map_err(|e| MemError::Mmap(std::io::Error::other(e.to_string())))?;
        Ok(host_addr)
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemError> {
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|_| MemError::OutOfBounds(addr))
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), MemError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), MemError> {
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|_| MemError::OutOfBounds(addr))
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, MemError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Recover the host virtual address backing guest-physical `gpa`, for
    /// re-registering an already-mapped region's KVM memory slot against a
    /// new `VmFd` (§4.J "In the child": `fork(2)` keeps every existing
    /// mapping valid at its old host address, but KVM slots aren't
    /// inherited with it).
    pub fn host_addr(&self, gpa: u64) -> Option<u64> {
        let region = self.inner.find_region(GuestAddress(gpa))?;
        let offset = gpa - region.start_addr().raw_value();
        Some(region.as_ptr() as u64 + offset)
    }
}

impl Default for GuestMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_idx_doubles_from_2mib() {
        assert_eq!(mem_idx(2 * MIB), 1);
        assert_eq!(mem_idx(4 * MIB), 2);
        assert_eq!(mem_idx(8 * MIB), 3);
        assert_eq!(mem_idx(128 * GIB), 17);
    }

    #[test]
    fn geometry_mirrors_around_the_midpoint() {
        let geo = MemGeometry::new(512 * GIB);
        assert_eq!(geo.memreg_size(1), 2 * MIB);
        let last = geo.last_mem_idx;
        assert_eq!(geo.memreg_size(last - 1), geo.memreg_size(1));
    }

    #[test]
    fn host_addr_recovers_the_mapping_returned_by_map_region() {
        let mut mem = GuestMemory::new();
        let host_addr = mem.map_region(4 * MIB, 2 * MIB).unwrap();
        assert_eq!(mem.host_addr(4 * MIB), Some(host_addr));
        assert_eq!(mem.host_addr(4 * MIB + 0x100), Some(host_addr + 0x100));
        assert_eq!(mem.host_addr(64 * MIB), None);
    }

    #[test]
    fn region_table_alloc_free_roundtrip() {
        let geo = MemGeometry::new(512 * GIB);
        let mut table = RegionTable::new(geo);
        table.alloc(1, 2 * MIB, 2 * MIB).unwrap();
        assert!(table.is_allocated(1));
        assert_eq!(table.slot(1).unwrap().size, 2 * MIB);
        table.free(1);
        assert!(!table.is_allocated(1));
    }
}
