//! Software and hardware breakpoint tables (§4.K "Breakpoints").

use crate::config::GDB_MAX_HW_BREAKPOINTS;
use thiserror::Error;

/// `0xCC` — the `INT3` opcode software breakpoints patch in.
pub const INT3: u8 = 0xcc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    Sw,
    HwExec,
    WWrite,
    WRead,
    WAccess,
}

/// `z`/`Z` type field → [`BreakpointKind`] (§4.K).
pub fn kind_from_type(ty: u8) -> Option<BreakpointKind> {
    match ty {
        0 => Some(BreakpointKind::Sw),
        1 => Some(BreakpointKind::HwExec),
        2 => Some(BreakpointKind::WWrite),
        3 => Some(BreakpointKind::WRead),
        4 => Some(BreakpointKind::WAccess),
        _ => None,
    }
}

#[derive(Error, Debug)]
pub enum BreakpointError {
    #[error("all {GDB_MAX_HW_BREAKPOINTS} hardware breakpoint slots are in use")]
    HwTableFull,
    #[error("no breakpoint registered at {0:#x}")]
    NotFound(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct SwBreakpoint {
    pub addr: u64,
    pub refcount: u32,
    pub saved_byte: u8,
}

/// DR7 condition bits for a hardware breakpoint kind (exec/write/read-write;
/// `WRead`-only isn't expressible on x86 so it's treated as `WAccess`).
fn dr7_condition(kind: BreakpointKind) -> u32 {
    match kind {
        BreakpointKind::HwExec => 0b00,
        BreakpointKind::WWrite => 0b01,
        BreakpointKind::WRead | BreakpointKind::WAccess => 0b11,
        BreakpointKind::Sw => unreachable!("software breakpoints don't program DR7"),
    }
}

/// `{1->0, 2->1, 4->3, 8->2}` length encoding (§4.K "HW").
fn dr7_len(len: u8) -> u32 {
    match len {
        1 => 0b00,
        2 => 0b01,
        8 => 0b10,
        _ => 0b11, // 4
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HwBreakpoint {
    pub addr: u64,
    pub len: u8,
    pub kind: BreakpointKind,
    pub refcount: u32,
}

impl HwBreakpoint {
    /// Encode as the `(addr, dr7_bits)` pair `VcpuFd::set_guest_debug` wants.
    pub fn encode(&self) -> (u64, u32) {
        (self.addr, (dr7_len(self.len) << 2) | dr7_condition(self.kind))
    }
}

/// One VCPU's (or the process-wide, for SW) breakpoint bookkeeping.
#[derive(Debug, Default)]
pub struct BreakpointTable {
    sw: Vec<SwBreakpoint>,
    hw: Vec<HwBreakpoint>,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or bump the refcount of) a software breakpoint, returning
    /// the original byte the caller must preserve until `remove_sw` restores
    /// it (the caller owns reading/writing guest memory).
    pub fn insert_sw(&mut self, addr: u64, current_byte: u8) -> u8 {
        if let Some(bp) = self.sw.iter_mut().find(|b| b.addr == addr) {
            bp.refcount += 1;
            return bp.saved_byte;
        }
        self.sw.push(SwBreakpoint {
            addr,
            refcount: 1,
            saved_byte: current_byte,
        });
        current_byte
    }

    /// Decrement refcount; returns `Some(saved_byte)` once it's the caller's
    /// job to restore that byte in guest memory (refcount reached 0).
    pub fn remove_sw(&mut self, addr: u64) -> Result<Option<u8>, BreakpointError> {
        let idx = self
            .sw
            .iter()
            .position(|b| b.addr == addr)
            .ok_or(BreakpointError::NotFound(addr))?;
        self.sw[idx].refcount -= 1;
        if self.sw[idx].refcount == 0 {
            let bp = self.sw.remove(idx);
            Ok(Some(bp.saved_byte))
        } else {
            Ok(None)
        }
    }

    /// The byte GDB's `m` command should see at `addr`: the original byte if
    /// a software breakpoint shadows it, otherwise `None` (read guest memory
    /// as-is).
    pub fn original_byte_at(&self, addr: u64) -> Option<u8> {
        self.sw.iter().find(|b| b.addr == addr).map(|b| b.saved_byte)
    }

    pub fn insert_hw(
        &mut self,
        addr: u64,
        len: u8,
        kind: BreakpointKind,
    ) -> Result<(), BreakpointError> {
        if let Some(bp) = self.hw.iter_mut().find(|b| b.addr == addr && b.kind == kind) {
            bp.refcount += 1;
            return Ok(());
        }
        if self.hw.len() >= GDB_MAX_HW_BREAKPOINTS {
            return Err(BreakpointError::HwTableFull);
        }
        self.hw.push(HwBreakpoint {
            addr,
            len,
            kind,
            refcount: 1,
        });
        Ok(())
    }

    pub fn remove_hw(&mut self, addr: u64, kind: BreakpointKind) -> Result<(), BreakpointError> {
        let idx = self
            .hw
            .iter()
            .position(|b| b.addr == addr && b.kind == kind)
            .ok_or(BreakpointError::NotFound(addr))?;
        self.hw[idx].refcount -= 1;
        if self.hw[idx].refcount == 0 {
            self.hw.remove(idx);
        }
        Ok(())
    }

    /// The `(addr, dr7_bits)` pairs to hand to `VcpuFd::set_guest_debug`.
    pub fn hw_encoded(&self) -> Vec<(u64, u32)> {
        self.hw.iter().map(HwBreakpoint::encode).collect()
    }

    pub fn hw_len(&self) -> usize {
        self.hw.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sw_breakpoint_tracks_refcount_and_saved_byte() {
        let mut t = BreakpointTable::new();
        assert_eq!(t.insert_sw(0x1000, 0x90), 0x90);
        assert_eq!(t.insert_sw(0x1000, INT3), 0x90); // already shadowed, returns original
        assert_eq!(t.remove_sw(0x1000).unwrap(), None); // refcount 2 -> 1
        assert_eq!(t.remove_sw(0x1000).unwrap(), Some(0x90));
    }

    #[test]
    fn original_byte_at_reports_shadowed_breakpoints() {
        let mut t = BreakpointTable::new();
        t.insert_sw(0x2000, 0x55);
        assert_eq!(t.original_byte_at(0x2000), Some(0x55));
        assert_eq!(t.original_byte_at(0x3000), None);
    }

    #[test]
    fn hw_table_rejects_a_fifth_breakpoint() {
        let mut t = BreakpointTable::new();
        for i in 0..GDB_MAX_HW_BREAKPOINTS {
            t.insert_hw(0x1000 + i as u64, 1, BreakpointKind::HwExec).unwrap();
        }
        assert!(matches!(
            t.insert_hw(0x9000, 1, BreakpointKind::HwExec),
            Err(BreakpointError::HwTableFull)
        ));
    }

    #[test]
    fn hw_length_encoding_matches_spec_table() {
        let bp = HwBreakpoint {
            addr: 0,
            len: 4,
            kind: BreakpointKind::WWrite,
            refcount: 1,
        };
        let (_, bits) = bp.encode();
        assert_eq!(bits & 0b11, 0b01); // write condition
        assert_eq!((bits >> 2) & 0b11, 0b11); // len 4 -> code 3
    }
}
