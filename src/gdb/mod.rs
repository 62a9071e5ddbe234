//! GDB remote-serial-protocol stub (§4.K).
//!
//! Ties the wire protocol ([`proto`]), signal-number translation
//! ([`signals`]), breakpoint bookkeeping ([`breakpoints`]), the per-VCPU
//! stop-event queue ([`event`]) and the `vFile` host-filesystem passthrough
//! ([`vfile`]) to [`crate::machine::Machine`]. One `GdbStub` per monitor
//! process; it owns the session's TCP connection and runs on the main
//! thread alongside the fork/accept driver (§5 "Scheduling model").

pub mod breakpoints;
pub mod event;
pub mod proto;
pub mod signals;
pub mod vfile;

use crate::config::GDB_DEFAULT_PORT;
use crate::machine::{Machine, PauseKind, VcpuState};
use breakpoints::{BreakpointError, BreakpointKind, BreakpointTable};
use event::{EventQueue, StopReason};
use kvm_bindings::{kvm_regs, kvm_sregs};
use proto::ParseOutcome;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use thiserror::Error;
use vfile::{VfileError, VfileTable};

#[derive(Error, Debug)]
pub enum GdbError {
    #[error("failed to bind GDB listener on port {0}: {1}")]
    Bind(u16, #[source] std::io::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Breakpoint(#[from] BreakpointError),
    #[error(transparent)]
    Vfile(#[from] VfileError),
    #[error(transparent)]
    Kvm(#[from] crate::kvm::KvmError),
    #[error(transparent)]
    Mem(#[from] crate::mem::MemError),
}

/// When the stub should block waiting for a client before letting the
/// payload run (§4.K "Listening").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitForAttach {
    DontWait,
    AtDynlink,
    AtStart,
}

/// Per-thread `vCont` run state (§4.K "vCont").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Stepping,
    RangeStepping { lo: u64, hi: u64 },
    Paused,
}

/// A parsed `action[:tid]` group from a `vCont` packet.
#[derive(Debug, Clone, Copy)]
struct VcontAction {
    state: ThreadState,
    tid: Option<usize>,
}

fn parse_vcont(payload: &str) -> Vec<VcontAction> {
    payload
        .split(';')
        .skip(1) // first segment is the literal "vCont"
        .filter_map(|group| {
            let (action, tid) = match group.split_once(':') {
                Some((a, t)) => (a, usize::from_str_radix(t, 16).ok()),
                None => (group, None),
            };
            let state = if let Some(rest) = action.strip_prefix('r') {
                let (lo, hi) = rest.split_once(',')?;
                ThreadState::RangeStepping {
                    lo: u64::from_str_radix(lo, 16).ok()?,
                    hi: u64::from_str_radix(hi, 16).ok()?,
                }
            } else {
                match action.chars().next()? {
                    'c' | 'C' => ThreadState::Running,
                    's' | 'S' => ThreadState::Stepping,
                    't' => ThreadState::Paused,
                    _ => return None,
                }
            };
            Some(VcontAction { state, tid })
        })
        .collect()
}

/// Byte length of gdbserver's amd64 `g`/`G` register blob: 16 GPRs + rip (8
/// bytes each), eflags, then cs/ss/ds/es/fs/gs (4 bytes each) (§4.K "g/G").
const AMD64_REGBLOB_BYTES: usize = 17 * 8 + 4 + 6 * 4;

fn push_le_hex(out: &mut Vec<u8>, bytes: &[u8]) {
    for b in bytes {
        out.extend(format!("{b:02x}").into_bytes());
    }
}

/// Encode a VCPU's general/segment registers in gdbserver's amd64 `g`-reply
/// order (§4.K "g/G").
fn encode_amd64_regs(regs: &kvm_regs, sregs: &kvm_sregs) -> Vec<u8> {
    let mut out = Vec::with_capacity(AMD64_REGBLOB_BYTES * 2);
    for g in [
        regs.rax, regs.rbx, regs.rcx, regs.rdx, regs.rsi, regs.rdi, regs.rbp, regs.rsp, regs.r8,
        regs.r9, regs.r10, regs.r11, regs.r12, regs.r13, regs.r14, regs.r15, regs.rip,
    ] {
        push_le_hex(&mut out, &g.to_le_bytes());
    }
    push_le_hex(&mut out, &(regs.rflags as u32).to_le_bytes());
    for seg in [&sregs.cs, &sregs.ss, &sregs.ds, &sregs.es, &sregs.fs, &sregs.gs] {
        push_le_hex(&mut out, &(seg.selector as u32).to_le_bytes());
    }
    out
}

fn decode_hex_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len() / 2)
        .map(|i| u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok())
        .collect()
}

/// Decode a `G`-packet hex blob onto `regs`/`sregs`. Only each segment's
/// selector is overwritten; base/limit/access-rights stay whatever the VCPU
/// already had, matching gdbserver's amd64 target (it never sends those).
fn decode_amd64_regs(hex: &str, regs: &mut kvm_regs, sregs: &mut kvm_sregs) -> Option<()> {
    let bytes = decode_hex_bytes(hex)?;
    if bytes.len() < AMD64_REGBLOB_BYTES {
        return None;
    }
    let u64_at = |off: usize| u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
    let u32_at = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());

    let gprs: [u64; 16] = std::array::from_fn(|i| u64_at(i * 8));
    [
        &mut regs.rax,
        &mut regs.rbx,
        &mut regs.rcx,
        &mut regs.rdx,
        &mut regs.rsi,
        &mut regs.rdi,
        &mut regs.rbp,
        &mut regs.rsp,
        &mut regs.r8,
        &mut regs.r9,
        &mut regs.r10,
        &mut regs.r11,
        &mut regs.r12,
        &mut regs.r13,
        &mut regs.r14,
        &mut regs.r15,
    ]
    .into_iter()
    .zip(gprs)
    .for_each(|(dst, v)| *dst = v);

    let mut off = 16 * 8;
    regs.rip = u64_at(off);
    off += 8;
    regs.rflags = u32_at(off) as u64;
    off += 4;
    for seg in [&mut sregs.cs, &mut sregs.ss, &mut sregs.ds, &mut sregs.es, &mut sregs.fs, &mut sregs.gs] {
        seg.selector = u32_at(off) as u16;
        off += 4;
    }
    Some(())
}

/// `qSupported` feature advertisement (§4.K "GDB socket").
const SUPPORTED_FEATURES: &str = "PacketSize=4000;qXfer:threads:read+;swbreak+;hwbreak+;\
vContSupported+;qXfer:auxv:read+;qXfer:exec-file:read+;qXfer:libraries-svr4:read+";

pub struct GdbStub {
    listener: TcpListener,
    stream: Option<TcpStream>,
    bps: BreakpointTable,
    events: EventQueue,
    thread_states: HashMap<usize, ThreadState>,
    vfiles: VfileTable,
    fs_root: PathBuf,
    attached: bool,
}

impl GdbStub {
    pub fn bind(port: u16) -> Result<Self, GdbError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).map_err(|e| GdbError::Bind(port, e))?;
        // SO_REUSEADDR / TCP_NODELAY: std doesn't expose either directly on
        // the listener builder, so set them via the raw fd the way `nix`
        // callers typically do.
        let fd = listener.as_raw_fd();
        unsafe {
            let one: libc::c_int = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as u32,
            );
        }
        Ok(GdbStub {
            listener,
            stream: None,
            bps: BreakpointTable::new(),
            events: EventQueue::new(crate::config::KVM_MAX_VCPUS),
            thread_states: HashMap::new(),
            vfiles: VfileTable::new(),
            fs_root: PathBuf::from("/"),
            attached: false,
        })
    }

    pub fn bind_default() -> Result<Self, GdbError> {
        Self::bind(GDB_DEFAULT_PORT)
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Block until a client connects, then disable `TCP_NODELAY`'s inverse
    /// (enable it) on the accepted stream.
    pub fn accept(&mut self) -> Result<(), GdbError> {
        let (stream, _) = self.listener.accept()?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        self.attached = true;
        Ok(())
    }

    pub fn listener_fd(&self) -> std::os::fd::RawFd {
        self.listener.as_raw_fd()
    }

    /// `km_gdb_fork_reset()`'s equivalent: drop the session state a forked
    /// child must not inherit (current connection, queued stop events,
    /// per-thread run state) while keeping the listener so
    /// `KM_GDB_CHILD_FORK_WAIT` can still accept a fresh client on it.
    pub fn fork_reset(&mut self) {
        self.stream = None;
        self.attached = false;
        self.events = EventQueue::new(crate::config::KVM_MAX_VCPUS);
        self.thread_states.clear();
    }

    /// `g` — read every general/segment register of the first active VCPU
    /// into gdbserver's amd64 blob (§4.K "g/G"). Unavailable registers come
    /// back as `xx` per byte, per the RSP convention.
    fn read_registers(&self, machine: &Machine) -> Vec<u8> {
        let id = machine.active_vcpu_ids().first().copied().unwrap_or(0);
        let fetched = machine.with_vcpu_regs(id, |fd| -> Result<(kvm_regs, kvm_sregs), crate::kvm::KvmError> {
            Ok((fd.get_regs()?, fd.get_sregs()?))
        });
        match fetched {
            Some(Ok((regs, sregs))) => encode_amd64_regs(&regs, &sregs),
            _ => vec![b'x'; AMD64_REGBLOB_BYTES * 2],
        }
    }

    /// `Gxx...` — apply a register blob to the first active VCPU, preserving
    /// whatever it already had for anything the blob doesn't cover (segment
    /// base/limit/access rights).
    fn write_registers(&self, machine: &Machine, rest: &str) -> Result<Vec<u8>, GdbError> {
        let id = machine.active_vcpu_ids().first().copied().unwrap_or(0);
        let current = machine.with_vcpu_regs(id, |fd| -> Result<(kvm_regs, kvm_sregs), crate::kvm::KvmError> {
            Ok((fd.get_regs()?, fd.get_sregs()?))
        });
        let Some(Ok((mut regs, mut sregs))) = current else {
            return Ok(b"E01".to_vec());
        };
        if decode_amd64_regs(rest, &mut regs, &mut sregs).is_none() {
            return Ok(b"E01".to_vec());
        }
        let applied = machine.with_vcpu_mut(id, |fd| -> Result<(), crate::kvm::KvmError> {
            fd.set_regs(&regs)?;
            fd.set_sregs(&sregs)?;
            Ok(())
        });
        match applied {
            Some(Ok(())) => Ok(b"OK".to_vec()),
            _ => Ok(b"E01".to_vec()),
        }
    }

    /// The run loop consults this before resuming a VCPU out of a GDB stop:
    /// `Paused` unless a `c`/`s`/`vCont` command set it running.
    pub fn thread_state(&self, vcpu_id: usize) -> ThreadState {
        self.thread_states.get(&vcpu_id).copied().unwrap_or(ThreadState::Paused)
    }

    fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    fn send_ack(&mut self, ok: bool) -> std::io::Result<()> {
        if let Some(s) = self.stream_mut() {
            s.write_all(&[if ok { proto::ACK } else { proto::NACK }])?;
        }
        Ok(())
    }

    fn send_packet(&mut self, payload: &[u8]) -> std::io::Result<()> {
        if let Some(s) = self.stream_mut() {
            s.write_all(&proto::frame_packet(payload))?;
        }
        Ok(())
    }

    /// Pump one read from the socket and dispatch whatever complete packets
    /// it yields. Returns `false` if the client disconnected.
    pub fn pump(&mut self, machine: &Machine) -> Result<bool, GdbError> {
        let mut buf = [0u8; 4096];
        let n = match self.stream_mut() {
            Some(s) => s.read(&mut buf)?,
            None => return Ok(false),
        };
        if n == 0 {
            self.stream = None;
            self.attached = false;
            return Ok(false);
        }
        let mut remaining = &buf[..n];
        loop {
            match proto::parse_one(remaining) {
                ParseOutcome::Packet(payload, consumed) => {
                    self.send_ack(true)?;
                    let reply = self.dispatch(machine, &payload);
                    self.send_packet(&reply)?;
                    remaining = &remaining[consumed..];
                }
                ParseOutcome::BadChecksum(consumed) => {
                    self.send_ack(false)?;
                    remaining = &remaining[consumed..];
                }
                ParseOutcome::Interrupt(consumed) => {
                    machine.pause_all(PauseKind::All, crate::config::sigvcpustop(), &[]);
                    remaining = &remaining[consumed..];
                }
                ParseOutcome::Incomplete => break,
            }
            if remaining.is_empty() {
                break;
            }
        }
        Ok(true)
    }

    /// Post a stop event for `vcpu_id` and wake the main loop (§4.K "Event
    /// queue"). The caller is responsible for writing to `intr_fd`.
    pub fn notify(&mut self, vcpu_id: usize, reason: StopReason) {
        self.events.post(vcpu_id, reason);
    }

    fn stop_reply(&self, vcpu_id: usize, reason: StopReason) -> Vec<u8> {
        match reason {
            StopReason::Exited(code) => format!("W{code:02x}").into_bytes(),
            StopReason::Terminated(signo) => format!("X{:02x}", signals::linux_to_gdb(signo)).into_bytes(),
            StopReason::Signal(signo) => {
                format!("T{:02x}thread:{:x};", signals::linux_to_gdb(signo), vcpu_id + 1).into_bytes()
            }
            StopReason::Breakpoint => format!("T05thread:{:x};swbreak:;", vcpu_id + 1).into_bytes(),
            StopReason::Step => format!("T05thread:{:x};", vcpu_id + 1).into_bytes(),
        }
    }

    /// Drain the oldest pending event whose owning VCPU isn't already
    /// paused, and send its stop reply. Stale events (the VCPU moved on
    /// before being drained) are silently dropped.
    pub fn drain_one_event(&mut self, machine: &Machine) -> Result<(), GdbError> {
        while let Some(ev) = self.events.take_any() {
            if machine.vcpu_state(ev.vcpu_id) == Some(VcpuState::Paused) {
                continue;
            }
            let reply = self.stop_reply(ev.vcpu_id, ev.reason);
            self.send_packet(&reply)?;
            return Ok(());
        }
        Ok(())
    }

    fn dispatch(&mut self, machine: &Machine, payload: &[u8]) -> Vec<u8> {
        let text = String::from_utf8_lossy(payload);
        match self.handle(machine, &text) {
            Ok(reply) => reply,
            Err(_) => b"E01".to_vec(),
        }
    }

    fn handle(&mut self, machine: &Machine, text: &str) -> Result<Vec<u8>, GdbError> {
        if text == "?" {
            let ids = machine.active_vcpu_ids();
            let tid = ids.first().copied().unwrap_or(0) + 1;
            return Ok(format!("T05thread:{tid:x};").into_bytes());
        }
        if text == "g" {
            return Ok(self.read_registers(machine));
        }
        if let Some(rest) = text.strip_prefix('G') {
            return self.write_registers(machine, rest);
        }
        if let Some(rest) = text.strip_prefix('H') {
            let _ = rest; // Hg/Hc thread selection — single-threaded focus tracked by caller
            return Ok(b"OK".to_vec());
        }
        if let Some(rest) = text.strip_prefix('T') {
            let tid = usize::from_str_radix(rest, 16).unwrap_or(0);
            return Ok(if machine.active_vcpu_ids().contains(&tid.saturating_sub(1)) {
                b"OK".to_vec()
            } else {
                b"E01".to_vec()
            });
        }
        if matches!(text.chars().next(), Some('c') | Some('C') | Some('s') | Some('S')) {
            let stepping = matches!(text.chars().next(), Some('s') | Some('S'));
            for id in machine.active_vcpu_ids() {
                self.thread_states.insert(
                    id,
                    if stepping {
                        ThreadState::Stepping
                    } else {
                        ThreadState::Running
                    },
                );
            }
            machine.resume_all();
            return Ok(Vec::new()); // reply comes later as a stop event
        }
        if let Some(rest) = text.strip_prefix("vCont?") {
            let _ = rest;
            return Ok(b"vCont;c;C;s;S;r;t".to_vec());
        }
        if let Some(rest) = text.strip_prefix("vCont") {
            let actions = parse_vcont(rest);
            self.apply_vcont(machine, &actions)?;
            machine.resume_all();
            return Ok(Vec::new());
        }
        if let Some(rest) = text.strip_prefix('Z') {
            return self.insert_breakpoint(machine, rest);
        }
        if let Some(rest) = text.strip_prefix('z') {
            return self.remove_breakpoint(machine, rest);
        }
        if let Some(rest) = text.strip_prefix('m') {
            return self.read_memory(machine, rest);
        }
        if let Some(rest) = text.strip_prefix('M') {
            return self.write_memory(machine, rest);
        }
        if text == "k" || text == "D" {
            self.attached = false;
            return Ok(b"OK".to_vec());
        }
        if text == "qSupported" || text.starts_with("qSupported:") {
            return Ok(SUPPORTED_FEATURES.as_bytes().to_vec());
        }
        if text == "qfThreadInfo" {
            let ids = machine.active_vcpu_ids();
            let list = ids
                .iter()
                .map(|id| format!("{:x}", id + 1))
                .collect::<Vec<_>>()
                .join(",");
            return Ok(format!("m{list}").into_bytes());
        }
        if text == "qsThreadInfo" {
            return Ok(b"l".to_vec());
        }
        if text == "qAttached" {
            return Ok(b"1".to_vec());
        }
        if text == "qC" {
            let tid = machine.active_vcpu_ids().first().copied().unwrap_or(0) + 1;
            return Ok(format!("QC{tid:x}").into_bytes());
        }
        if let Some(rest) = text.strip_prefix("qThreadExtraInfo,") {
            let tid = usize::from_str_radix(rest, 16).unwrap_or(1);
            return Ok(proto::escape_binary(format!("vcpu{tid}").as_bytes())
                .iter()
                .flat_map(|b| format!("{b:02x}").into_bytes())
                .collect());
        }
        if let Some(rest) = text.strip_prefix("vFile:") {
            return self.handle_vfile(rest);
        }
        Ok(b"".to_vec())
    }

    fn apply_vcont(&mut self, machine: &Machine, actions: &[VcontAction]) -> Result<(), GdbError> {
        let ids = machine.active_vcpu_ids();
        for action in actions {
            match action.tid {
                Some(tid) => {
                    self.thread_states.insert(tid.saturating_sub(1), action.state);
                }
                None => {
                    for id in &ids {
                        self.thread_states.entry(*id).or_insert(action.state);
                    }
                }
            }
        }
        Ok(())
    }

    fn insert_breakpoint(&mut self, machine: &Machine, rest: &str) -> Result<Vec<u8>, GdbError> {
        let mut parts = rest.split(',');
        let ty: u8 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(255);
        let addr = parts
            .next()
            .and_then(|s| u64::from_str_radix(s, 16).ok())
            .unwrap_or(0);
        let len: u8 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(1);
        let kind = match breakpoints::kind_from_type(ty) {
            Some(k) => k,
            None => return Ok(b"".to_vec()),
        };
        match kind {
            BreakpointKind::Sw => {
                let current = machine.read_guest(addr, 1)?[0];
                let saved = self.bps.insert_sw(addr, current);
                machine.write_guest(addr, &[breakpoints::INT3])?;
                let _ = saved;
            }
            _ => {
                self.bps.insert_hw(addr, len, kind)?;
                for id in machine.active_vcpu_ids() {
                    let mut hw = machine.hw_breakpoints(id);
                    if let Some(slot) = hw.iter_mut().find(|s| s.is_none()) {
                        *slot = Some((addr, len as u32));
                    }
                    machine.set_hw_breakpoints(id, hw)?;
                }
            }
        }
        Ok(b"OK".to_vec())
    }

    fn remove_breakpoint(&mut self, machine: &Machine, rest: &str) -> Result<Vec<u8>, GdbError> {
        let mut parts = rest.split(',');
        let ty: u8 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(255);
        let addr = parts
            .next()
            .and_then(|s| u64::from_str_radix(s, 16).ok())
            .unwrap_or(0);
        let kind = match breakpoints::kind_from_type(ty) {
            Some(k) => k,
            None => return Ok(b"".to_vec()),
        };
        match kind {
            BreakpointKind::Sw => {
                if let Some(original) = self.bps.remove_sw(addr)? {
                    machine.write_guest(addr, &[original])?;
                }
            }
            _ => {
                self.bps.remove_hw(addr, kind)?;
                for id in machine.active_vcpu_ids() {
                    let mut hw = machine.hw_breakpoints(id);
                    for slot in hw.iter_mut() {
                        if matches!(*slot, Some((a, _)) if a == addr) {
                            *slot = None;
                        }
                    }
                    machine.set_hw_breakpoints(id, hw)?;
                }
            }
        }
        Ok(b"OK".to_vec())
    }

    /// `m addr,len` — reads guest memory and patches back any shadowed SW
    /// breakpoint bytes so the client sees original code (§4.K).
    fn read_memory(&self, machine: &Machine, rest: &str) -> Result<Vec<u8>, GdbError> {
        let (addr_s, len_s) = rest.split_once(',').unwrap_or((rest, "0"));
        let addr = u64::from_str_radix(addr_s, 16).unwrap_or(0);
        let len = usize::from_str_radix(len_s, 16).unwrap_or(0);
        let mut data = machine.read_guest(addr, len)?;
        for (i, byte) in data.iter_mut().enumerate() {
            if let Some(original) = self.bps.original_byte_at(addr + i as u64) {
                *byte = original;
            }
        }
        Ok(data.iter().flat_map(|b| format!("{b:02x}").into_bytes()).collect())
    }

    fn write_memory(&self, machine: &Machine, rest: &str) -> Result<Vec<u8>, GdbError> {
        let (header, hexdata) = rest.split_once(':').unwrap_or((rest, ""));
        let (addr_s, len_s) = header.split_once(',').unwrap_or((header, "0"));
        let addr = u64::from_str_radix(addr_s, 16).unwrap_or(0);
        let len = usize::from_str_radix(len_s, 16).unwrap_or(0);
        let bytes: Vec<u8> = (0..len)
            .filter_map(|i| u8::from_str_radix(hexdata.get(i * 2..i * 2 + 2)?, 16).ok())
            .collect();
        machine.write_guest(addr, &bytes)?;
        Ok(b"OK".to_vec())
    }

    fn handle_vfile(&mut self, rest: &str) -> Result<Vec<u8>, GdbError> {
        if let Some(path_hex) = rest.strip_prefix("setfs:") {
            let _ = path_hex;
            self.fs_root = std::fs::read_link(format!("/proc/{}/root", std::process::id()))
                .unwrap_or_else(|_| PathBuf::from("/"));
            return Ok(b"F0".to_vec());
        }
        if let Some(args) = rest.strip_prefix("open:") {
            let mut parts = args.splitn(3, ',');
            let path_hex = parts.next().unwrap_or("");
            let flags: u32 = parts.next().and_then(|s| u32::from_str_radix(s, 16).ok()).unwrap_or(0);
            let path_bytes: Vec<u8> = (0..path_hex.len() / 2)
                .filter_map(|i| u8::from_str_radix(&path_hex[i * 2..i * 2 + 2], 16).ok())
                .collect();
            let path = String::from_utf8_lossy(&path_bytes).into_owned();
            return match self.vfiles.open(&self.fs_root, &path, flags) {
                Ok(fd) => Ok(format!("F{fd:x}").into_bytes()),
                Err(_) => Ok(b"F-1,2".to_vec()),
            };
        }
        if let Some(args) = rest.strip_prefix("pread:") {
            let mut parts = args.split(',');
            let fd: i32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(-1);
            let count: usize = parts.next().and_then(|s| usize::from_str_radix(s, 16).ok()).unwrap_or(0);
            let offset: u64 = parts.next().and_then(|s| u64::from_str_radix(s, 16).ok()).unwrap_or(0);
            return match self.vfiles.pread(fd, count, offset) {
                Ok(data) => {
                    let mut reply = format!("F{:x};", data.len()).into_bytes();
                    reply.extend(proto::escape_binary(&data));
                    Ok(reply)
                }
                Err(_) => Ok(b"F-1,2".to_vec()),
            };
        }
        if let Some(args) = rest.strip_prefix("close:") {
            let fd: i32 = args.parse().unwrap_or(-1);
            return Ok(match self.vfiles.close(fd) {
                Ok(()) => b"F0".to_vec(),
                Err(_) => b"F-1,2".to_vec(),
            });
        }
        if let Some(args) = rest.strip_prefix("fstat:") {
            let fd: i32 = args.parse().unwrap_or(-1);
            return Ok(match self.vfiles.fstat(fd) {
                Ok(stat) => {
                    let bytes = stat.to_be_bytes();
                    let mut reply = format!("F{:x};", bytes.len()).into_bytes();
                    reply.extend(proto::escape_binary(&bytes));
                    reply
                }
                Err(_) => b"F-1,2".to_vec(),
            });
        }
        if let Some(args) = rest.strip_prefix("readlink:") {
            let path_bytes: Vec<u8> = (0..args.len() / 2)
                .filter_map(|i| u8::from_str_radix(&args[i * 2..i * 2 + 2], 16).ok())
                .collect();
            let path = String::from_utf8_lossy(&path_bytes).into_owned();
            return match std::fs::read_link(&path) {
                Ok(target) => {
                    let bytes = target.to_string_lossy().into_owned().into_bytes();
                    let mut reply = format!("F{:x};", bytes.len()).into_bytes();
                    reply.extend(proto::escape_binary(&bytes));
                    Ok(reply)
                }
                Err(_) => Ok(b"F-1,2".to_vec()),
            };
        }
        Ok(b"".to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_vcont_reads_actions_and_thread_ids() {
        let actions = parse_vcont(";c:1;s:2");
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].tid, Some(1));
        assert!(matches!(actions[0].state, ThreadState::Running));
        assert!(matches!(actions[1].state, ThreadState::Stepping));
    }

    #[test]
    fn amd64_register_blob_round_trips_gprs_rip_and_segment_selectors() {
        let regs = kvm_regs {
            rax: 0x1111_2222_3333_4444,
            rsp: 0x7fff_0000_1000,
            rip: 0x0000_5555_0000_2000,
            rflags: 0x246,
            ..Default::default()
        };
        let mut sregs = kvm_sregs::default();
        sregs.cs.selector = 0x33;
        sregs.ss.selector = 0x2b;

        let blob = encode_amd64_regs(&regs, &sregs);
        assert_eq!(blob.len(), AMD64_REGBLOB_BYTES * 2);
        let hex = String::from_utf8(blob).unwrap();

        let mut decoded_regs = kvm_regs::default();
        let mut decoded_sregs = kvm_sregs::default();
        decode_amd64_regs(&hex, &mut decoded_regs, &mut decoded_sregs).unwrap();

        assert_eq!(decoded_regs.rax, regs.rax);
        assert_eq!(decoded_regs.rsp, regs.rsp);
        assert_eq!(decoded_regs.rip, regs.rip);
        assert_eq!(decoded_regs.rflags, regs.rflags);
        assert_eq!(decoded_sregs.cs.selector, 0x33);
        assert_eq!(decoded_sregs.ss.selector, 0x2b);
    }

    #[test]
    fn decode_amd64_regs_rejects_a_truncated_blob() {
        let mut regs = kvm_regs::default();
        let mut sregs = kvm_sregs::default();
        assert!(decode_amd64_regs("1122", &mut regs, &mut sregs).is_none());
    }

    #[test]
    fn parse_vcont_reads_range_step_bounds() {
        let actions = parse_vcont(";r1000,2000:1");
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            actions[0].state,
            ThreadState::RangeStepping { lo: 0x1000, hi: 0x2000 }
        ));
    }
}
