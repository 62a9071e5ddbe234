//! The process-wide `Machine` singleton (§3 "Machine", §4.E).
//!
//! Everything else in this crate — the run loop, the hypercall table, the
//! signal engine, the GDB stub — operates through `Machine` rather than
//! touching a language-level global, per the §9 design note ("Encapsulate
//! [the machine singleton] as an explicit context threaded into every
//! component's operations... to make fork/restart semantics explicit").

use crate::config::{
    KVM_MAX_VCPUS, PAUSE_POLL_INTERVAL_MS, PAUSE_POLL_MAX_ITERATIONS, RSV_MEM_START,
};
use crate::elf::ElfTarget;
use crate::error::KmError;
use crate::fdmap::FdMap;
use crate::fork::{CloneRequest, ForkError, ForkGuard, ForkOutcome, PidTable, PreForkSnapshot};
use crate::hypercall::{errno_ret, HcArgs, HypercallContext, HypercallTable};
use crate::kvm::{CpuCaps, KvmError, VcpuFd, VmFd};
use crate::mem::{GuestMemory, MemError, MemGeometry, PageTableBuilder, RegionTable};
use crate::signal::{AltStack, SignalAction, SignalError, SignalPool, SignalQueue, SigSet};
use std::sync::{Condvar, Mutex};

/// §3 "VCPU" state enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    Starting,
    InGuest,
    Hypercall,
    HcallInt,
    Paused,
    ParkedIdle,
}

/// One VCPU's monitor-side bookkeeping (§3 "VCPU").
pub struct VcpuSlot {
    pub fd: VcpuFd,
    pub state: VcpuState,
    pub thread_pointer: u64,
    pub stack_top: u64,
    pub blocked: SigSet,
    pub altstack: Option<AltStack>,
    pub pending: SignalQueue,
    pub in_sigsuspend: bool,
    pub hw_bps: [Option<(u64, u32)>; crate::config::GDB_MAX_HW_BREAKPOINTS],
    /// Guest-virtual address of the `HcArgs` block for whichever hypercall
    /// is currently in flight on this VCPU, if any (§3/§9 restart semantics).
    pub last_hc_args_gva: Option<u64>,
}

/// VCPU table plus the idle free list (§3 "the idle-VCPU free list").
#[derive(Default)]
struct VcpuTable {
    slots: Vec<Option<VcpuSlot>>,
    idle: Vec<usize>,
    run_count: usize,
}

/// Process-wide signal bookkeeping (§5 "Pending signal lists, free-signal
/// pool, sigmask" under `signal_mutex`).
struct SignalState {
    actions: [SignalAction; 65],
    queue: SignalQueue,
    pool: SignalPool,
}

impl Default for SignalState {
    fn default() -> Self {
        SignalState {
            actions: std::array::from_fn(|_| SignalAction::default()),
            queue: SignalQueue::default(),
            pool: SignalPool::default(),
        }
    }
}

/// §4.E "Pause protocol" scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseKind {
    GuestOnly,
    All,
}

struct PauseState {
    requested: Mutex<bool>,
    cv: Condvar,
}

impl Default for PauseState {
    fn default() -> Self {
        PauseState {
            requested: Mutex::new(false),
            cv: Condvar::new(),
        }
    }
}

pub struct Machine {
    vm: VmFd,
    cpu_caps: CpuCaps,
    geometry: MemGeometry,
    mem: Mutex<GuestMemory>,
    regions: Mutex<RegionTable>,
    pagetable: PageTableBuilder,
    heap: Mutex<crate::mem::Heap>,
    vcpus: Mutex<VcpuTable>,
    signals: Mutex<SignalState>,
    pause: PauseState,
    fork_guard: Mutex<ForkGuard>,
    pids: Mutex<PidTable>,
    fds: Mutex<FdMap>,
    hypercalls: HypercallTable,
    pid: i32,
    exit_status: Mutex<Option<i32>>,
    pending_clone: Mutex<Option<CloneRequest>>,
    intr_fd: std::os::fd::RawFd,
    shutdown_fd: std::os::fd::RawFd,
}

/// KVM memory slot the reserved page-table area is registered under, kept
/// past `KM_MEM_SLOTS` so it never collides with a memreg slot (§4.A).
fn reserved_mem_slot() -> u32 {
    KVM_MAX_VCPUS as u32 + crate::config::KM_MEM_SLOTS as u32
}

fn new_eventfd() -> std::os::fd::RawFd {
    // SAFETY: eventfd(2) with no flags; failure is fatal at startup, matching
    // §7 "Driver ioctl failures at setup" for every other setup step.
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
    assert!(fd >= 0, "eventfd() failed: {}", std::io::Error::last_os_error());
    fd
}

impl Machine {
    pub fn new(vm: VmFd, cpu_caps: CpuCaps) -> Self {
        let geometry = MemGeometry::new(cpu_caps.guest_max_physmem);
        Machine {
            vm,
            cpu_caps,
            geometry,
            mem: Mutex::new(GuestMemory::new()),
            regions: Mutex::new(RegionTable::new(geometry)),
            pagetable: PageTableBuilder::new(RSV_MEM_START, cpu_caps.pdpe1gb),
            heap: Mutex::new(crate::mem::Heap::new(cpu_caps.guest_max_physmem)),
            vcpus: Mutex::new(VcpuTable::default()),
            signals: Mutex::new(SignalState::default()),
            pause: PauseState::default(),
            fork_guard: Mutex::new(ForkGuard::default()),
            pids: Mutex::new(PidTable::new()),
            fds: Mutex::new(FdMap::with_stdio()),
            hypercalls: HypercallTable::with_linux_abi(),
            pid: 1,
            exit_status: Mutex::new(None),
            pending_clone: Mutex::new(None),
            intr_fd: new_eventfd(),
            shutdown_fd: new_eventfd(),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn exit_status(&self) -> Option<i32> {
        *self.exit_status.lock().unwrap()
    }

    pub fn fork_requested(&self) -> bool {
        self.pending_clone.lock().unwrap().is_some()
    }

    /// §4.H "Delivery", `DFL` branch: terminate the payload for an
    /// uncaught default-dispositioned signal, whether or not its default
    /// action also dumps core (writing the actual core file is the
    /// core-dump writer's job, out of scope per spec.md §1). Matches the
    /// shell's `128 + signo` convention so the caller's own exit status
    /// still distinguishes which signal killed it.
    pub fn terminate_with_signal(&self, signo: i32) {
        let mut status = self.exit_status.lock().unwrap();
        if status.is_none() {
            *status = Some(128 + signo);
        }
    }

    pub fn intr_fd(&self) -> std::os::fd::RawFd {
        self.intr_fd
    }

    pub fn shutdown_fd(&self) -> std::os::fd::RawFd {
        self.shutdown_fd
    }

    /// §4.E "VCPU acquisition (get)".
    pub fn get(&self, lstar: u64) -> Result<usize, KvmError> {
        let mut table = self.vcpus.lock().unwrap();
        if let Some(id) = table.idle.pop() {
            let slot = table.slots[id].as_mut().expect("idle id must have a slot");
            slot.state = VcpuState::Starting;
            return Ok(id);
        }
        let id = table.slots.len();
        if id >= KVM_MAX_VCPUS {
            return Err(KvmError::CreateVcpu(kvm_ioctls::Error::new(libc::EMFILE)));
        }
        let is_bsp = id == 0;
        let fd = self.vm.create_vcpu(id as u64, lstar, is_bsp)?;
        table.slots.push(Some(VcpuSlot {
            fd,
            state: VcpuState::Starting,
            thread_pointer: 0,
            stack_top: 0,
            blocked: SigSet::empty(),
            altstack: None,
            pending: SignalQueue::new(),
            in_sigsuspend: false,
            hw_bps: [None; crate::config::GDB_MAX_HW_BREAKPOINTS],
            last_hc_args_gva: None,
        }));
        table.run_count += 1;
        Ok(id)
    }

    /// §4.E "Release (put)".
    pub fn put(&self, id: usize) {
        let mut table = self.vcpus.lock().unwrap();
        if let Some(slot) = table.slots[id].as_mut() {
            slot.thread_pointer = 0;
            slot.state = VcpuState::ParkedIdle;
        }
        table.idle.push(id);
        table.run_count = table.run_count.saturating_sub(1);
        if table.run_count == 0 {
            let one: u64 = 1;
            unsafe {
                libc::write(
                    self.shutdown_fd,
                    &one as *const u64 as *const libc::c_void,
                    8,
                );
            }
        }
    }

    pub fn set_vcpu_state(&self, id: usize, state: VcpuState) {
        let mut table = self.vcpus.lock().unwrap();
        if let Some(slot) = table.slots[id].as_mut() {
            slot.state = state;
        }
    }

    pub fn vcpu_state(&self, id: usize) -> Option<VcpuState> {
        self.vcpus.lock().unwrap().slots[id].as_ref().map(|s| s.state)
    }

    /// Records the `HcArgs` pointer of the hypercall now in flight on `id`,
    /// so a restart after `HCALL_INT` can assert it didn't move (§9).
    pub fn set_last_hc_args_gva(&self, id: usize, gva: Option<u64>) {
        let mut table = self.vcpus.lock().unwrap();
        if let Some(slot) = table.slots[id].as_mut() {
            slot.last_hc_args_gva = gva;
        }
    }

    pub fn last_hc_args_gva(&self, id: usize) -> Option<u64> {
        self.vcpus.lock().unwrap().slots[id].as_ref().and_then(|s| s.last_hc_args_gva)
    }

    pub fn with_vcpu_regs<R>(&self, id: usize, f: impl FnOnce(&VcpuFd) -> R) -> Option<R> {
        let table = self.vcpus.lock().unwrap();
        table.slots[id].as_ref().map(|slot| f(&slot.fd))
    }

    /// Exclusive access to the VCPU, used by the run loop to call
    /// `VcpuFd::run`. Holding the table lock across the blocking `KVM_RUN`
    /// ioctl serializes table-wide bookkeeping (`get`/`put`/GDB thread
    /// queries) behind whichever VCPU is currently executing; acceptable
    /// here since those operations are themselves brief, but a production
    /// rework would shard the table into one lock per slot.
    pub fn with_vcpu_mut<R>(&self, id: usize, f: impl FnOnce(&mut VcpuFd) -> R) -> Option<R> {
        let mut table = self.vcpus.lock().unwrap();
        table.slots[id].as_mut().map(|slot| f(&mut slot.fd))
    }

    pub fn set_thread_pointer(&self, id: usize, tp: u64) {
        let mut table = self.vcpus.lock().unwrap();
        if let Some(slot) = table.slots[id].as_mut() {
            slot.thread_pointer = tp;
        }
    }

    pub fn set_stack_top(&self, id: usize, top: u64) {
        let mut table = self.vcpus.lock().unwrap();
        if let Some(slot) = table.slots[id].as_mut() {
            slot.stack_top = top;
        }
    }

    pub fn stack_top(&self, id: usize) -> u64 {
        self.vcpus.lock().unwrap().slots[id].as_ref().map(|s| s.stack_top).unwrap_or(0)
    }

    pub fn blocked_mask(&self, id: usize) -> SigSet {
        self.vcpus.lock().unwrap().slots[id].as_ref().map(|s| s.blocked).unwrap_or(SigSet::empty())
    }

    pub fn set_blocked_mask(&self, id: usize, mask: SigSet) {
        let mut table = self.vcpus.lock().unwrap();
        if let Some(slot) = table.slots[id].as_mut() {
            slot.blocked = mask;
        }
    }

    pub fn altstack(&self, id: usize) -> Option<AltStack> {
        self.vcpus.lock().unwrap().slots[id].as_ref().and_then(|s| s.altstack)
    }

    /// Post a signal to the VCPU's own pending queue, charging the
    /// process-wide free-signal pool (§4.H "post_signal").
    pub fn post_signal_to_vcpu(&self, id: usize, record: crate::signal::SignalRecord) -> Result<(), SignalError> {
        let mut signals = self.signals.lock().unwrap();
        let mut table = self.vcpus.lock().unwrap();
        let slot = table.slots[id].as_mut().expect("vcpu slot must exist");
        crate::signal::post_signal(&mut slot.pending, &mut signals.pool, record)
    }

    /// Dequeue the next deliverable signal for this VCPU, honoring its
    /// current blocked mask.
    pub fn dequeue_signal(&self, id: usize) -> Option<crate::signal::SignalRecord> {
        let mut table = self.vcpus.lock().unwrap();
        let slot = table.slots[id].as_mut()?;
        let record = slot.pending.dequeue(slot.blocked)?;
        drop(table);
        self.signals.lock().unwrap().pool.free();
        Some(record)
    }

    pub fn signal_action(&self, signo: i32) -> SignalAction {
        self.signals.lock().unwrap().actions[signo as usize]
    }

    /// VCPU ids currently occupying a slot (running or paused, not idle) —
    /// the thread list `qfThreadInfo`/`qsThreadInfo` enumerate.
    pub fn active_vcpu_ids(&self) -> Vec<usize> {
        let table = self.vcpus.lock().unwrap();
        table
            .slots
            .iter()
            .enumerate()
            .filter_map(|(id, s)| s.as_ref().filter(|s| s.state != VcpuState::ParkedIdle).map(|_| id))
            .collect()
    }

    pub fn thread_pointer(&self, id: usize) -> Option<u64> {
        self.vcpus.lock().unwrap().slots[id].as_ref().map(|s| s.thread_pointer)
    }

    /// Replace a VCPU's hardware-breakpoint shadow and reprogram its debug
    /// registers (§4.K "HW").
    pub fn set_hw_breakpoints(
        &self,
        id: usize,
        bps: [Option<(u64, u32)>; crate::config::GDB_MAX_HW_BREAKPOINTS],
    ) -> Result<(), KvmError> {
        let mut table = self.vcpus.lock().unwrap();
        let slot = table.slots[id].as_mut().expect("vcpu slot must exist");
        slot.hw_bps = bps;
        sync_hw_breakpoints(&slot.fd, &slot.hw_bps)
    }

    pub fn hw_breakpoints(&self, id: usize) -> [Option<(u64, u32)>; crate::config::GDB_MAX_HW_BREAKPOINTS] {
        self.vcpus.lock().unwrap().slots[id].as_ref().map(|s| s.hw_bps).unwrap_or([None; crate::config::GDB_MAX_HW_BREAKPOINTS])
    }

    /// §4.E "Pause protocol". Sends `KM_SIGVCPUSTOP` to every VCPU still
    /// `IN_GUEST` and polls with a 1 ms back-off, bounded at ~100 iterations.
    pub fn pause_all(&self, kind: PauseKind, sigvcpustop: i32, thread_ids: &[libc::pthread_t]) {
        *self.pause.requested.lock().unwrap() = true;

        for _ in 0..PAUSE_POLL_MAX_ITERATIONS {
            let still_running = {
                let table = self.vcpus.lock().unwrap();
                table.slots.iter().flatten().any(|s| match kind {
                    PauseKind::GuestOnly => s.state == VcpuState::InGuest,
                    PauseKind::All => s.state != VcpuState::Paused && s.state != VcpuState::ParkedIdle,
                })
            };
            if !still_running {
                return;
            }
            for &tid in thread_ids {
                unsafe {
                    libc::pthread_kill(tid, sigvcpustop);
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(PAUSE_POLL_INTERVAL_MS));
        }
        panic!("pause_all: VCPUs failed to quiesce within the poll bound (§4.E)");
    }

    pub fn resume_all(&self) {
        *self.pause.requested.lock().unwrap() = false;
        self.pause.cv.notify_all();
    }

    pub fn pause_requested(&self) -> bool {
        *self.pause.requested.lock().unwrap()
    }

    /// Block the calling thread until `resume_all` runs, used by
    /// `handle_pause` in the run loop (§4.F).
    pub fn wait_for_resume(&self) {
        let guard = self.pause.requested.lock().unwrap();
        if !*guard {
            return;
        }
        let _unused = self.pause.cv.wait_while(guard, |requested| *requested).unwrap();
    }

    pub fn hypercalls(&self) -> &HypercallTable {
        &self.hypercalls
    }

    pub fn cpu_caps(&self) -> CpuCaps {
        self.cpu_caps
    }

    pub fn geometry(&self) -> MemGeometry {
        self.geometry
    }

    /// Map the reserved page-table area (`[RSV_MEM_START, RSV_MEM_START +
    /// RSV_MEM_SIZE)`) into guest-physical memory and register it with KVM.
    /// Lives below `GUEST_MEM_START_VA` and outside the memreg geometry the
    /// heap grows, so it's registered directly at a fixed slot rather than
    /// through `RegionTable`/`Heap::set_brk`. Must run once, before
    /// `init_page_tables` and before any VCPU is created.
    pub fn map_reserved_region(&self) -> Result<(), MemError> {
        let mut mem = self.mem.lock().unwrap();
        let host_addr = mem.map_region(RSV_MEM_START, crate::config::RSV_MEM_SIZE)?;
        // SAFETY: `host_addr` came from `map_region` just above and stays
        // valid for the process lifetime (the reserved mapping is never
        // freed).
        unsafe {
            self.vm
                .set_user_memory_region(reserved_mem_slot(), RSV_MEM_START, crate::config::RSV_MEM_SIZE, host_addr)
                .map_err(MemError::Kvm)?;
        }
        Ok(())
    }

    /// One-time setup of the reserved page-table area, before any VCPU runs.
    pub fn init_page_tables(&self) -> Result<(), MemError> {
        let mem = self.mem.lock().unwrap();
        self.pagetable.init(&mem)
    }

    pub fn gva_to_gpa(&self, gva: u64) -> u64 {
        self.heap.lock().unwrap().gva_to_gpa(gva)
    }

    pub fn read_guest(&self, gva_gpa: u64, len: usize) -> Result<Vec<u8>, MemError> {
        let mem = self.mem.lock().unwrap();
        let mut buf = vec![0u8; len];
        mem.read(gva_gpa, &mut buf)?;
        Ok(buf)
    }

    pub fn write_guest(&self, gpa: u64, data: &[u8]) -> Result<(), MemError> {
        let mem = self.mem.lock().unwrap();
        mem.write(gpa, data)
    }

    pub fn read_hc_args(&self, gpa: u64) -> Result<HcArgs, MemError> {
        let mem = self.mem.lock().unwrap();
        HcArgs::read(&mem, gpa)
    }

    /// Runs `f` with a reference to guest memory, for callers (signal
    /// delivery) that need to build a frame against it directly rather than
    /// going through `read_guest`/`write_guest` byte slices.
    pub fn with_guest_mem<R>(&self, f: impl FnOnce(&GuestMemory) -> R) -> R {
        let mem = self.mem.lock().unwrap();
        f(&mem)
    }

    pub fn write_hc_args(&self, gpa: u64, args: &HcArgs) -> Result<(), MemError> {
        let mem = self.mem.lock().unwrap();
        args.write_ret(&mem, gpa)
    }

    /// Guest-virtual-addressed write, for setup code (initial process stack)
    /// that runs before any `VcpuHcCtx` exists to route through.
    pub fn write_guest_gva(&self, gva: u64, data: &[u8]) -> Result<(), MemError> {
        let gpa = self.gva_to_gpa(gva);
        self.write_guest(gpa, data)
    }

    /// Move the top-zone (`tbrk`) boundary down to `target`, mapping whole
    /// memregs as needed (§4.C). Used once at startup to reserve the initial
    /// process stack before any VCPU is created — the same growth path
    /// `VcpuHcCtx::set_tbrk` uses for a running guest's `tbrk` hypercall.
    pub fn grow_stack(&self, target: u64) -> Result<u64, MemError> {
        let mut heap = self.heap.lock().unwrap();
        let mut mem = self.mem.lock().unwrap();
        let mut regions = self.regions.lock().unwrap();
        let (new_tbrk, mappings) = heap.set_tbrk(target, &mut mem, &mut regions, &self.pagetable)?;
        for m in mappings {
            // SAFETY: `m.host_addr` came from `GuestMemory::map_region` just
            // above and stays valid for the slot's lifetime.
            unsafe {
                self.vm
                    .set_user_memory_region(m.slot, m.gpa, m.size, m.host_addr)
                    .map_err(MemError::Kvm)?;
            }
        }
        Ok(new_tbrk)
    }

    /// Drive §4.J's fork/clone checklist for real: snapshot the calling
    /// VCPU, `fork(2)` the host process, and in the child rebuild a fresh
    /// VM around the guest memory this process already has mapped. Must
    /// only be called after every other VCPU thread has quiesced and
    /// joined — `fork()` preserves only the calling thread, so anything
    /// still running elsewhere (another VCPU mid-`KVM_RUN`, the GDB accept
    /// loop) simply vanishes in the child.
    pub fn fork_child(&self, vcpu_id: usize) -> Result<ForkOutcome, KmError> {
        self.fork_guard.lock().unwrap().begin()?;
        let snapshot = match self.snapshot_for_fork(vcpu_id) {
            Ok(s) => s,
            Err(e) => {
                self.fork_guard.lock().unwrap().end();
                return Err(e);
            }
        };

        // SAFETY: called only from the single thread driving `vcpu_id`,
        // after every other VCPU thread has already joined — no concurrent
        // KVM_RUN or guest-memory access races with fork()'s copy-on-write
        // snapshot of this process.
        let pid = unsafe { libc::fork() };
        self.fork_guard.lock().unwrap().end();
        if pid < 0 {
            return Err(ForkError::Fork(std::io::Error::last_os_error()).into());
        }
        if pid > 0 {
            let child_monitor_pid = self.pids.lock().unwrap().insert(pid)?;
            return Ok(ForkOutcome::Parent { child_monitor_pid });
        }

        Ok(ForkOutcome::Child(Box::new(self.reinit_forked_child(&snapshot)?)))
    }

    /// §4.J "Pre-fork": capture everything the child must transplant onto
    /// its single surviving VCPU before the host `fork()` runs.
    fn snapshot_for_fork(&self, vcpu_id: usize) -> Result<PreForkSnapshot, KmError> {
        let (regs, sregs) = self
            .with_vcpu_regs(vcpu_id, |fd| -> Result<_, KvmError> {
                Ok((fd.get_regs()?, fd.get_sregs()?))
            })
            .expect("vcpu slot must exist")?;
        let clone_req = self.pending_clone.lock().unwrap().take();
        Ok(PreForkSnapshot {
            regs,
            sregs,
            stack_top: self.stack_top(vcpu_id),
            thread_pointer: self.thread_pointer(vcpu_id).unwrap_or(0),
            altstack: self.altstack(vcpu_id),
            blocked: self.blocked_mask(vcpu_id),
            child_stack_top: clone_req.and_then(|r| r.child_stack_top()),
        })
    }

    /// §4.J "In the child": the inherited driver handles are stale past
    /// `fork()` (KVM fds don't carry VM state across it), so re-run the
    /// driver open and re-register every already-mapped region's slot
    /// against the new `VmFd` before creating the child's single VCPU from
    /// `snapshot`. The memory itself is transplanted, not rebuilt — `fork()`
    /// keeps every mapping this process made before it valid at the same
    /// host address.
    fn reinit_forked_child(&self, snapshot: &PreForkSnapshot) -> Result<Machine, KmError> {
        let old_mem = std::mem::replace(&mut *self.mem.lock().unwrap(), GuestMemory::new());
        let old_regions = std::mem::replace(
            &mut *self.regions.lock().unwrap(),
            RegionTable::new(self.geometry),
        );
        let old_heap = std::mem::replace(
            &mut *self.heap.lock().unwrap(),
            crate::mem::Heap::new(self.cpu_caps.guest_max_physmem),
        );
        let old_pids = std::mem::replace(&mut *self.pids.lock().unwrap(), PidTable::new());

        let driver = crate::kvm::open(Some(self.cpu_caps.pdpe1gb))?;
        let child = Machine::new(driver.vm, driver.cpu_caps);

        // SAFETY: each `host_addr` points at memory this process already
        // had mapped before `fork()`; the mapping stays valid at the same
        // address in the child, only the KVM slot referencing it needs
        // redoing against the child's own `VmFd`.
        let rsv_host_addr = old_mem
            .host_addr(RSV_MEM_START)
            .expect("reserved region must already be mapped before any fork can happen");
        unsafe {
            child
                .vm
                .set_user_memory_region(reserved_mem_slot(), RSV_MEM_START, crate::config::RSV_MEM_SIZE, rsv_host_addr)
                .map_err(MemError::Kvm)?;
        }
        for idx in 0..crate::config::KM_MEM_SLOTS as u32 {
            let Some(slot) = old_regions.slot(idx) else {
                continue;
            };
            let host_addr = old_mem
                .host_addr(slot.gpa)
                .expect("an allocated memreg must be backed by a real mapping");
            unsafe {
                child
                    .vm
                    .set_user_memory_region(idx, slot.gpa, slot.size, host_addr)
                    .map_err(MemError::Kvm)?;
            }
        }

        *child.mem.lock().unwrap() = old_mem;
        *child.regions.lock().unwrap() = old_regions;
        *child.heap.lock().unwrap() = old_heap;
        *child.pids.lock().unwrap() = old_pids;

        let vcpu_id = child.get(crate::config::GUEST_MEM_START_VA)?;
        let mut regs = snapshot.regs;
        if let Some(top) = snapshot.child_stack_top {
            regs.rsp = top;
        }
        child
            .with_vcpu_mut(vcpu_id, |fd| -> Result<(), KvmError> {
                fd.set_regs(&regs)?;
                fd.set_sregs(&snapshot.sregs)?;
                Ok(())
            })
            .expect("vcpu slot must exist right after get()")?;
        child.set_thread_pointer(vcpu_id, snapshot.thread_pointer);
        child.set_stack_top(vcpu_id, snapshot.stack_top);
        child.set_blocked_mask(vcpu_id, snapshot.blocked);
        if let Some(altstack) = snapshot.altstack {
            let mut table = child.vcpus.lock().unwrap();
            table.slots[vcpu_id].as_mut().expect("vcpu slot must exist").altstack = Some(altstack);
        }

        Ok(child)
    }
}

/// Per-hypercall view bound to the VCPU that issued it; implements
/// [`HypercallContext`] on `Machine`'s behalf (§4.G, §4.F "Hypercall
/// preamble").
pub struct VcpuHcCtx<'a> {
    pub machine: &'a Machine,
    pub vcpu_id: usize,
}

impl HypercallContext for VcpuHcCtx<'_> {
    fn guest_mem(&self) -> &GuestMemory {
        unimplemented!("callers use read_guest_bytes/write_guest_bytes instead of a raw borrow")
    }

    fn read_guest_bytes(&self, gva: u64, len: usize) -> Result<Vec<u8>, MemError> {
        let gpa = self.machine.heap.lock().unwrap().gva_to_gpa(gva);
        self.machine.read_guest(gpa, len)
    }

    fn write_guest_bytes(&mut self, gva: u64, data: &[u8]) -> Result<(), MemError> {
        let gpa = self.machine.heap.lock().unwrap().gva_to_gpa(gva);
        self.machine.write_guest(gpa, data)
    }

    fn set_brk(&mut self, target: u64) -> Result<u64, MemError> {
        let mut heap = self.machine.heap.lock().unwrap();
        let mut mem = self.machine.mem.lock().unwrap();
        let mut regions = self.machine.regions.lock().unwrap();
        let (new_brk, mappings) =
            heap.set_brk(target, &mut mem, &mut regions, &self.machine.pagetable)?;
        for m in mappings {
            // SAFETY: `m.host_addr` came from `GuestMemory::map_region` just
            // above and stays valid for the slot's lifetime.
            unsafe {
                self.machine
                    .vm
                    .set_user_memory_region(m.slot, m.gpa, m.size, m.host_addr)
                    .map_err(MemError::Kvm)?;
            }
        }
        Ok(new_brk)
    }

    fn set_tbrk(&mut self, target: u64) -> Result<u64, MemError> {
        let mut heap = self.machine.heap.lock().unwrap();
        let mut mem = self.machine.mem.lock().unwrap();
        let mut regions = self.machine.regions.lock().unwrap();
        let (new_tbrk, mappings) =
            heap.set_tbrk(target, &mut mem, &mut regions, &self.machine.pagetable)?;
        for m in mappings {
            unsafe {
                self.machine
                    .vm
                    .set_user_memory_region(m.slot, m.gpa, m.size, m.host_addr)
                    .map_err(MemError::Kvm)?;
            }
        }
        Ok(new_tbrk)
    }

    fn current_brk(&self) -> u64 {
        self.machine.heap.lock().unwrap().brk()
    }

    fn current_tbrk(&self) -> u64 {
        self.machine.heap.lock().unwrap().tbrk()
    }

    fn sigaction(&mut self, signo: i32, new: Option<SignalAction>) -> Option<SignalAction> {
        let mut signals = self.machine.signals.lock().unwrap();
        let idx = signo as usize;
        let old = signals.actions[idx];
        if let Some(action) = new {
            signals.actions[idx] = action;
        }
        Some(old)
    }

    fn sigprocmask(&mut self, how: i32, set: Option<SigSet>) -> SigSet {
        const SIG_BLOCK: i32 = 0;
        const SIG_UNBLOCK: i32 = 1;
        const SIG_SETMASK: i32 = 2;
        let mut table = self.machine.vcpus.lock().unwrap();
        let slot = table.slots[self.vcpu_id].as_mut().expect("vcpu slot must exist");
        let old = slot.blocked;
        if let Some(set) = set {
            slot.blocked = match how {
                SIG_BLOCK => old.union(set),
                SIG_UNBLOCK => old.difference(set),
                SIG_SETMASK => set,
                _ => old,
            };
        }
        old
    }

    fn sigaltstack(&mut self, base: u64, size: u64, flags: i32) -> Result<(), SignalError> {
        let stack = crate::signal::validate_altstack(base, size, flags)?;
        let mut table = self.machine.vcpus.lock().unwrap();
        let slot = table.slots[self.vcpu_id].as_mut().expect("vcpu slot must exist");
        slot.altstack = Some(stack);
        Ok(())
    }

    fn host_write(&mut self, fd: i32, data: &[u8]) -> std::io::Result<usize> {
        let host_fd = self
            .machine
            .fds
            .lock()
            .unwrap()
            .host_fd(fd)
            .ok_or_else(|| std::io::Error::from_raw_os_error(libc::EBADF))?;
        let n = unsafe {
            libc::write(host_fd, data.as_ptr() as *const libc::c_void, data.len())
        };
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn host_read(&mut self, fd: i32, buf: &mut [u8]) -> std::io::Result<usize> {
        let host_fd = self
            .machine
            .fds
            .lock()
            .unwrap()
            .host_fd(fd)
            .ok_or_else(|| std::io::Error::from_raw_os_error(libc::EBADF))?;
        let n = unsafe {
            libc::read(host_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn request_exit(&mut self, status: i32) {
        *self.machine.exit_status.lock().unwrap() = Some(status);
    }

    fn request_fork(&mut self, flags: u64, child_stack: u64) {
        *self.machine.pending_clone.lock().unwrap() = Some(CloneRequest { flags, child_stack });
    }

    fn getpid(&self) -> i32 {
        self.machine.pids.lock().unwrap().own_pid()
    }

    fn setsid(&mut self) -> i64 {
        let mut pids = self.machine.pids.lock().unwrap();
        let pid = pids.own_pid();
        pids.setsid(pid) as i64
    }

    fn setpgid(&mut self, pid: i32, pgid: i32) -> i64 {
        self.machine.pids.lock().unwrap().setpgid(pid, pgid);
        0
    }

    fn getpgid(&self, pid: i32) -> i64 {
        self.machine
            .pids
            .lock()
            .unwrap()
            .getpgid(pid)
            .map(|p| p as i64)
            .unwrap_or(errno_ret(libc::ESRCH))
    }
}

/// Bridges the ELF loader (§1 external collaborator) to the memory manager
/// through the bottom (`brk`) zone.
pub struct ElfLoadTarget<'a> {
    pub machine: &'a Machine,
}

impl ElfTarget for ElfLoadTarget<'_> {
    fn ensure_mapped(&mut self, start: u64, len: u64) -> Result<(), String> {
        let mut heap = self.machine.heap.lock().unwrap();
        let mut mem = self.machine.mem.lock().unwrap();
        let mut regions = self.machine.regions.lock().unwrap();
        let target_brk = (start + len).max(heap.brk());
        let (_, mappings) = heap
            .set_brk(target_brk, &mut mem, &mut regions, &self.machine.pagetable)
            .map_err(|e| e.to_string())?;
        for m in mappings {
            unsafe {
                self.machine
                    .vm
                    .set_user_memory_region(m.slot, m.gpa, m.size, m.host_addr)
                    .map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), String> {
        let gpa = self.machine.heap.lock().unwrap().gva_to_gpa(addr);
        self.machine.write_guest(gpa, data).map_err(|e| e.to_string())
    }

    fn zero(&mut self, addr: u64, len: u64) -> Result<(), String> {
        self.write(addr, &vec![0u8; len as usize])
    }
}

/// Recompute and reprogram a VCPU's hardware-breakpoint `DR0..3`/`DR7` from
/// its shadow copy (§4.K "HW" breakpoints); exposed here since both the run
/// loop and the GDB stub touch it.
pub fn sync_hw_breakpoints(fd: &VcpuFd, hw_bps: &[Option<(u64, u32)>; 4]) -> Result<(), KvmError> {
    let bps: Vec<(u64, u32)> = hw_bps.iter().filter_map(|b| *b).collect();
    fd.set_guest_debug(&bps, false)
}
