//! Per-VCPU run loop (§4.F).
//!
//! One OS thread per VCPU drives this loop: `handle_pause`, one `KVM_RUN`,
//! classify the exit, dispatch a hypercall or translate a fault, drain any
//! deliverable signal, repeat. Generalizes `carbon`'s single-VCPU
//! `vcpu.run_with_io` loop in `main.rs` into a per-thread function that
//! knows about hypercalls, GDB events, and signal delivery instead of a
//! device-dispatch `IoHandler`.

use crate::config::{sigvcpustop, KM_HCALL_PORT_BASE, KM_MAX_HCALL};
use crate::decode::GvaReader;
use crate::error::KmError;
use crate::gdb::event::StopReason;
use crate::gdb::GdbStub;
use crate::hypercall::{HcArgs, HcResult};
use crate::intr::{syscall_args_from_regs, translate_exception, InterruptFrame, InterruptOutcome};
use crate::kvm::vcpu::VcpuExit;
use crate::machine::{Machine, PauseKind, VcpuHcCtx, VcpuState};
use crate::mem::MemError;
use crate::signal::{DeliveryContext, SignalError};
use std::sync::Mutex;

/// Reads guest memory through a `Machine`'s virtual-to-physical translation,
/// for the instruction decoder's `#GP`/`#UD` fault-address recovery (§4.D).
struct MachineGvaReader<'a>(&'a Machine);

impl GvaReader for MachineGvaReader<'_> {
    fn read_u8(&self, gva: u64) -> Option<u8> {
        let gpa = self.0.gva_to_gpa(gva);
        self.0.read_guest(gpa, 1).ok()?.first().copied()
    }
}

/// Outcome of one `run_vcpu` call — why the thread stopped driving this
/// VCPU.
#[derive(Debug)]
pub enum RunOutcome {
    Exited(i32),
    ForkRequested,
    Stopped,
}

/// The `#UD`-on-`SYSCALL` interrupt frame the guest's stub leaves behind,
/// recovered from the `HC_guest_interrupt` args block (`vector, error_code,
/// cr2`) rather than a dedicated MSR read (§4.I).
fn interrupt_frame_from_args(args: &HcArgs) -> InterruptFrame {
    InterruptFrame {
        vector: args.arg[0],
        error_code: args.arg[1],
        cr2: args.arg[2],
    }
}

fn is_hypercall_port(port: u16) -> bool {
    port >= KM_HCALL_PORT_BASE && ((port - KM_HCALL_PORT_BASE) as usize) < KM_MAX_HCALL
}

/// Run VCPU `id` until it exits, forks, or the process asks it to stop.
/// `gdb` is `None` when no debugger is attached this run.
pub fn run_vcpu(machine: &Machine, id: usize, gdb: Option<&Mutex<GdbStub>>) -> Result<RunOutcome, KmError> {
    loop {
        handle_pause(machine, id);

        if let Some(status) = machine.exit_status() {
            return Ok(RunOutcome::Exited(status));
        }
        if machine.fork_requested() {
            return Ok(RunOutcome::ForkRequested);
        }

        machine.set_vcpu_state(id, VcpuState::InGuest);
        let exit = machine
            .with_vcpu_mut(id, |fd| fd.run())
            .expect("vcpu slot must exist while its thread runs")?;

        match exit {
            VcpuExit::Interrupted => continue,
            VcpuExit::Io(io) if io.is_out && is_hypercall_port(io.port) => {
                let hc_no = (io.port - KM_HCALL_PORT_BASE) as usize;
                match dispatch_hypercall(machine, id, hc_no, io.data)? {
                    HcResult::Continue => {}
                    HcResult::Stop => return Ok(RunOutcome::Stopped),
                    HcResult::AllStop => {
                        machine.pause_all(PauseKind::All, sigvcpustop(), &[]);
                        return Ok(RunOutcome::Stopped);
                    }
                    HcResult::DoFork => return Ok(RunOutcome::ForkRequested),
                }
            }
            VcpuExit::Io(_) => {}
            VcpuExit::Debug(dbg) => {
                if let Some(gdb) = gdb {
                    let reason = if dbg.exception == 1 && dbg.dr6 & 0xf == 0 {
                        StopReason::Step
                    } else {
                        StopReason::Breakpoint
                    };
                    gdb.lock().unwrap().notify(id, reason);
                    notify_gdb_main_thread(machine);
                }
                machine.set_vcpu_state(id, VcpuState::Paused);
                machine.wait_for_resume();
            }
            VcpuExit::Shutdown => return Ok(RunOutcome::Exited(0)),
            VcpuExit::InternalError => {
                return Err(KmError::Io(std::io::Error::other("KVM_EXIT_INTERNAL_ERROR")))
            }
            VcpuExit::FailEntry(reason) => {
                return Err(KmError::Io(std::io::Error::other(format!(
                    "KVM_EXIT_FAIL_ENTRY: {reason:#x}"
                ))))
            }
            VcpuExit::Unknown(name) => {
                tracing::warn!(vcpu_id = id, exit = name, "unhandled KVM exit reason");
            }
        }

        deliver_pending_signal(machine, id)?;
    }
}

/// §4.E "Pause protocol": block here while a pause is in effect.
fn handle_pause(machine: &Machine, id: usize) {
    if machine.pause_requested() {
        machine.set_vcpu_state(id, VcpuState::Paused);
        machine.wait_for_resume();
    }
}

/// §4.F "Hypercall preamble" + §4.G dispatch.
///
/// §3/§9 "Restart semantics": if `KM_SIGVCPUSTOP` knocks this thread out of
/// `handle_pause` while it is still working a hypercall (state observed by a
/// peer as `HCALL_INT`), the handler is re-entered on resume with the exact
/// same `hc_no`/`args_gva` rather than re-reading them from the guest — the
/// `debug_assert!` below is the documented invariant that makes that safe:
/// the args block lives on the guest stack, which nothing here mutates
/// across the pause.
fn dispatch_hypercall(machine: &Machine, id: usize, hc_no: usize, args_gva: u64) -> Result<HcResult, KmError> {
    machine.set_vcpu_state(id, VcpuState::Hypercall);
    machine.set_last_hc_args_gva(id, Some(args_gva));
    if machine.pause_requested() {
        machine.set_vcpu_state(id, VcpuState::HcallInt);
        machine.wait_for_resume();
        debug_assert_eq!(
            machine.last_hc_args_gva(id),
            Some(args_gva),
            "hc_ret restart must replay the same HcArgs pointer across a pause"
        );
        machine.set_vcpu_state(id, VcpuState::Hypercall);
    }
    let args_gpa = machine.gva_to_gpa(args_gva);
    let mut args = machine.read_hc_args(args_gpa)?;

    if hc_no >= KM_MAX_HCALL {
        machine.post_signal_to_vcpu(
            id,
            crate::signal::SignalRecord {
                signo: libc::SIGSYS,
                code: crate::signal::SI_KERNEL,
                sender_pid: 0,
                faulting_address: 0,
                value: hc_no as u64,
            },
        )?;
        return Ok(HcResult::Continue);
    }

    let guest_interrupt = crate::hypercall::table::sentinel(crate::config::SentinelHcall::GuestInterrupt);
    let result = if hc_no == guest_interrupt {
        let frame = interrupt_frame_from_args(&args);
        let regs = machine
            .with_vcpu_regs(id, |fd| fd.get_regs())
            .expect("vcpu slot must exist")?;
        let reader = MachineGvaReader(machine);
        match translate_exception(&frame, &regs, &reader) {
            InterruptOutcome::Signal(record) => {
                machine.post_signal_to_vcpu(id, record)?;
                HcResult::Continue
            }
            InterruptOutcome::EmulateSyscall => {
                let sys = syscall_args_from_regs(&regs);
                let mut inner = HcArgs {
                    hc_ret: 0,
                    arg: [sys.a1, sys.a2, sys.a3, sys.a4, sys.a5, sys.a6],
                };
                let mut ctx = VcpuHcCtx { machine, vcpu_id: id };
                let r = machine.hypercalls().dispatch(&mut ctx, sys.no as usize, &mut inner);
                let mut new_regs = regs;
                new_regs.rax = inner.hc_ret as u64;
                machine
                    .with_vcpu_mut(id, |fd| fd.set_regs(&new_regs))
                    .expect("vcpu slot must exist")?;
                r
            }
        }
    } else {
        let mut ctx = VcpuHcCtx { machine, vcpu_id: id };
        machine.hypercalls().dispatch(&mut ctx, hc_no, &mut args)
    };

    machine.write_hc_args(args_gpa, &args)?;
    // A fork request leaves the args pointer in place: the run loop still
    // needs it post-join to patch `hc_ret` into whichever HcArgs block
    // belongs to each side of the fork (§4.J).
    if result != HcResult::DoFork {
        machine.set_last_hc_args_gva(id, None);
    }
    Ok(result)
}

/// §4.H "Dequeue": after each run-loop iteration, deliver the next signal
/// not blocked by the VCPU's current mask, if any is pending.
fn deliver_pending_signal(machine: &Machine, id: usize) -> Result<(), SignalError> {
    let Some(record) = machine.dequeue_signal(id) else {
        return Ok(());
    };
    let action = machine.signal_action(record.signo);
    if action.handler == crate::signal::SIG_IGN {
        return Ok(());
    }
    if action.handler == crate::signal::SIG_DFL {
        if crate::signal::is_default_ignore(record.signo) {
            return Ok(());
        }
        // Both remaining DFL cases terminate the payload (§4.H); only the
        // core-dump-then-abort framing differs from a plain signal exit, and
        // actually writing the core file is the core-dump writer's job
        // (out of scope, spec.md §1).
        if crate::signal::default_action_dumps_core(record.signo) {
            tracing::warn!(vcpu_id = id, signo = record.signo, "program-error signal, payload terminating");
        }
        machine.set_vcpu_state(id, VcpuState::Paused);
        machine.terminate_with_signal(record.signo);
        return Ok(());
    }

    let regs = machine
        .with_vcpu_regs(id, |fd| fd.get_regs())
        .expect("vcpu slot must exist")
        .map_err(|e| SignalError::Mem(MemError::Kvm(e)))?;
    let rflags = regs.rflags;
    let blocked = machine.blocked_mask(id);
    let altstack = machine.altstack(id);

    let (frame_out, new_mask) = machine.with_guest_mem(|mem| {
        let ctx = DeliveryContext {
            mem,
            regs,
            rflags,
            blocked,
            altstack,
        };
        crate::signal::deliver_signal(&ctx, &action, &record)
    })?;

    let mut new_regs = regs;
    new_regs.rip = frame_out.rip;
    new_regs.rsp = frame_out.rsp;
    new_regs.rdi = frame_out.rdi;
    new_regs.rsi = frame_out.rsi;
    new_regs.rdx = frame_out.rdx;
    machine
        .with_vcpu_mut(id, |fd| fd.set_regs(&new_regs))
        .expect("vcpu slot must exist")
        .map_err(|e| SignalError::Mem(MemError::Kvm(e)))?;
    machine.set_blocked_mask(id, new_mask);
    Ok(())
}

fn notify_gdb_main_thread(machine: &Machine) {
    let one: u64 = 1;
    unsafe {
        libc::write(machine.intr_fd(), &one as *const u64 as *const libc::c_void, 8);
    }
}
