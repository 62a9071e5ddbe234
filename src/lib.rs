//! Library surface for `kestrel`: `src/main.rs` is a thin binary wrapper
//! around [`run`] so that `tests/` can exercise individual subsystems
//! (memory geometry, signal framing, the GDB stub, the pause protocol)
//! without going through the CLI.

pub mod bringup;
pub mod cli;
pub mod config;
pub mod decode;
pub mod elf;
pub mod error;
pub mod fdmap;
pub mod fork;
pub mod gdb;
pub mod hypercall;
pub mod intr;
pub mod kvm;
pub mod log;
pub mod machine;
pub mod mem;
pub mod procstack;
pub mod runloop;
pub mod signal;

use cli::Args;
use error::KmError;
use gdb::GdbStub;
use machine::{ElfLoadTarget, Machine};
use runloop::RunOutcome;
use std::sync::{Arc, Mutex};

/// Stand up the VM, load the payload, and drive its vCPU to completion,
/// returning the payload's exit status (§4.E "Creation", §4.F).
pub fn run(args: Args) -> Result<i32, KmError> {
    let driver = kvm::open(None)?;
    let machine = Machine::new(driver.vm, driver.cpu_caps);
    machine.map_reserved_region()?;
    machine.init_page_tables()?;

    let payload_bytes = std::fs::read(&args.payload)?;
    let load_bias = config::GUEST_MEM_START_VA;
    let elf_image = {
        let mut target = ElfLoadTarget { machine: &machine };
        elf::load(&payload_bytes, load_bias, &mut target)?
    };

    let mut argv = Vec::with_capacity(1 + args.payload_args.len());
    argv.push(args.payload.clone());
    argv.extend(args.payload_args.iter().cloned());
    let envp: Vec<String> = std::env::vars().map(|(k, v)| format!("{k}={v}")).collect();
    let rsp = procstack::build(&machine, &elf_image, load_bias, &args.payload, &argv, &envp)?;

    // Nothing is mapped behind this GVA; see `kvm::vm::VmFd::create_vcpu`.
    let lstar_placeholder = load_bias;
    let vcpu_id = machine.get(lstar_placeholder)?;
    machine
        .with_vcpu_regs(vcpu_id, |fd| bringup::setup_cpu_regs(fd, &machine, elf_image.entry, rsp))
        .expect("vcpu slot must exist right after get()")?;

    let gdb = match args.gdb {
        Some(port) => Some(Arc::new(Mutex::new(GdbStub::bind(port)?))),
        None => None,
    };
    if let (Some(gdb), true) = (&gdb, args.gdb_wait) {
        // §4.K "AT_START": block here until a debugger attaches before the
        // payload's first instruction runs.
        gdb.lock().unwrap().accept()?;
    }

    let mut machine = Arc::new(machine);
    let mut vcpu_id = vcpu_id;

    if let Some(gdb) = gdb.clone() {
        let m = machine.clone();
        std::thread::spawn(move || gdb_thread_loop(&m, &gdb));
    }

    let mut gdb = gdb;

    loop {
        let vcpu_thread = {
            let m = machine.clone();
            let gdb = gdb.clone();
            std::thread::spawn(move || runloop::run_vcpu(&m, vcpu_id, gdb.as_deref()))
        };
        let outcome = vcpu_thread.join().expect("vcpu thread panicked")?;

        match outcome {
            RunOutcome::Exited(code) => {
                machine.put(vcpu_id);
                return Ok(code);
            }
            RunOutcome::Stopped => {
                let status = machine.exit_status().unwrap_or(0);
                machine.put(vcpu_id);
                return Ok(status);
            }
            RunOutcome::ForkRequested => {
                // The vcpu thread is joined, so it's safe to call the real
                // `fork(2)` from here (§4.J "Pre-fork").
                let args_gva = machine.last_hc_args_gva(vcpu_id);
                match machine.fork_child(vcpu_id)? {
                    fork::ForkOutcome::Parent { child_monitor_pid } => {
                        if let Some(gva) = args_gva {
                            let gpa = machine.gva_to_gpa(gva);
                            let mut hc_args = machine.read_hc_args(gpa)?;
                            hc_args.hc_ret = child_monitor_pid as i64;
                            machine.write_hc_args(gpa, &hc_args)?;
                        }
                    }
                    fork::ForkOutcome::Child(child) => {
                        if let Some(gva) = args_gva {
                            let gpa = child.gva_to_gpa(gva);
                            let mut hc_args = child.read_hc_args(gpa)?;
                            hc_args.hc_ret = 0;
                            child.write_hc_args(gpa, &hc_args)?;
                        }
                        machine = Arc::new(*child);
                        vcpu_id = 0;

                        if let Some(g) = &gdb {
                            g.lock().unwrap().fork_reset();
                            let should_wait =
                                config::env::wait_for_gdb_attach() || config::env::gdb_child_fork_wait();
                            if should_wait {
                                g.lock().unwrap().accept()?;
                            }
                            let m = machine.clone();
                            let g = g.clone();
                            std::thread::spawn(move || gdb_thread_loop(&m, &g));
                        }
                    }
                }
            }
        }
    }
}

/// Runs on its own thread for the lifetime of the process whenever `--gdb`
/// is passed: accepts a client, then alternates draining queued stop events
/// with blocking packet reads. `GdbStub::pump` has no poll/select
/// integration of its own, so a stop event posted while this thread is
/// blocked in a read is only sent once the client's next packet arrives —
/// acceptable for this core's scope (see DESIGN.md), unlike the full
/// `km_gdb.c` event loop this is grounded on.
fn gdb_thread_loop(machine: &Machine, gdb: &Mutex<GdbStub>) {
    loop {
        if machine.exit_status().is_some() {
            return;
        }
        if !gdb.lock().unwrap().is_attached() {
            if gdb.lock().unwrap().accept().is_err() {
                return;
            }
            continue;
        }
        if gdb.lock().unwrap().drain_one_event(machine).is_err() {
            return;
        }
        if gdb.lock().unwrap().pump(machine).is_err() {
            return;
        }
    }
}
