//! Command-line interface.
//!
//! Follows `carbon::Args`: a `clap`-derived struct parsed once in `main`.
//! Everything after the payload path is the payload's own argv, the way
//! `km`'s CLI hands the remainder of the command line straight to the guest.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "kestrel")]
#[command(about = "Run a single unmodified Linux binary inside a KVM-backed monitor")]
pub struct Args {
    /// Path to the ELF payload to run.
    pub payload: String,

    /// Arguments passed through to the payload (argv[1..]).
    pub payload_args: Vec<String>,

    /// Guest memory size in MiB.
    #[arg(short, long, default_value = "256")]
    pub memory: u64,

    /// Start the GDB remote-serial-protocol stub, optionally on a specific port.
    #[arg(long, value_name = "PORT", num_args = 0..=1, default_missing_value = "2159")]
    pub gdb: Option<u16>,

    /// Block at startup until a GDB client attaches (AT_START mode, §4.K).
    #[arg(long, requires = "gdb")]
    pub gdb_wait: bool,

    /// Increase logging verbosity (repeatable).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Decrease logging verbosity.
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

impl Args {
    pub fn verbosity(&self) -> i8 {
        if self.quiet {
            -1
        } else {
            self.verbose as i8
        }
    }
}
