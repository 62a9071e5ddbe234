//! Entry point: parse the CLI and hand off to [`kestrel::run`].

use clap::Parser;
use kestrel::cli::Args;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args = Args::parse();
    kestrel::log::init(args.verbosity());

    match kestrel::run(args) {
        Ok(status) => exit_code(status),
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

fn exit_code(status: i32) -> ExitCode {
    // `ExitCode::from` only takes a `u8`; the payload's own exit status is
    // truncated the same way a real shell would truncate it.
    ExitCode::from((status & 0xff) as u8)
}
