//! Tracing setup for the monitor.
//!
//! Replaces the teacher's `eprintln!("[VMM] ...")`/`[KVM]`/`[Boot]` prefixes
//! with structured `tracing` spans and fields, filtered through `RUST_LOG`
//! (defaulting to `info`). `-v`/`-q` on the CLI nudge the default filter.

use tracing_subscriber::EnvFilter;

pub fn init(verbosity: i8) {
    let default_level = match verbosity {
        i8::MIN..=-1 => "warn",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();
}
