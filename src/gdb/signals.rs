//! Linux ↔ GDB signal-number translation (§4.K "Signal number translation").

/// musl-internal realtime signals the translation table special-cases so
/// round-trips through a GDB session are preserved.
pub mod musl_internal {
    pub const SIGTIMER: i32 = 32;
    pub const SIGCANCEL: i32 = 33;
    pub const SIGSYNCCALL: i32 = 34;
}

const GDB_SIGNAL_REALTIME_33: i32 = 49;
const GDB_SIGNAL_REALTIME_34: i32 = 50;
const GDB_SIGNAL_CANCEL: i32 = 64;

/// Translate a Linux signal number to its GDB wire-protocol equivalent.
pub fn linux_to_gdb(signo: i32) -> i32 {
    use musl_internal::*;
    match signo {
        SIGTIMER => GDB_SIGNAL_REALTIME_34,
        SIGCANCEL => GDB_SIGNAL_CANCEL,
        SIGSYNCCALL => GDB_SIGNAL_REALTIME_33,
        libc::SIGHUP => 1,
        libc::SIGINT => 2,
        libc::SIGQUIT => 3,
        libc::SIGILL => 4,
        libc::SIGTRAP => 5,
        libc::SIGABRT => 6,
        libc::SIGBUS => 10,
        libc::SIGFPE => 8,
        libc::SIGKILL => 9,
        libc::SIGUSR1 => 30,
        libc::SIGSEGV => 11,
        libc::SIGUSR2 => 31,
        libc::SIGPIPE => 13,
        libc::SIGALRM => 14,
        libc::SIGTERM => 15,
        libc::SIGCHLD => 20,
        libc::SIGCONT => 19,
        libc::SIGSTOP => 17,
        libc::SIGTSTP => 18,
        libc::SIGTTIN => 21,
        libc::SIGTTOU => 22,
        libc::SIGURG => 16,
        libc::SIGXCPU => 24,
        libc::SIGXFSZ => 25,
        libc::SIGVTALRM => 26,
        libc::SIGPROF => 27,
        libc::SIGWINCH => 23,
        libc::SIGSYS => 12,
        _ => 0, // GDB_SIGNAL_0: unknown/none
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_sigusr1_to_30() {
        assert_eq!(linux_to_gdb(libc::SIGUSR1), 30);
    }

    #[test]
    fn maps_sigsegv_to_11() {
        assert_eq!(linux_to_gdb(libc::SIGSEGV), 11);
    }

    #[test]
    fn maps_musl_internal_realtime_signals() {
        assert_eq!(linux_to_gdb(musl_internal::SIGTIMER), GDB_SIGNAL_REALTIME_34);
        assert_eq!(linux_to_gdb(musl_internal::SIGCANCEL), GDB_SIGNAL_CANCEL);
        assert_eq!(linux_to_gdb(musl_internal::SIGSYNCCALL), GDB_SIGNAL_REALTIME_33);
    }
}
