//! Guest-fd ↔ host-fd translation (§1 "out of scope, treated as an external
//! collaborator... only the contract is specified"; §6).
//!
//! The full name-virtualization layer (path rewriting, `/proc/<fs>/root`
//! resolution for `vFile:setfs`, etc.) lives outside the core this crate
//! implements. What the core needs is a narrow, synchronous map from the
//! small integer a payload's `read`/`write`/`close` hypercalls pass to a
//! real host `RawFd` — including the three descriptors every payload
//! inherits at start (stdin/stdout/stderr, 1:1 with the host's).

use std::collections::HashMap;
use std::os::fd::RawFd;

/// Guest-visible file descriptor.
pub type GuestFd = i32;

#[derive(Debug, Default)]
pub struct FdMap {
    table: HashMap<GuestFd, RawFd>,
    next_guest_fd: GuestFd,
}

impl FdMap {
    /// A fresh map pre-populated with the inherited stdio descriptors.
    pub fn with_stdio() -> Self {
        let mut map = FdMap {
            table: HashMap::new(),
            next_guest_fd: 3,
        };
        map.table.insert(0, 0);
        map.table.insert(1, 1);
        map.table.insert(2, 2);
        map
    }

    pub fn host_fd(&self, guest_fd: GuestFd) -> Option<RawFd> {
        self.table.get(&guest_fd).copied()
    }

    /// Register a newly opened host fd, returning the guest-visible handle
    /// assigned to it.
    pub fn insert(&mut self, host_fd: RawFd) -> GuestFd {
        let guest_fd = self.next_guest_fd;
        self.next_guest_fd += 1;
        self.table.insert(guest_fd, host_fd);
        guest_fd
    }

    /// Drop the mapping for `guest_fd`, returning the host fd the caller is
    /// now responsible for closing.
    pub fn remove(&mut self, guest_fd: GuestFd) -> Option<RawFd> {
        self.table.remove(&guest_fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_is_mapped_1_to_1() {
        let map = FdMap::with_stdio();
        assert_eq!(map.host_fd(0), Some(0));
        assert_eq!(map.host_fd(1), Some(1));
        assert_eq!(map.host_fd(2), Some(2));
    }

    #[test]
    fn inserted_fds_get_increasing_guest_handles() {
        let mut map = FdMap::with_stdio();
        let a = map.insert(10);
        let b = map.insert(11);
        assert!(b > a);
        assert_eq!(map.host_fd(a), Some(10));
        map.remove(a);
        assert_eq!(map.host_fd(a), None);
    }
}
