//! `vFile` host-filesystem passthrough for GDB (§4.K "vFile").
//!
//! GDB's `vFile:open`/`pread`/`pwrite`/`close`/`fstat` let the client read
//! files the payload can see (symbols, source) without a stub on the guest
//! side. Scope is deliberately narrow: read-only, no guest-directed opens
//! of devices or directories a debugger has no business touching.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const VFILE_MAX_OPEN: usize = 32;

#[derive(Error, Debug)]
pub enum VfileError {
    #[error("vFile descriptor table is full ({VFILE_MAX_OPEN} entries)")]
    TableFull,
    #[error("no vFile descriptor {0}")]
    BadFd(i32),
    #[error("path escapes the payload root: {0}")]
    PathEscape(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Host-side open flags `vFile:open` understands. The protocol's flag
/// encoding mirrors POSIX `open(2)`, but only the read-only path is
/// supported — writes from a debugger into the payload's files are refused.
pub fn translate_open_flags(proto_flags: u32) -> Result<i32, VfileError> {
    const O_ACCMODE: u32 = 0x3;
    if proto_flags & O_ACCMODE != 0 {
        return Err(VfileError::PathEscape("write access requested".into()));
    }
    Ok(libc::O_RDONLY)
}

/// Resolve a client-supplied path against the payload's apparent root,
/// rejecting any attempt to climb above it via `..` components.
pub fn resolve_under_root(root: &Path, requested: &str) -> Result<PathBuf, VfileError> {
    let requested = Path::new(requested);
    if requested
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(VfileError::PathEscape(requested.display().to_string()));
    }
    let joined = if requested.is_absolute() {
        root.join(requested.strip_prefix("/").unwrap_or(requested))
    } else {
        root.join(requested)
    };
    Ok(joined)
}

/// Big-endian `struct stat` fields the protocol wants, in wire order.
#[derive(Debug, Default, Clone, Copy)]
pub struct VfileStat {
    pub dev: u32,
    pub ino: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
}

impl VfileStat {
    pub fn to_be_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.dev.to_be_bytes());
        out.extend_from_slice(&self.ino.to_be_bytes());
        out.extend_from_slice(&self.mode.to_be_bytes());
        out.extend_from_slice(&self.nlink.to_be_bytes());
        out.extend_from_slice(&self.uid.to_be_bytes());
        out.extend_from_slice(&self.gid.to_be_bytes());
        out.extend_from_slice(&self.rdev.to_be_bytes());
        out.extend_from_slice(&self.size.to_be_bytes());
        out.extend_from_slice(&self.blksize.to_be_bytes());
        out.extend_from_slice(&self.blocks.to_be_bytes());
        out.extend_from_slice(&self.atime.to_be_bytes());
        out.extend_from_slice(&self.mtime.to_be_bytes());
        out.extend_from_slice(&self.ctime.to_be_bytes());
        out
    }
}

fn stat_of(file: &File) -> Result<VfileStat, VfileError> {
    let m = file.metadata()?;
    Ok(VfileStat {
        dev: m.dev() as u32,
        ino: m.ino() as u32,
        mode: m.mode(),
        nlink: m.nlink() as u32,
        uid: m.uid(),
        gid: m.gid(),
        rdev: m.rdev() as u32,
        size: m.size(),
        blksize: m.blksize(),
        blocks: m.blocks(),
        atime: m.atime() as u32,
        mtime: m.mtime() as u32,
        ctime: m.ctime() as u32,
    })
}

#[derive(Debug, Default)]
pub struct VfileTable {
    slots: Vec<Option<File>>,
}

impl VfileTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
        }
    }

    pub fn open(&mut self, root: &Path, path: &str, proto_flags: u32) -> Result<i32, VfileError> {
        translate_open_flags(proto_flags)?;
        let resolved = resolve_under_root(root, path)?;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOFOLLOW)
            .open(resolved)?;
        if let Some(idx) = self.slots.iter().position(Option::is_none) {
            self.slots[idx] = Some(file);
            return Ok(idx as i32);
        }
        if self.slots.len() >= VFILE_MAX_OPEN {
            return Err(VfileError::TableFull);
        }
        self.slots.push(Some(file));
        Ok((self.slots.len() - 1) as i32)
    }

    pub fn close(&mut self, fd: i32) -> Result<(), VfileError> {
        let slot = self
            .slots
            .get_mut(fd as usize)
            .ok_or(VfileError::BadFd(fd))?;
        slot.take().ok_or(VfileError::BadFd(fd))?;
        Ok(())
    }

    pub fn pread(&mut self, fd: i32, count: usize, offset: u64) -> Result<Vec<u8>, VfileError> {
        let file = self
            .slots
            .get_mut(fd as usize)
            .and_then(Option::as_mut)
            .ok_or(VfileError::BadFd(fd))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; count];
        let n = file.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn pwrite(&mut self, fd: i32, data: &[u8], offset: u64) -> Result<usize, VfileError> {
        let file = self
            .slots
            .get_mut(fd as usize)
            .and_then(Option::as_mut)
            .ok_or(VfileError::BadFd(fd))?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(file.write(data)?)
    }

    pub fn fstat(&mut self, fd: i32) -> Result<VfileStat, VfileError> {
        let file = self
            .slots
            .get(fd as usize)
            .and_then(Option::as_ref)
            .ok_or(VfileError::BadFd(fd))?;
        stat_of(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_dir_escape() {
        let root = Path::new("/tmp/payload-root");
        assert!(matches!(
            resolve_under_root(root, "../../etc/passwd"),
            Err(VfileError::PathEscape(_))
        ));
    }

    #[test]
    fn resolves_absolute_paths_under_root() {
        let root = Path::new("/tmp/payload-root");
        let resolved = resolve_under_root(root, "/etc/hosts").unwrap();
        assert_eq!(resolved, Path::new("/tmp/payload-root/etc/hosts"));
    }

    #[test]
    fn translate_open_flags_rejects_write_access() {
        assert!(translate_open_flags(0).is_ok());
        assert!(matches!(
            translate_open_flags(libc::O_WRONLY as u32),
            Err(VfileError::PathEscape(_))
        ));
    }

    #[test]
    fn closing_an_unopened_fd_errors() {
        let mut t = VfileTable::new();
        assert!(matches!(t.close(0), Err(VfileError::BadFd(0))));
    }
}
