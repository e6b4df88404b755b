//! Kernel-backed introspection via `/proc/self/fd` and descriptor syscalls.
//!
//! # Implementation
//!
//! - **Enumeration**: `opendir(/proc/self/fd)`, skipping the directory's own fd
//! - **Identity**: `fstat(2)`
//! - **Flags**: `fcntl(2)` with `F_GETFD` / `F_GETFL`
//! - **Path**: `readlink(2)` on `/proc/self/fd/<n>`
//! - **Socket name**: `getsockname(2)` into a `sockaddr_storage`
//! - **Replacement**: `dup3(2)`, which swaps the target number atomically

use nix::dir::Dir;
use nix::errno::Errno;
use nix::fcntl::{fcntl, open, readlink, FcntlArg, FdFlag, OFlag};
use nix::sys::stat::{fstat, Mode};
use nix::unistd::{close, dup3, lseek, Whence};
use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use forkguard_config::AuditConfig;

use crate::introspect::{
    DescriptorKind, DetachOutcome, FileIdentity, Introspector, ReopenRequest, SocketAddress,
};

/// Introspector for the calling process.
///
/// Holds no descriptors between calls.
#[derive(Debug, Clone)]
pub struct ProcIntrospector {
    fd_dir: PathBuf,
    placeholder: PathBuf,
}

impl Default for ProcIntrospector {
    fn default() -> Self {
        Self::from_config(&AuditConfig::default())
    }
}

impl ProcIntrospector {
    pub fn new(fd_dir: impl Into<PathBuf>, placeholder: impl Into<PathBuf>) -> Self {
        Self {
            fd_dir: fd_dir.into(),
            placeholder: placeholder.into(),
        }
    }

    pub fn from_config(config: &AuditConfig) -> Self {
        Self::new(&config.proc_fd_dir, &config.placeholder)
    }

    pub fn fd_dir(&self) -> &Path {
        &self.fd_dir
    }

    /// Open `path` and take ownership of the descriptor.
    fn open_owned(path: &Path, flags: OFlag) -> Result<OwnedFd, Errno> {
        let raw = open(path, flags | OFlag::O_CLOEXEC, Mode::empty())?;
        // SAFETY: `open` just returned this descriptor and nothing else owns it.
        Ok(unsafe { OwnedFd::from_raw_fd(raw) })
    }

    /// Install `source` over `target`, carrying the close-on-exec bit.
    fn replace(source: &OwnedFd, target: RawFd, descriptor_flags: FdFlag) -> Result<(), Errno> {
        let flags = if descriptor_flags.contains(FdFlag::FD_CLOEXEC) {
            OFlag::O_CLOEXEC
        } else {
            OFlag::empty()
        };
        dup3(source.as_raw_fd(), target, flags)?;
        Ok(())
    }
}

/// Parse a `/proc/self/fd` entry name into a descriptor number.
pub fn parse_fd(name: &OsStr) -> Option<RawFd> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || !bytes.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Decode the address `getsockname` wrote into `storage`.
///
/// Only a non-empty, non-abstract `AF_UNIX` path is a stable name. A trailing
/// NUL counted in `len` is dropped.
fn decode_socket_address(
    storage: &libc::sockaddr_storage,
    len: libc::socklen_t,
) -> SocketAddress {
    let family = i32::from(storage.ss_family);
    if family != libc::AF_UNIX {
        return SocketAddress::Foreign(family);
    }

    // SAFETY: ss_family is AF_UNIX, so the storage holds a sockaddr_un, and
    // sockaddr_storage is large and aligned enough for any address type.
    let unix =
        unsafe { &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_un) };
    let header = std::mem::size_of::<libc::sa_family_t>();
    let path_len = (len as usize).saturating_sub(header).min(unix.sun_path.len());
    if path_len == 0 {
        return SocketAddress::Unnamed;
    }

    let raw: Vec<u8> = unix.sun_path[..path_len].iter().map(|&c| c as u8).collect();
    if raw[0] == 0 {
        return SocketAddress::Abstract;
    }
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    SocketAddress::Named(PathBuf::from(OsStr::from_bytes(&raw[..end])))
}

impl Introspector for ProcIntrospector {
    fn open_descriptors(&self) -> Result<BTreeSet<RawFd>, Errno> {
        let mut dir = Dir::open(
            self.fd_dir.as_path(),
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        let dir_fd = dir.as_raw_fd();

        let mut fds = BTreeSet::new();
        for entry in dir.iter() {
            let entry = entry?;
            let name = OsStr::from_bytes(entry.file_name().to_bytes());
            match parse_fd(name) {
                Some(fd) if fd != dir_fd => {
                    fds.insert(fd);
                }
                _ => {}
            }
        }
        Ok(fds)
    }

    fn identity(&self, fd: RawFd) -> Result<FileIdentity, Errno> {
        let stat = fstat(fd)?;
        Ok(FileIdentity {
            device: stat.st_dev as u64,
            inode: stat.st_ino as u64,
            kind: DescriptorKind::from_mode(stat.st_mode as u32),
        })
    }

    fn descriptor_flags(&self, fd: RawFd) -> Result<FdFlag, Errno> {
        let bits = fcntl(fd, FcntlArg::F_GETFD)?;
        Ok(FdFlag::from_bits_truncate(bits))
    }

    fn file_status(&self, fd: RawFd) -> Result<OFlag, Errno> {
        let bits = fcntl(fd, FcntlArg::F_GETFL)?;
        Ok(OFlag::from_bits_truncate(bits))
    }

    fn offset(&self, fd: RawFd) -> Result<Option<i64>, Errno> {
        match lseek(fd, 0, Whence::SeekCur) {
            Ok(offset) => Ok(Some(offset)),
            Err(Errno::ESPIPE) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn resolve_path(&self, fd: RawFd) -> Result<PathBuf, Errno> {
        let link = self.fd_dir.join(fd.to_string());
        Ok(PathBuf::from(readlink(link.as_path())?))
    }

    fn socket_address(&self, fd: RawFd) -> Result<SocketAddress, Errno> {
        // SAFETY: all-zero is a valid sockaddr_storage.
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        // SAFETY: storage and len describe a writable buffer of `len` bytes.
        let ret = unsafe {
            libc::getsockname(
                fd,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        };
        Errno::result(ret)?;
        Ok(decode_socket_address(&storage, len))
    }

    fn reopen(&self, fd: RawFd, request: &ReopenRequest<'_>) -> Result<(), Errno> {
        let fresh = Self::open_owned(request.path, request.open_mode)?;
        fcntl(fresh.as_raw_fd(), FcntlArg::F_SETFL(request.status_flags))?;
        if let Some(offset) = request.offset {
            lseek(fresh.as_raw_fd(), offset, Whence::SeekSet)?;
        }
        Self::replace(&fresh, fd, request.descriptor_flags)
    }

    fn detach(&self, fd: RawFd) -> Result<DetachOutcome, Errno> {
        let descriptor_flags = self.descriptor_flags(fd)?;
        let placeholder = match Self::open_owned(&self.placeholder, OFlag::O_RDWR) {
            Ok(placeholder) => placeholder,
            Err(Errno::ENOENT) | Err(Errno::EACCES) | Err(Errno::ENXIO) => {
                close(fd)?;
                return Ok(DetachOutcome::Closed);
            }
            Err(e) => return Err(e),
        };
        Self::replace(&placeholder, fd, descriptor_flags)?;
        Ok(DetachOutcome::Placeholder)
    }

    fn close(&self, fd: RawFd) -> Result<(), Errno> {
        close(fd)
    }
}
