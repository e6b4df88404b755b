//! Descriptor introspection capability.
//!
//! Every kernel query and mutation the audit performs goes through
//! [`Introspector`]. The classification, drift comparison and repair policy
//! in [`crate::record`] and [`crate::table`] only see this trait, so they run
//! unchanged against the kernel ([`crate::ProcIntrospector`]) or against an
//! in-memory descriptor model ([`crate::MemoryIntrospector`]).

use nix::errno::Errno;
use nix::fcntl::{FdFlag, OFlag};
use std::collections::BTreeSet;
use std::fmt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

/// Kernel identity of the object behind a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub device: u64,
    pub inode: u64,
    pub kind: DescriptorKind,
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.device, self.inode)
    }
}

/// File type bits of `st_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    Regular,
    CharDevice,
    BlockDevice,
    Directory,
    Fifo,
    Socket,
    Symlink,
    /// Anonymous inodes (eventfd, epoll, ...) report no file type.
    Other,
}

impl DescriptorKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFREG => DescriptorKind::Regular,
            libc::S_IFCHR => DescriptorKind::CharDevice,
            libc::S_IFBLK => DescriptorKind::BlockDevice,
            libc::S_IFDIR => DescriptorKind::Directory,
            libc::S_IFIFO => DescriptorKind::Fifo,
            libc::S_IFSOCK => DescriptorKind::Socket,
            libc::S_IFLNK => DescriptorKind::Symlink,
            _ => DescriptorKind::Other,
        }
    }

    /// Kinds whose path can be reopened to obtain an equivalent descriptor.
    pub fn is_reopenable(self) -> bool {
        matches!(self, DescriptorKind::Regular | DescriptorKind::CharDevice)
    }
}

impl fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DescriptorKind::Regular => "file",
            DescriptorKind::CharDevice => "chr",
            DescriptorKind::BlockDevice => "blk",
            DescriptorKind::Directory => "dir",
            DescriptorKind::Fifo => "fifo",
            DescriptorKind::Socket => "sock",
            DescriptorKind::Symlink => "lnk",
            DescriptorKind::Other => "anon",
        };
        f.write_str(name)
    }
}

/// Locally-bound address of a socket descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SocketAddress {
    /// Unix-domain socket bound to a filesystem path.
    Named(PathBuf),
    /// Unix-domain socket with no address (socketpair, unbound client).
    Unnamed,
    /// Unix-domain socket in the abstract namespace.
    Abstract,
    /// Any other address family.
    Foreign(i32),
}

impl SocketAddress {
    /// The stable name of the socket, if it has one.
    pub fn name(&self) -> Option<&Path> {
        match self {
            SocketAddress::Named(path) => Some(path),
            _ => None,
        }
    }
}

/// Everything needed to install a fresh descriptor over an existing number.
#[derive(Debug, Clone, Copy)]
pub struct ReopenRequest<'a> {
    pub path: &'a Path,
    pub open_mode: OFlag,
    pub status_flags: OFlag,
    pub descriptor_flags: FdFlag,
    pub offset: Option<i64>,
}

/// How a socket was neutralized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    /// The number now refers to the inert placeholder.
    Placeholder,
    /// No placeholder was available; the number was closed.
    Closed,
}

/// Narrow view of the kernel's descriptor state for the current process.
///
/// Implementations must not retain descriptors of their own between calls:
/// anything left open would show up in the next enumeration.
pub trait Introspector {
    /// Currently open descriptor numbers, excluding any descriptor the
    /// enumeration itself used.
    fn open_descriptors(&self) -> Result<BTreeSet<RawFd>, Errno>;

    fn identity(&self, fd: RawFd) -> Result<FileIdentity, Errno>;

    /// `F_GETFD`
    fn descriptor_flags(&self, fd: RawFd) -> Result<FdFlag, Errno>;

    /// `F_GETFL`, unfiltered (access mode included).
    fn file_status(&self, fd: RawFd) -> Result<OFlag, Errno>;

    /// Current seek position, `None` for unseekable descriptors.
    fn offset(&self, fd: RawFd) -> Result<Option<i64>, Errno>;

    /// Link target of the descriptor's self-fd entry.
    fn resolve_path(&self, fd: RawFd) -> Result<PathBuf, Errno>;

    fn socket_address(&self, fd: RawFd) -> Result<SocketAddress, Errno>;

    /// Replace `fd` with a fresh open of `request.path`, in place.
    fn reopen(&self, fd: RawFd, request: &ReopenRequest<'_>) -> Result<(), Errno>;

    /// Make `fd` unusable for socket I/O while keeping the number allocated.
    fn detach(&self, fd: RawFd) -> Result<DetachOutcome, Errno>;

    fn close(&self, fd: RawFd) -> Result<(), Errno>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_mode() {
        assert_eq!(
            DescriptorKind::from_mode(libc::S_IFREG | 0o644),
            DescriptorKind::Regular
        );
        assert_eq!(
            DescriptorKind::from_mode(libc::S_IFSOCK | 0o777),
            DescriptorKind::Socket
        );
        assert_eq!(DescriptorKind::from_mode(0o600), DescriptorKind::Other);
    }

    #[test]
    fn test_only_files_and_char_devices_reopen() {
        assert!(DescriptorKind::Regular.is_reopenable());
        assert!(DescriptorKind::CharDevice.is_reopenable());
        assert!(!DescriptorKind::Directory.is_reopenable());
        assert!(!DescriptorKind::Fifo.is_reopenable());
        assert!(!DescriptorKind::Socket.is_reopenable());
        assert!(!DescriptorKind::Other.is_reopenable());
    }

    #[test]
    fn test_socket_name_only_for_named() {
        let named = SocketAddress::Named(PathBuf::from("/dev/socket/zygote"));
        assert_eq!(named.name(), Some(Path::new("/dev/socket/zygote")));
        assert_eq!(SocketAddress::Abstract.name(), None);
        assert_eq!(SocketAddress::Unnamed.name(), None);
        assert_eq!(SocketAddress::Foreign(libc::AF_INET).name(), None);
    }
}
