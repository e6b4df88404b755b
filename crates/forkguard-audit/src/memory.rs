//! In-memory descriptor model.
//!
//! `MemoryIntrospector` simulates a process descriptor table: files with
//! stable inodes, open file descriptions with their own offsets and flags,
//! sockets, pipes and a placeholder device. Failures can be injected per
//! descriptor and per operation.
//!
//! Single-threaded by construction (`RefCell`), like the audit itself.

use nix::errno::Errno;
use nix::fcntl::{FdFlag, OFlag};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use forkguard_config::path::DELETED_MARKER;

use crate::introspect::{
    DescriptorKind, DetachOutcome, FileIdentity, Introspector, ReopenRequest, SocketAddress,
};

const MEMORY_DEVICE: u64 = 0xfd00;
const PLACEHOLDER_PATH: &str = "/dev/null";

/// Introspector operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Stat,
    DescriptorFlags,
    StatusFlags,
    Offset,
    Path,
    SocketName,
    Reopen,
    Detach,
    Close,
}

/// State of one simulated descriptor.
#[derive(Debug, Clone)]
pub struct MemoryDescriptor {
    pub identity: FileIdentity,
    pub path: PathBuf,
    pub socket: Option<SocketAddress>,
    /// Raw `F_GETFL` value, access mode included
    pub status: OFlag,
    pub descriptor_flags: FdFlag,
    pub offset: Option<i64>,
    /// Open file description this descriptor refers to
    pub description: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    descriptors: BTreeMap<RawFd, MemoryDescriptor>,
    files: HashMap<PathBuf, FileIdentity>,
    unlinked: BTreeSet<u64>,
    failures: HashMap<(RawFd, Operation), Errno>,
    enumeration_failure: Option<Errno>,
    placeholder: Option<FileIdentity>,
    next_inode: u64,
    next_description: u64,
}

impl MemoryState {
    fn fail_point(&self, fd: RawFd, op: Operation) -> Result<(), Errno> {
        match self.failures.get(&(fd, op)) {
            Some(errno) => Err(*errno),
            None => Ok(()),
        }
    }

    fn get(&self, fd: RawFd, op: Operation) -> Result<&MemoryDescriptor, Errno> {
        self.fail_point(fd, op)?;
        self.descriptors.get(&fd).ok_or(Errno::EBADF)
    }

    fn file(&mut self, path: &Path, kind: DescriptorKind) -> FileIdentity {
        if let Some(identity) = self.files.get(path) {
            return *identity;
        }
        self.next_inode += 1;
        let identity = FileIdentity {
            device: MEMORY_DEVICE,
            inode: self.next_inode,
            kind,
        };
        self.files.insert(path.to_path_buf(), identity);
        identity
    }

    fn description(&mut self) -> u64 {
        self.next_description += 1;
        self.next_description
    }
}

/// Simulated descriptor table implementing [`Introspector`].
#[derive(Debug)]
pub struct MemoryIntrospector {
    state: RefCell<MemoryState>,
}

impl Default for MemoryIntrospector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIntrospector {
    /// Empty table with a `/dev/null` placeholder device available.
    pub fn new() -> Self {
        let mut state = MemoryState::default();
        let placeholder = state.file(Path::new(PLACEHOLDER_PATH), DescriptorKind::CharDevice);
        state.placeholder = Some(placeholder);
        Self {
            state: RefCell::new(state),
        }
    }

    /// Empty table where the placeholder cannot be opened.
    pub fn without_placeholder() -> Self {
        Self {
            state: RefCell::new(MemoryState::default()),
        }
    }

    fn install(&self, fd: RawFd, descriptor: MemoryDescriptor) {
        self.state.borrow_mut().descriptors.insert(fd, descriptor);
    }

    /// Open `path` as a regular file at `fd`, replacing whatever was there.
    pub fn open_file(&self, fd: RawFd, path: impl AsRef<Path>, flags: OFlag) -> Result<(), Errno> {
        let path = path.as_ref();
        let mut state = self.state.borrow_mut();
        let identity = state.file(path, DescriptorKind::Regular);
        if state.unlinked.contains(&identity.inode) {
            return Err(Errno::ENOENT);
        }
        let description = state.description();
        state.descriptors.insert(
            fd,
            MemoryDescriptor {
                identity,
                path: path.to_path_buf(),
                socket: None,
                status: flags.difference(OFlag::O_CLOEXEC),
                descriptor_flags: if flags.contains(OFlag::O_CLOEXEC) {
                    FdFlag::FD_CLOEXEC
                } else {
                    FdFlag::empty()
                },
                offset: Some(0),
                description,
            },
        );
        Ok(())
    }

    pub fn open_directory(&self, fd: RawFd, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let (identity, description) = {
            let mut state = self.state.borrow_mut();
            (
                state.file(path, DescriptorKind::Directory),
                state.description(),
            )
        };
        self.install(
            fd,
            MemoryDescriptor {
                identity,
                path: path.to_path_buf(),
                socket: None,
                status: OFlag::O_RDONLY | OFlag::O_DIRECTORY,
                descriptor_flags: FdFlag::empty(),
                offset: Some(0),
                description,
            },
        );
    }

    pub fn open_socket(&self, fd: RawFd, address: SocketAddress) {
        let (identity, description) = {
            let mut state = self.state.borrow_mut();
            state.next_inode += 1;
            let identity = FileIdentity {
                device: 0,
                inode: state.next_inode,
                kind: DescriptorKind::Socket,
            };
            (identity, state.description())
        };
        self.install(
            fd,
            MemoryDescriptor {
                identity,
                path: PathBuf::from(format!("socket:[{}]", identity.inode)),
                socket: Some(address),
                status: OFlag::O_RDWR,
                descriptor_flags: FdFlag::empty(),
                offset: None,
                description,
            },
        );
    }

    pub fn open_pipe(&self, fd: RawFd) {
        let (identity, description) = {
            let mut state = self.state.borrow_mut();
            state.next_inode += 1;
            let identity = FileIdentity {
                device: 0,
                inode: state.next_inode,
                kind: DescriptorKind::Fifo,
            };
            (identity, state.description())
        };
        self.install(
            fd,
            MemoryDescriptor {
                identity,
                path: PathBuf::from(format!("pipe:[{}]", identity.inode)),
                socket: None,
                status: OFlag::O_RDONLY,
                descriptor_flags: FdFlag::empty(),
                offset: None,
                description,
            },
        );
    }

    /// Duplicate `fd` onto `new_fd`, sharing the open file description.
    pub fn dup(&self, fd: RawFd, new_fd: RawFd) -> Result<(), Errno> {
        let mut state = self.state.borrow_mut();
        let mut copy = state.descriptors.get(&fd).cloned().ok_or(Errno::EBADF)?;
        copy.descriptor_flags = FdFlag::empty();
        state.descriptors.insert(new_fd, copy);
        Ok(())
    }

    /// Move the offset of the open file description behind `fd`.
    /// Every descriptor sharing the description observes the new offset.
    pub fn seek(&self, fd: RawFd, offset: i64) -> Result<(), Errno> {
        let mut state = self.state.borrow_mut();
        let description = state.descriptors.get(&fd).ok_or(Errno::EBADF)?.description;
        let mut seekable = false;
        for d in state.descriptors.values_mut() {
            if d.description == description && d.offset.is_some() {
                d.offset = Some(offset);
                seekable = true;
            }
        }
        if seekable {
            Ok(())
        } else {
            Err(Errno::ESPIPE)
        }
    }

    pub fn set_descriptor_flags(&self, fd: RawFd, flags: FdFlag) -> Result<(), Errno> {
        let mut state = self.state.borrow_mut();
        let d = state.descriptors.get_mut(&fd).ok_or(Errno::EBADF)?;
        d.descriptor_flags = flags;
        Ok(())
    }

    /// Replace the non-access-mode status flags, like `F_SETFL`.
    pub fn set_status_flags(&self, fd: RawFd, flags: OFlag) -> Result<(), Errno> {
        let mut state = self.state.borrow_mut();
        let d = state.descriptors.get_mut(&fd).ok_or(Errno::EBADF)?;
        let access = d.status & OFlag::O_ACCMODE;
        d.status = access | flags.difference(OFlag::O_ACCMODE);
        Ok(())
    }

    /// Close `fd` behind the audit's back.
    pub fn close_external(&self, fd: RawFd) {
        self.state.borrow_mut().descriptors.remove(&fd);
    }

    /// Remove `path` from the namespace. Open descriptors keep the inode.
    pub fn unlink(&self, path: impl AsRef<Path>) {
        let mut state = self.state.borrow_mut();
        if let Some(identity) = state.files.get(path.as_ref()).copied() {
            state.unlinked.insert(identity.inode);
        }
    }

    /// Make `op` on `fd` fail with `errno` until cleared.
    pub fn fail(&self, fd: RawFd, op: Operation, errno: Errno) {
        self.state.borrow_mut().failures.insert((fd, op), errno);
    }

    pub fn clear_failures(&self) {
        self.state.borrow_mut().failures.clear();
    }

    pub fn fail_enumeration(&self, errno: Errno) {
        self.state.borrow_mut().enumeration_failure = Some(errno);
    }

    pub fn is_open(&self, fd: RawFd) -> bool {
        self.state.borrow().descriptors.contains_key(&fd)
    }

    /// Open file description behind `fd`.
    pub fn description(&self, fd: RawFd) -> Option<u64> {
        self.state.borrow().descriptors.get(&fd).map(|d| d.description)
    }

    pub fn descriptor(&self, fd: RawFd) -> Option<MemoryDescriptor> {
        self.state.borrow().descriptors.get(&fd).cloned()
    }
}

impl Introspector for MemoryIntrospector {
    fn open_descriptors(&self) -> Result<BTreeSet<RawFd>, Errno> {
        let state = self.state.borrow();
        if let Some(errno) = state.enumeration_failure {
            return Err(errno);
        }
        Ok(state.descriptors.keys().copied().collect())
    }

    fn identity(&self, fd: RawFd) -> Result<FileIdentity, Errno> {
        Ok(self.state.borrow().get(fd, Operation::Stat)?.identity)
    }

    fn descriptor_flags(&self, fd: RawFd) -> Result<FdFlag, Errno> {
        Ok(self
            .state
            .borrow()
            .get(fd, Operation::DescriptorFlags)?
            .descriptor_flags)
    }

    fn file_status(&self, fd: RawFd) -> Result<OFlag, Errno> {
        Ok(self.state.borrow().get(fd, Operation::StatusFlags)?.status)
    }

    fn offset(&self, fd: RawFd) -> Result<Option<i64>, Errno> {
        Ok(self.state.borrow().get(fd, Operation::Offset)?.offset)
    }

    fn resolve_path(&self, fd: RawFd) -> Result<PathBuf, Errno> {
        let state = self.state.borrow();
        let d = state.get(fd, Operation::Path)?;
        if state.unlinked.contains(&d.identity.inode) {
            let mut marked = d.path.clone().into_os_string();
            marked.push(DELETED_MARKER);
            return Ok(PathBuf::from(marked));
        }
        Ok(d.path.clone())
    }

    fn socket_address(&self, fd: RawFd) -> Result<SocketAddress, Errno> {
        let state = self.state.borrow();
        state
            .get(fd, Operation::SocketName)?
            .socket
            .clone()
            .ok_or(Errno::ENOTSOCK)
    }

    fn reopen(&self, fd: RawFd, request: &ReopenRequest<'_>) -> Result<(), Errno> {
        let mut state = self.state.borrow_mut();
        state.get(fd, Operation::Reopen)?;

        let identity = *state.files.get(request.path).ok_or(Errno::ENOENT)?;
        if state.unlinked.contains(&identity.inode) {
            return Err(Errno::ENOENT);
        }
        let description = state.description();
        state.descriptors.insert(
            fd,
            MemoryDescriptor {
                identity,
                path: request.path.to_path_buf(),
                socket: None,
                status: request.open_mode | request.status_flags,
                descriptor_flags: request.descriptor_flags,
                offset: request.offset,
                description,
            },
        );
        Ok(())
    }

    fn detach(&self, fd: RawFd) -> Result<DetachOutcome, Errno> {
        let mut state = self.state.borrow_mut();
        let descriptor_flags = state.get(fd, Operation::Detach)?.descriptor_flags;

        let Some(identity) = state.placeholder else {
            state.descriptors.remove(&fd);
            return Ok(DetachOutcome::Closed);
        };
        let description = state.description();
        state.descriptors.insert(
            fd,
            MemoryDescriptor {
                identity,
                path: PathBuf::from(PLACEHOLDER_PATH),
                socket: None,
                status: OFlag::O_RDWR,
                descriptor_flags,
                offset: Some(0),
                description,
            },
        );
        Ok(DetachOutcome::Placeholder)
    }

    fn close(&self, fd: RawFd) -> Result<(), Errno> {
        let mut state = self.state.borrow_mut();
        state.get(fd, Operation::Close)?;
        state.descriptors.remove(&fd);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_path_same_inode() {
        let mem = MemoryIntrospector::new();
        mem.open_file(3, "/a", OFlag::O_RDONLY).unwrap();
        mem.open_file(4, "/a", OFlag::O_RDONLY).unwrap();
        mem.open_file(5, "/b", OFlag::O_RDONLY).unwrap();
        assert_eq!(mem.identity(3).unwrap(), mem.identity(4).unwrap());
        assert_ne!(mem.identity(3).unwrap(), mem.identity(5).unwrap());
        assert_ne!(mem.description(3), mem.description(4));
    }

    #[test]
    fn test_dup_shares_offset() {
        let mem = MemoryIntrospector::new();
        mem.open_file(3, "/a", OFlag::O_RDONLY).unwrap();
        mem.dup(3, 4).unwrap();
        mem.seek(4, 99).unwrap();
        assert_eq!(mem.offset(3).unwrap(), Some(99));
    }

    #[test]
    fn test_pipe_is_unseekable() {
        let mem = MemoryIntrospector::new();
        mem.open_pipe(3);
        assert_eq!(mem.seek(3, 1), Err(Errno::ESPIPE));
        assert_eq!(mem.offset(3).unwrap(), None);
    }

    #[test]
    fn test_injected_failures() {
        let mem = MemoryIntrospector::new();
        mem.open_file(3, "/a", OFlag::O_RDONLY).unwrap();
        mem.fail(3, Operation::Stat, Errno::EIO);
        assert_eq!(mem.identity(3), Err(Errno::EIO));
        mem.clear_failures();
        assert!(mem.identity(3).is_ok());

        mem.fail_enumeration(Errno::EMFILE);
        assert_eq!(mem.open_descriptors(), Err(Errno::EMFILE));
    }

    #[test]
    fn test_o_cloexec_becomes_descriptor_flag() {
        let mem = MemoryIntrospector::new();
        mem.open_file(3, "/a", OFlag::O_RDWR | OFlag::O_CLOEXEC).unwrap();
        assert_eq!(mem.descriptor_flags(3).unwrap(), FdFlag::FD_CLOEXEC);
        assert_eq!(mem.file_status(3).unwrap(), OFlag::O_RDWR);
    }
}
