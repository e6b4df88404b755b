//! Immutable snapshot of a single open descriptor.

use nix::errno::Errno;
use nix::fcntl::{FdFlag, OFlag};
use std::fmt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use forkguard_config::path::is_deleted;
use forkguard_config::{log_policy_debug, log_repair_debug, log_repair_warn, WhitelistConfig};

use crate::error::{AuditError, Change, Query, Result};
use crate::introspect::{
    DescriptorKind, DetachOutcome, FileIdentity, Introspector, ReopenRequest, SocketAddress,
};

/// What the repair pass does with a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Designated out-of-band; left exactly as it is.
    Preserve,
    /// Whitelisted file: replaced by a fresh open of the same path.
    Reopen,
    /// Socket: replaced by an inert placeholder.
    Detach,
    /// Everything else.
    Close,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Disposition::Preserve => "preserve",
            Disposition::Reopen => "reopen",
            Disposition::Detach => "detach",
            Disposition::Close => "close",
        };
        f.write_str(name)
    }
}

/// Result of repairing one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// The number still refers to an open descriptor that must be re-inspected.
    Replaced,
    /// The number is untouched.
    Unchanged,
    /// The number is no longer open.
    Closed,
}

/// Flags `open(2)` honours; the rest of `F_GETFL` is restored with `F_SETFL`.
fn open_mode_mask() -> OFlag {
    OFlag::O_ACCMODE | OFlag::O_DSYNC | OFlag::O_SYNC
}

/// Creation-time flags that carry no meaning once a file is open.
fn creation_mask() -> OFlag {
    OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_NOCTTY | OFlag::O_TRUNC | OFlag::O_CLOEXEC
}

/// Split raw `F_GETFL` output into (open mode, status flags).
pub fn split_status(raw: OFlag) -> (OFlag, OFlag) {
    let open_mode = raw & open_mode_mask();
    let status = raw.difference(open_mode_mask() | creation_mask());
    (open_mode, status)
}

/// Everything observable about one descriptor at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorRecord {
    descriptor: RawFd,
    identity: FileIdentity,
    resolved_path: Option<PathBuf>,
    socket: Option<SocketAddress>,
    open_mode: OFlag,
    descriptor_flags: FdFlag,
    status_flags: OFlag,
    offset: Option<i64>,
}

impl DescriptorRecord {
    /// Snapshot `fd`. Fails if any query needed for the record fails.
    pub fn inspect<I>(fd: RawFd, introspector: &I) -> Result<Self>
    where
        I: Introspector + ?Sized,
    {
        let query = |query: Query| move |source: Errno| AuditError::Inspection { fd, query, source };

        let identity = introspector.identity(fd).map_err(query(Query::Stat))?;
        let descriptor_flags = introspector
            .descriptor_flags(fd)
            .map_err(query(Query::DescriptorFlags))?;
        let raw_status = introspector
            .file_status(fd)
            .map_err(query(Query::StatusFlags))?;
        let (open_mode, status_flags) = split_status(raw_status);

        let (resolved_path, socket, offset) = if identity.kind == DescriptorKind::Socket {
            let address = introspector
                .socket_address(fd)
                .map_err(query(Query::SocketName))?;
            (address.name().map(Path::to_path_buf), Some(address), None)
        } else {
            let path = introspector.resolve_path(fd).map_err(query(Query::Path))?;
            let offset = introspector.offset(fd).map_err(query(Query::Offset))?;
            (Some(path), None, offset)
        };

        Ok(Self {
            descriptor: fd,
            identity,
            resolved_path,
            socket,
            open_mode,
            descriptor_flags,
            status_flags,
            offset,
        })
    }

    pub fn descriptor(&self) -> RawFd {
        self.descriptor
    }

    pub fn identity(&self) -> FileIdentity {
        self.identity
    }

    pub fn kind(&self) -> DescriptorKind {
        self.identity.kind
    }

    /// Link target for files, bound name for named Unix sockets.
    pub fn resolved_path(&self) -> Option<&Path> {
        self.resolved_path.as_deref()
    }

    pub fn socket(&self) -> Option<&SocketAddress> {
        self.socket.as_ref()
    }

    pub fn is_socket(&self) -> bool {
        self.socket.is_some()
    }

    pub fn open_mode(&self) -> OFlag {
        self.open_mode
    }

    pub fn descriptor_flags(&self) -> FdFlag {
        self.descriptor_flags
    }

    pub fn status_flags(&self) -> OFlag {
        self.status_flags
    }

    pub fn offset(&self) -> Option<i64> {
        self.offset
    }

    /// Whether the resolved path passes the whitelist.
    pub fn is_whitelisted(&self, policy: &WhitelistConfig) -> bool {
        match self.resolved_path() {
            Some(path) => !is_deleted(path) && policy.is_whitelisted(path),
            None => false,
        }
    }

    /// Repair action for this record. Pure: depends only on the record's
    /// kind, path and socket address.
    pub fn disposition(&self, policy: &WhitelistConfig) -> Disposition {
        if self.is_socket() {
            return Disposition::Detach;
        }
        if self.kind().is_reopenable() && self.is_whitelisted(policy) {
            return Disposition::Reopen;
        }
        log_policy_debug!(
            "Descriptor not whitelisted",
            fd = self.descriptor,
            kind = tracing::field::display(self.kind()),
            path = tracing::field::debug(self.resolved_path()),
        );
        Disposition::Close
    }

    /// Fields of `self` that differ in `current`.
    ///
    /// Offsets are compared only for non-socket descriptors.
    pub fn diff(&self, current: &DescriptorRecord) -> Vec<Change> {
        let mut changes = Vec::new();

        if self.identity != current.identity {
            changes.push(Change::Identity {
                before: self.identity,
                after: current.identity,
            });
        }
        if self.open_mode != current.open_mode {
            changes.push(Change::OpenMode {
                before: self.open_mode,
                after: current.open_mode,
            });
        }
        if self.descriptor_flags != current.descriptor_flags {
            changes.push(Change::DescriptorFlags {
                before: self.descriptor_flags,
                after: current.descriptor_flags,
            });
        }
        if self.status_flags != current.status_flags {
            changes.push(Change::StatusFlags {
                before: self.status_flags,
                after: current.status_flags,
            });
        }
        if !self.is_socket() && self.offset != current.offset {
            changes.push(Change::Offset {
                before: self.offset,
                after: current.offset,
            });
        }

        changes
    }

    /// Re-inspect the same descriptor number and compare against this record.
    ///
    /// An empty list means no drift.
    pub fn restat<I>(&self, introspector: &I) -> Result<Vec<Change>>
    where
        I: Introspector + ?Sized,
    {
        let current = Self::inspect(self.descriptor, introspector)?;
        Ok(self.diff(&current))
    }

    /// Parameters for reopening this record's path, if it has one.
    pub fn reopen_request(&self) -> Option<ReopenRequest<'_>> {
        Some(ReopenRequest {
            path: self.resolved_path.as_deref()?,
            open_mode: self.open_mode,
            status_flags: self.status_flags,
            descriptor_flags: self.descriptor_flags,
            offset: self.offset,
        })
    }

    /// Apply `disposition` to the live descriptor.
    pub fn reopen_or_detach<I>(
        &self,
        introspector: &I,
        disposition: Disposition,
    ) -> Result<RepairOutcome>
    where
        I: Introspector + ?Sized,
    {
        let fd = self.descriptor;
        let failed = |source: Errno| AuditError::Repair {
            fd,
            action: disposition,
            source,
        };

        match disposition {
            Disposition::Preserve => Ok(RepairOutcome::Unchanged),
            Disposition::Reopen => {
                let request = self.reopen_request().ok_or_else(|| failed(Errno::ENOENT))?;
                introspector.reopen(fd, &request).map_err(failed)?;
                log_repair_debug!(
                    "Descriptor reopened",
                    fd = fd,
                    path = tracing::field::display(request.path.display()),
                    offset = tracing::field::debug(request.offset),
                );
                Ok(RepairOutcome::Replaced)
            }
            Disposition::Detach => match introspector.detach(fd).map_err(failed)? {
                DetachOutcome::Placeholder => {
                    log_repair_debug!("Socket detached", fd = fd);
                    Ok(RepairOutcome::Replaced)
                }
                DetachOutcome::Closed => {
                    log_repair_warn!("No placeholder available, socket closed", fd = fd);
                    Ok(RepairOutcome::Closed)
                }
            },
            Disposition::Close => {
                introspector.close(fd).map_err(failed)?;
                log_repair_debug!("Descriptor closed", fd = fd);
                Ok(RepairOutcome::Closed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryIntrospector, Operation};

    fn policy() -> WhitelistConfig {
        WhitelistConfig::empty().allow("/etc/app.conf")
    }

    #[test]
    fn test_split_status_separates_open_mode() {
        let raw = OFlag::O_RDWR | OFlag::O_APPEND | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC;
        let (open_mode, status) = split_status(raw);
        assert_eq!(open_mode, OFlag::O_RDWR);
        assert_eq!(status, OFlag::O_APPEND | OFlag::O_NONBLOCK);
    }

    #[test]
    fn test_inspect_file() {
        let mem = MemoryIntrospector::new();
        mem.open_file(5, "/etc/app.conf", OFlag::O_RDONLY | OFlag::O_APPEND)
            .unwrap();
        mem.seek(5, 10).unwrap();

        let record = DescriptorRecord::inspect(5, &mem).unwrap();
        assert_eq!(record.descriptor(), 5);
        assert_eq!(record.kind(), DescriptorKind::Regular);
        assert_eq!(record.resolved_path(), Some(Path::new("/etc/app.conf")));
        assert_eq!(record.open_mode(), OFlag::O_RDONLY);
        assert_eq!(record.status_flags(), OFlag::O_APPEND);
        assert_eq!(record.offset(), Some(10));
        assert!(!record.is_socket());
    }

    #[test]
    fn test_inspect_named_socket() {
        let mem = MemoryIntrospector::new();
        mem.open_socket(3, SocketAddress::Named(PathBuf::from("/dev/socket/zygote")));

        let record = DescriptorRecord::inspect(3, &mem).unwrap();
        assert!(record.is_socket());
        assert_eq!(
            record.resolved_path(),
            Some(Path::new("/dev/socket/zygote"))
        );
        assert_eq!(record.offset(), None);
    }

    #[test]
    fn test_inspect_abstract_socket_has_no_name() {
        let mem = MemoryIntrospector::new();
        mem.open_socket(3, SocketAddress::Abstract);

        let record = DescriptorRecord::inspect(3, &mem).unwrap();
        assert!(record.is_socket());
        assert_eq!(record.resolved_path(), None);
    }

    #[test]
    fn test_inspect_failure_names_query() {
        let mem = MemoryIntrospector::new();
        mem.open_file(4, "/etc/app.conf", OFlag::O_RDONLY).unwrap();
        mem.fail(4, Operation::Path, Errno::EACCES);

        let err = DescriptorRecord::inspect(4, &mem).unwrap_err();
        assert!(matches!(
            err,
            AuditError::Inspection {
                fd: 4,
                query: Query::Path,
                source: Errno::EACCES
            }
        ));
    }

    #[test]
    fn test_disposition_is_pure_function_of_path() {
        let mem = MemoryIntrospector::new();
        mem.open_file(3, "/etc/app.conf", OFlag::O_RDONLY).unwrap();
        mem.open_file(4, "/etc/app.conf", OFlag::O_RDWR).unwrap();
        mem.open_file(5, "/tmp/scratch", OFlag::O_RDWR).unwrap();
        mem.open_socket(6, SocketAddress::Unnamed);
        mem.open_pipe(7);

        let policy = policy();
        let disposition = |fd| DescriptorRecord::inspect(fd, &mem).unwrap().disposition(&policy);
        assert_eq!(disposition(3), Disposition::Reopen);
        assert_eq!(disposition(4), Disposition::Reopen);
        assert_eq!(disposition(5), Disposition::Close);
        assert_eq!(disposition(6), Disposition::Detach);
        assert_eq!(disposition(7), Disposition::Close);
    }

    #[test]
    fn test_deleted_whitelisted_file_is_closed() {
        let mem = MemoryIntrospector::new();
        mem.open_file(3, "/etc/app.conf", OFlag::O_RDONLY).unwrap();
        mem.unlink("/etc/app.conf");

        let record = DescriptorRecord::inspect(3, &mem).unwrap();
        assert_eq!(
            record.resolved_path(),
            Some(Path::new("/etc/app.conf (deleted)"))
        );
        assert_eq!(record.disposition(&policy()), Disposition::Close);
    }

    #[test]
    fn test_whitelisted_directory_is_not_reopened() {
        let mem = MemoryIntrospector::new();
        mem.open_directory(3, "/etc/app.conf");
        let record = DescriptorRecord::inspect(3, &mem).unwrap();
        assert_eq!(record.disposition(&policy()), Disposition::Close);
    }

    #[test]
    fn test_restat_unchanged() {
        let mem = MemoryIntrospector::new();
        mem.open_file(3, "/etc/app.conf", OFlag::O_RDONLY).unwrap();
        let record = DescriptorRecord::inspect(3, &mem).unwrap();
        assert!(record.restat(&mem).unwrap().is_empty());
    }

    #[test]
    fn test_restat_detects_seek() {
        let mem = MemoryIntrospector::new();
        mem.open_file(3, "/etc/app.conf", OFlag::O_RDONLY).unwrap();
        let record = DescriptorRecord::inspect(3, &mem).unwrap();

        mem.seek(3, 42).unwrap();
        assert_eq!(
            record.restat(&mem).unwrap(),
            vec![Change::Offset {
                before: Some(0),
                after: Some(42)
            }]
        );
    }

    #[test]
    fn test_restat_detects_reuse_with_other_flags() {
        let mem = MemoryIntrospector::new();
        mem.open_file(3, "/etc/app.conf", OFlag::O_RDONLY).unwrap();
        let record = DescriptorRecord::inspect(3, &mem).unwrap();

        mem.close_external(3);
        mem.open_file(3, "/etc/app.conf", OFlag::O_RDWR | OFlag::O_NONBLOCK)
            .unwrap();

        let changes = record.restat(&mem).unwrap();
        assert!(changes.contains(&Change::OpenMode {
            before: OFlag::O_RDONLY,
            after: OFlag::O_RDWR
        }));
        assert!(changes.contains(&Change::StatusFlags {
            before: OFlag::empty(),
            after: OFlag::O_NONBLOCK
        }));
        // Same file, so identity is unchanged
        assert!(!changes
            .iter()
            .any(|c| matches!(c, Change::Identity { .. })));
    }

    #[test]
    fn test_restat_detects_identity_change() {
        let mem = MemoryIntrospector::new();
        mem.open_file(3, "/etc/app.conf", OFlag::O_RDONLY).unwrap();
        let record = DescriptorRecord::inspect(3, &mem).unwrap();

        mem.close_external(3);
        mem.open_file(3, "/etc/other.conf", OFlag::O_RDONLY).unwrap();

        let changes = record.restat(&mem).unwrap();
        assert!(matches!(changes.as_slice(), [Change::Identity { .. }]));
    }

    #[test]
    fn test_restat_of_closed_descriptor_fails() {
        let mem = MemoryIntrospector::new();
        mem.open_file(3, "/etc/app.conf", OFlag::O_RDONLY).unwrap();
        let record = DescriptorRecord::inspect(3, &mem).unwrap();

        mem.close_external(3);
        assert!(matches!(
            record.restat(&mem),
            Err(AuditError::Inspection {
                fd: 3,
                query: Query::Stat,
                source: Errno::EBADF
            })
        ));
    }

    #[test]
    fn test_reopen_preserves_path_mode_offset() {
        let mem = MemoryIntrospector::new();
        mem.open_file(3, "/etc/app.conf", OFlag::O_RDONLY | OFlag::O_NONBLOCK)
            .unwrap();
        mem.seek(3, 10).unwrap();
        mem.set_descriptor_flags(3, FdFlag::FD_CLOEXEC).unwrap();
        let before = mem.description(3).unwrap();

        let record = DescriptorRecord::inspect(3, &mem).unwrap();
        let outcome = record
            .reopen_or_detach(&mem, Disposition::Reopen)
            .unwrap();
        assert_eq!(outcome, RepairOutcome::Replaced);

        assert_ne!(mem.description(3).unwrap(), before);
        let after = DescriptorRecord::inspect(3, &mem).unwrap();
        assert!(record.diff(&after).is_empty());
    }

    #[test]
    fn test_reopen_failure_is_repair_error() {
        let mem = MemoryIntrospector::new();
        mem.open_file(3, "/etc/app.conf", OFlag::O_RDONLY).unwrap();
        let record = DescriptorRecord::inspect(3, &mem).unwrap();
        mem.fail(3, Operation::Reopen, Errno::EACCES);

        let err = record
            .reopen_or_detach(&mem, Disposition::Reopen)
            .unwrap_err();
        assert!(matches!(
            err,
            AuditError::Repair {
                fd: 3,
                action: Disposition::Reopen,
                source: Errno::EACCES
            }
        ));
    }

    #[test]
    fn test_reopen_without_path_fails() {
        let mem = MemoryIntrospector::new();
        mem.open_socket(3, SocketAddress::Unnamed);
        let record = DescriptorRecord::inspect(3, &mem).unwrap();
        assert!(record.reopen_request().is_none());
        assert!(record.reopen_or_detach(&mem, Disposition::Reopen).is_err());
    }

    #[test]
    fn test_detach_installs_placeholder() {
        let mem = MemoryIntrospector::new();
        mem.open_socket(3, SocketAddress::Named(PathBuf::from("/run/ctl.sock")));
        let record = DescriptorRecord::inspect(3, &mem).unwrap();

        let outcome = record
            .reopen_or_detach(&mem, Disposition::Detach)
            .unwrap();
        assert_eq!(outcome, RepairOutcome::Replaced);

        let after = DescriptorRecord::inspect(3, &mem).unwrap();
        assert!(!after.is_socket());
        assert_eq!(after.kind(), DescriptorKind::CharDevice);
        assert_eq!(after.resolved_path(), Some(Path::new("/dev/null")));
    }

    #[test]
    fn test_detach_without_placeholder_closes() {
        let mem = MemoryIntrospector::without_placeholder();
        mem.open_socket(3, SocketAddress::Unnamed);
        let record = DescriptorRecord::inspect(3, &mem).unwrap();

        let outcome = record
            .reopen_or_detach(&mem, Disposition::Detach)
            .unwrap();
        assert_eq!(outcome, RepairOutcome::Closed);
        assert!(!mem.is_open(3));
    }

    #[test]
    fn test_close_and_preserve() {
        let mem = MemoryIntrospector::new();
        mem.open_file(3, "/tmp/scratch", OFlag::O_RDWR).unwrap();
        mem.open_file(4, "/tmp/scratch", OFlag::O_RDWR).unwrap();
        let closed = DescriptorRecord::inspect(3, &mem).unwrap();
        let kept = DescriptorRecord::inspect(4, &mem).unwrap();

        assert_eq!(
            closed.reopen_or_detach(&mem, Disposition::Close).unwrap(),
            RepairOutcome::Closed
        );
        assert_eq!(
            kept.reopen_or_detach(&mem, Disposition::Preserve).unwrap(),
            RepairOutcome::Unchanged
        );
        assert!(!mem.is_open(3));
        assert!(mem.is_open(4));
    }
}
