use nix::errno::Errno;
use nix::fcntl::{FdFlag, OFlag};
use std::fmt;
use std::os::unix::io::RawFd;
use thiserror::Error;

use crate::introspect::FileIdentity;
use crate::record::Disposition;
use crate::table::TableState;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("cannot enumerate open descriptors: {0}")]
    Enumeration(#[source] Errno),

    #[error("cannot inspect fd {fd} ({query}): {source}")]
    Inspection {
        fd: RawFd,
        query: Query,
        #[source]
        source: Errno,
    },

    #[error("{} descriptor(s) drifted since the snapshot: {}", .0.len(), ViolationList(.0))]
    IdentityDrift(Vec<Violation>),

    #[error("cannot {action} fd {fd}: {source}")]
    Repair {
        fd: RawFd,
        action: Disposition,
        #[source]
        source: Errno,
    },

    #[error("cannot {operation} a table in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: TableState,
    },

    #[error("configuration error: {0}")]
    Config(#[from] forkguard_config::ConfigError),
}

pub type Result<T> = std::result::Result<T, AuditError>;

impl AuditError {
    /// Violations carried by an `IdentityDrift`, empty for other errors.
    pub fn violations(&self) -> &[Violation] {
        match self {
            AuditError::IdentityDrift(v) => v,
            _ => &[],
        }
    }
}

/// The introspection query that failed while building a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    Stat,
    DescriptorFlags,
    StatusFlags,
    Offset,
    Path,
    SocketName,
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Query::Stat => "fstat",
            Query::DescriptorFlags => "F_GETFD",
            Query::StatusFlags => "F_GETFL",
            Query::Offset => "lseek",
            Query::Path => "readlink",
            Query::SocketName => "getsockname",
        };
        f.write_str(name)
    }
}

/// One reason a restat failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// A baseline descriptor is no longer open.
    Closed { fd: RawFd },
    /// A baseline descriptor is open but no longer matches its record.
    Changed { fd: RawFd, changes: Vec<Change> },
    /// A descriptor opened after the snapshot was never classified.
    Untracked { fd: RawFd },
    /// A baseline descriptor could not be re-inspected.
    Uninspectable { fd: RawFd, query: Query, source: Errno },
}

impl Violation {
    pub fn fd(&self) -> RawFd {
        match self {
            Violation::Closed { fd }
            | Violation::Changed { fd, .. }
            | Violation::Untracked { fd }
            | Violation::Uninspectable { fd, .. } => *fd,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Closed { fd } => write!(f, "fd {fd} closed"),
            Violation::Changed { fd, changes } => {
                write!(f, "fd {fd} changed (")?;
                for (i, change) in changes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{change}")?;
                }
                f.write_str(")")
            }
            Violation::Untracked { fd } => write!(f, "fd {fd} untracked"),
            Violation::Uninspectable { fd, query, source } => {
                write!(f, "fd {fd} uninspectable ({query}: {source})")
            }
        }
    }
}

struct ViolationList<'a>(&'a [Violation]);

impl fmt::Display for ViolationList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{v}")?;
        }
        Ok(())
    }
}

/// A single field that differs between a record and its restat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Identity {
        before: FileIdentity,
        after: FileIdentity,
    },
    OpenMode {
        before: OFlag,
        after: OFlag,
    },
    DescriptorFlags {
        before: FdFlag,
        after: FdFlag,
    },
    StatusFlags {
        before: OFlag,
        after: OFlag,
    },
    Offset {
        before: Option<i64>,
        after: Option<i64>,
    },
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Identity { before, after } => write!(f, "identity {before} -> {after}"),
            Change::OpenMode { before, after } => {
                write!(f, "open mode {:#o} -> {:#o}", before.bits(), after.bits())
            }
            Change::DescriptorFlags { before, after } => {
                write!(f, "fd flags {:#x} -> {:#x}", before.bits(), after.bits())
            }
            Change::StatusFlags { before, after } => {
                write!(f, "status flags {:#o} -> {:#o}", before.bits(), after.bits())
            }
            Change::Offset { before, after } => write!(f, "offset {before:?} -> {after:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drift_message_lists_every_violation() {
        let err = AuditError::IdentityDrift(vec![
            Violation::Closed { fd: 5 },
            Violation::Untracked { fd: 9 },
            Violation::Changed {
                fd: 6,
                changes: vec![Change::Offset {
                    before: Some(10),
                    after: Some(0),
                }],
            },
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("3 descriptor(s) drifted"));
        assert!(msg.contains("fd 5 closed"));
        assert!(msg.contains("fd 9 untracked"));
        assert!(msg.contains("fd 6 changed (offset Some(10) -> Some(0))"));
        assert_eq!(err.violations().len(), 3);
    }

    #[test]
    fn test_repair_message_names_action() {
        let err = AuditError::Repair {
            fd: 7,
            action: Disposition::Reopen,
            source: Errno::ENOENT,
        };
        assert!(err.to_string().starts_with("cannot reopen fd 7"));
        assert!(err.violations().is_empty());
    }

    #[test]
    fn test_violation_fd() {
        let v = Violation::Uninspectable {
            fd: 4,
            query: Query::Stat,
            source: Errno::EBADF,
        };
        assert_eq!(v.fd(), 4);
        assert!(v.to_string().contains("fstat"));
    }
}
