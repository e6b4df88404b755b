//! # forkguard-audit
//!
//! File descriptor audit and repair for forking servers.
//!
//! A long-lived parent that forks specialized children must guarantee that
//! nothing it did not intend to share leaks across the fork. This crate:
//! 1. Snapshots every open descriptor ([`DescriptorTable::create`])
//! 2. Verifies before each fork that nothing drifted ([`DescriptorTable::restat`])
//! 3. In the child, reopens whitelisted files, detaches sockets and closes
//!    the rest ([`DescriptorTable::reopen_or_detach`])
//!
//! ```ignore
//! let mut table = DescriptorTable::load()?;
//! table.restat()?;
//! match unsafe { nix::unistd::fork() }? {
//!     ForkResult::Child => { table.reopen_or_detach()?; /* specialize */ }
//!     ForkResult::Parent { .. } => {}
//! }
//! ```
//!
//! Not thread-safe: the caller must hold the process single-threaded (or
//! otherwise serialize descriptor creation) between snapshot and fork.

pub mod error;
pub mod introspect;
pub mod memory;
pub mod proc;
pub mod record;
pub mod table;

pub use error::{AuditError, Change, Query, Result, Violation};
pub use introspect::{
    DescriptorKind, DetachOutcome, FileIdentity, Introspector, ReopenRequest, SocketAddress,
};
pub use memory::MemoryIntrospector;
pub use proc::ProcIntrospector;
pub use record::{DescriptorRecord, Disposition, RepairOutcome};
pub use table::{DescriptorTable, RepairSummary, TableState};
