//! Whole-process descriptor table: snapshot, restat, repair.

use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::io::RawFd;

use forkguard_config::{
    log_repair_error, log_repair_info, log_restat_debug, log_restat_error, log_snapshot_error,
    log_snapshot_info, AuditConfig, Config, WhitelistConfig,
};

use crate::error::{AuditError, Result, Violation};
use crate::introspect::Introspector;
use crate::proc::ProcIntrospector;
use crate::record::{DescriptorRecord, Disposition, RepairOutcome};

/// Lifecycle of a table.
///
/// ```text
/// Snapshotted ─restat─▶ Verified ─repair─▶ Repaired ─restat─▶ Verified ...
///      │                   │
///      └──────restat fails─┴─▶ Drifted        repair fails ─▶ RepairFailed
/// ```
///
/// `Drifted` and `RepairFailed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    Snapshotted,
    Verified,
    Drifted,
    Repaired,
    RepairFailed,
}

impl TableState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TableState::Drifted | TableState::RepairFailed)
    }
}

/// Counts of what a repair pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RepairSummary {
    pub reopened: usize,
    pub detached: usize,
    pub closed: usize,
    pub preserved: usize,
}

impl RepairSummary {
    fn count(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Reopen => self.reopened += 1,
            Disposition::Detach => self.detached += 1,
            Disposition::Close => self.closed += 1,
            Disposition::Preserve => self.preserved += 1,
        }
    }
}

/// Every descriptor open at snapshot time, keyed by number.
///
/// Invariant: one record per tracked descriptor, no gaps. A table is never
/// shared across threads; the caller serializes snapshot through fork.
#[derive(Debug)]
pub struct DescriptorTable<I: Introspector = ProcIntrospector> {
    introspector: I,
    policy: WhitelistConfig,
    preserved: BTreeSet<RawFd>,
    records: BTreeMap<RawFd, DescriptorRecord>,
    state: TableState,
}

impl DescriptorTable<ProcIntrospector> {
    /// Snapshot the calling process's descriptors.
    pub fn create(config: &AuditConfig, policy: WhitelistConfig) -> Result<Self> {
        Self::create_with(
            ProcIntrospector::from_config(config),
            policy,
            config.preserved_descriptors.iter().copied(),
        )
    }

    /// Load configuration from the standard locations and snapshot.
    pub fn load() -> Result<Self> {
        let config = Config::load()?;
        Self::create(&config.audit, config.whitelist)
    }
}

impl<I: Introspector> DescriptorTable<I> {
    /// Snapshot every descriptor `introspector` reports.
    ///
    /// Fails without returning a partial table if enumeration or any single
    /// inspection fails.
    pub fn create_with(
        introspector: I,
        policy: WhitelistConfig,
        preserved: impl IntoIterator<Item = RawFd>,
    ) -> Result<Self> {
        let fds = introspector.open_descriptors().map_err(|e| {
            log_snapshot_error!("Descriptor enumeration failed", error = e.desc());
            AuditError::Enumeration(e)
        })?;

        let mut records = BTreeMap::new();
        for fd in fds {
            let record = DescriptorRecord::inspect(fd, &introspector).map_err(|e| {
                log_snapshot_error!(
                    "Descriptor inspection failed",
                    fd = fd,
                    error = tracing::field::display(&e)
                );
                e
            })?;
            records.insert(fd, record);
        }

        log_snapshot_info!(
            "Descriptor table created",
            descriptors = records.len(),
            rules = policy.rule_count(),
        );

        Ok(Self {
            introspector,
            policy,
            preserved: preserved.into_iter().collect(),
            records,
            state: TableState::Snapshotted,
        })
    }

    pub fn state(&self) -> TableState {
        self.state
    }

    pub fn policy(&self) -> &WhitelistConfig {
        &self.policy
    }

    pub fn introspector(&self) -> &I {
        &self.introspector
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, fd: RawFd) -> Option<&DescriptorRecord> {
        self.records.get(&fd)
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.records.contains_key(&fd)
    }

    /// Records in ascending descriptor order.
    pub fn records(&self) -> impl Iterator<Item = &DescriptorRecord> {
        self.records.values()
    }

    pub fn is_preserved(&self, fd: RawFd) -> bool {
        self.preserved.contains(&fd)
    }

    /// Repair action for a tracked descriptor.
    pub fn disposition(&self, fd: RawFd) -> Option<Disposition> {
        let record = self.records.get(&fd)?;
        if self.preserved.contains(&fd) {
            return Some(Disposition::Preserve);
        }
        Some(record.disposition(&self.policy))
    }

    /// What `reopen_or_detach` would do, in the order it would do it.
    pub fn plan(&self) -> Vec<(RawFd, Disposition)> {
        self.records
            .keys()
            .filter_map(|&fd| Some((fd, self.disposition(fd)?)))
            .collect()
    }

    fn require(&self, operation: &'static str, allowed: &[TableState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(AuditError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Confirm that no descriptor changed since the snapshot.
    ///
    /// Every baseline descriptor must still be open and unchanged, and no
    /// descriptor may be open that the baseline does not track. All
    /// violations are reported together. Any failure leaves the table
    /// `Drifted`.
    pub fn restat(&mut self) -> Result<()> {
        self.require(
            "restat",
            &[
                TableState::Snapshotted,
                TableState::Verified,
                TableState::Repaired,
            ],
        )?;

        let violations = match self.collect_violations() {
            Ok(violations) => violations,
            Err(e) => {
                log_restat_error!(
                    "Restat aborted",
                    error = tracing::field::display(&e)
                );
                self.state = TableState::Drifted;
                return Err(e);
            }
        };

        if violations.is_empty() {
            log_restat_debug!("No descriptor drift", descriptors = self.records.len());
            self.state = TableState::Verified;
            return Ok(());
        }

        for violation in &violations {
            log_restat_error!(
                "Descriptor drift",
                fd = violation.fd(),
                violation = tracing::field::display(violation)
            );
        }
        self.state = TableState::Drifted;
        Err(AuditError::IdentityDrift(violations))
    }

    fn collect_violations(&self) -> Result<Vec<Violation>> {
        let mut open = self
            .introspector
            .open_descriptors()
            .map_err(AuditError::Enumeration)?;

        let mut violations = Vec::new();
        for (&fd, record) in &self.records {
            if !open.remove(&fd) {
                violations.push(Violation::Closed { fd });
                continue;
            }
            match record.restat(&self.introspector) {
                Ok(changes) if changes.is_empty() => {}
                Ok(changes) => violations.push(Violation::Changed { fd, changes }),
                Err(AuditError::Inspection { query, source, .. }) => {
                    violations.push(Violation::Uninspectable { fd, query, source })
                }
                Err(e) => return Err(e),
            }
        }
        violations.extend(open.into_iter().map(|fd| Violation::Untracked { fd }));

        Ok(violations)
    }

    /// Reopen whitelisted files, detach sockets and close everything else.
    ///
    /// Requires a successful `restat` first. Descriptors are processed in
    /// ascending order and the pass stops at the first failure, leaving the
    /// table `RepairFailed`. On success the table describes the repaired
    /// descriptor set and can be restatted again before the next fork.
    pub fn reopen_or_detach(&mut self) -> Result<RepairSummary> {
        self.require("repair", &[TableState::Verified])?;

        match self.repair_all() {
            Ok(summary) => {
                log_repair_info!(
                    "Descriptor repair complete",
                    reopened = summary.reopened,
                    detached = summary.detached,
                    closed = summary.closed,
                    preserved = summary.preserved,
                );
                self.state = TableState::Repaired;
                Ok(summary)
            }
            Err(e) => {
                log_repair_error!("Descriptor repair failed", error = tracing::field::display(&e));
                self.state = TableState::RepairFailed;
                Err(e)
            }
        }
    }

    fn repair_all(&mut self) -> Result<RepairSummary> {
        let mut summary = RepairSummary::default();

        for (fd, disposition) in self.plan() {
            let outcome = match self.records.get(&fd) {
                Some(record) => record.reopen_or_detach(&self.introspector, disposition)?,
                None => continue,
            };

            match outcome {
                RepairOutcome::Replaced => {
                    let fresh = DescriptorRecord::inspect(fd, &self.introspector).map_err(|e| {
                        match e {
                            AuditError::Inspection { source, .. } => AuditError::Repair {
                                fd,
                                action: disposition,
                                source,
                            },
                            other => other,
                        }
                    })?;
                    self.records.insert(fd, fresh);
                }
                RepairOutcome::Closed => {
                    self.records.remove(&fd);
                }
                RepairOutcome::Unchanged => {}
            }
            summary.count(disposition);
        }

        Ok(summary)
    }
}
