//! Test environment abstraction for isolated descriptor audits.
//!
//! Provides `TestEnvironment` to manage:
//! - An isolated scratch directory with canonical paths
//! - Files that are (or are not) on the whitelist
//! - Unique Unix socket paths
//!
//! # Usage
//!
//! ```ignore
//! use forkguard_config::testing::TestEnvironment;
//!
//! let env = TestEnvironment::new()?;
//! let conf = env.create_file("app.conf", b"key=value")?;
//! let policy = env.policy_allowing(&[&conf]);
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::{AuditConfig, WhitelistConfig};

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique, canonical paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Canonical root of the scratch directory
    pub root: PathBuf,
    /// Unique socket path for this test
    pub socket_path: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        // Descriptor paths are resolved by the kernel, so compare against the
        // canonical form (e.g. when /tmp is itself a symlink).
        let root = temp_dir.path().canonicalize()?;
        let socket_path = root.join(format!("forkguard-test-{}.sock", test_id));

        Ok(Self {
            _temp_dir: temp_dir,
            root,
            socket_path,
            test_id,
        })
    }

    /// Create a test file with content
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Whitelist containing exactly the given paths and nothing else
    pub fn policy_allowing(&self, paths: &[&Path]) -> WhitelistConfig {
        paths
            .iter()
            .fold(WhitelistConfig::empty(), |policy, p| policy.allow(*p))
    }

    /// Audit settings that keep stdio out of the repair pass
    pub fn audit_config(&self) -> AuditConfig {
        AuditConfig {
            preserved_descriptors: vec![0, 1, 2],
            ..AuditConfig::default()
        }
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
