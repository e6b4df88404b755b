//! Whitelist policy: which resolved paths may survive into a forked child.
//!
//! The rule set is plain configuration data. A path is whitelisted if it
//! matches one of:
//! 1. the fixed `paths` list (exact match),
//! 2. the archive rule: under one of `archives.dirs`, ending in `archives.suffix`,
//! 3. the overlay rule: under one of `overlays.dirs` ending in `overlays.suffix`,
//!    or under `overlays.idmap_dir` ending in `overlays.idmap_suffix`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::path::{ends_with, is_under};

/// Whitelist rule set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhitelistConfig {
    /// Exact paths that may be passed through
    pub paths: Vec<PathBuf>,
    /// Package archives under the system framework directories
    pub archives: ArchiveRule,
    /// Framework overlay resources
    pub overlays: OverlayRule,
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            paths: [
                "/dev/null",
                "/dev/socket/zygote",
                "/dev/socket/zygote_secondary",
                "/dev/socket/webview_zygote",
                "/sys/kernel/debug/tracing/trace_marker",
                "/system/framework/framework-res.apk",
                "/dev/urandom",
                "/dev/ion",
                "/dev/dri/renderD129",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
            archives: ArchiveRule::default(),
            overlays: OverlayRule::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveRule {
    pub dirs: Vec<PathBuf>,
    pub suffix: String,
}

impl Default for ArchiveRule {
    fn default() -> Self {
        Self {
            dirs: vec![PathBuf::from("/system/framework/")],
            suffix: ".jar".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayRule {
    pub dirs: Vec<PathBuf>,
    pub suffix: String,
    /// Compiled idmaps for overlays, e.g.
    /// `/data/resource-cache/system@vendor@overlay@framework-res.apk@idmap`
    pub idmap_dir: PathBuf,
    pub idmap_suffix: String,
}

impl Default for OverlayRule {
    fn default() -> Self {
        Self {
            dirs: vec![
                PathBuf::from("/system/vendor/overlay/"),
                PathBuf::from("/system/vendor/overlay-subdir/"),
                PathBuf::from("/vendor/overlay/"),
            ],
            suffix: ".apk".to_string(),
            idmap_dir: PathBuf::from("/data/resource-cache/"),
            idmap_suffix: ".apk@idmap".to_string(),
        }
    }
}

impl WhitelistConfig {
    /// A rule set that whitelists nothing.
    pub fn empty() -> Self {
        Self {
            paths: Vec::new(),
            archives: ArchiveRule {
                dirs: Vec::new(),
                suffix: String::new(),
            },
            overlays: OverlayRule {
                dirs: Vec::new(),
                suffix: String::new(),
                idmap_dir: PathBuf::new(),
                idmap_suffix: String::new(),
            },
        }
    }

    /// Add an exact path to the fixed list.
    pub fn allow(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    /// Returns true iff `path` may be passed into a child.
    pub fn is_whitelisted(&self, path: &Path) -> bool {
        if self.paths.iter().any(|p| p == path) {
            return true;
        }
        self.archives.matches(path) || self.overlays.matches(path)
    }

    /// Number of rules that can match anything at all.
    pub fn rule_count(&self) -> usize {
        self.paths.len()
            + usize::from(self.archives.is_active())
            + usize::from(self.overlays.is_active())
    }
}

impl ArchiveRule {
    fn is_active(&self) -> bool {
        !self.dirs.is_empty() && !self.suffix.is_empty()
    }

    pub fn matches(&self, path: &Path) -> bool {
        ends_with(path, &self.suffix) && self.dirs.iter().any(|d| is_under(path, d))
    }
}

impl OverlayRule {
    fn is_active(&self) -> bool {
        (!self.dirs.is_empty() && !self.suffix.is_empty())
            || (!self.idmap_dir.as_os_str().is_empty() && !self.idmap_suffix.is_empty())
    }

    pub fn matches(&self, path: &Path) -> bool {
        if ends_with(path, &self.suffix) && self.dirs.iter().any(|d| is_under(path, d)) {
            return true;
        }
        ends_with(path, &self.idmap_suffix) && is_under(path, &self.idmap_dir)
    }
}
