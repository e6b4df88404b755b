//! Lexical path predicates used by the whitelist rules.
//!
//! Descriptor paths come from the kernel's self-fd links, so they are already
//! absolute and canonical. These helpers never touch the filesystem: the
//! descriptor may point at a file that has since been renamed or unlinked,
//! and whitelist classification must stay a pure function of the string.

use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path};

/// Suffix the kernel appends to the link target of an unlinked file.
pub const DELETED_MARKER: &str = " (deleted)";

/// Check whether `path` contains a `..` component.
pub fn has_parent_component(path: impl AsRef<Path>) -> bool {
    path.as_ref()
        .components()
        .any(|c| matches!(c, Component::ParentDir))
}

/// Check if a path lies below a directory, comparing components only.
///
/// Returns false for any path containing `..`, so a prefix match can never
/// be satisfied by climbing back out of the directory.
///
/// # Example
/// ```ignore
/// assert!(is_under("/system/framework/core.jar", "/system/framework"));
/// assert!(!is_under("/system/framework/../bin/sh", "/system/framework"));
/// ```
pub fn is_under(path: impl AsRef<Path>, dir: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    let dir = dir.as_ref();

    if has_parent_component(path) || dir.as_os_str().is_empty() {
        return false;
    }
    path != dir && path.starts_with(dir)
}

/// Byte-wise suffix test on the full path.
///
/// Suffixes like `.apk@idmap` are not extensions in the `Path::extension`
/// sense, so this compares raw bytes.
pub fn ends_with(path: impl AsRef<Path>, suffix: &str) -> bool {
    !suffix.is_empty() && path.as_ref().as_os_str().as_bytes().ends_with(suffix.as_bytes())
}

/// Whether a resolved descriptor path names a file that was unlinked after
/// it was opened.
pub fn is_deleted(path: impl AsRef<Path>) -> bool {
    ends_with(path, DELETED_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_under_matches_components() {
        assert!(is_under("/system/framework/core.jar", "/system/framework"));
        assert!(is_under("/system/framework/core.jar", "/system/framework/"));
        assert!(is_under("/system/framework/arm/boot.jar", "/system/framework"));
        assert!(!is_under("/system/frameworks/core.jar", "/system/framework"));
        assert!(!is_under("/system/framework", "/system/framework"));
    }

    #[test]
    fn test_is_under_rejects_traversal() {
        assert!(!is_under(
            "/system/framework/../../data/evil.jar",
            "/system/framework"
        ));
        assert!(has_parent_component("/a/../b"));
        assert!(!has_parent_component("/a/..b/c"));
    }

    #[test]
    fn test_is_under_empty_dir_never_matches() {
        assert!(!is_under("/anything", ""));
    }

    #[test]
    fn test_ends_with_raw_suffix() {
        assert!(ends_with(
            "/data/resource-cache/vendor@overlay@framework-res.apk@idmap",
            ".apk@idmap"
        ));
        assert!(!ends_with("/vendor/overlay/res.apk", ".jar"));
        assert!(!ends_with("/vendor/overlay/res.apk", ""));
    }

    #[test]
    fn test_deleted_marker() {
        assert!(is_deleted("/tmp/scratch (deleted)"));
        assert!(!is_deleted("/tmp/scratch"));
    }
}
