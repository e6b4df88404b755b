//! # forkguard-config
//!
//! Configuration for the forkguard descriptor audit.
//!
//! Loads configuration from:
//! 1. `/etc/forkguard/config.toml` (system)
//! 2. the file named by `FORKGUARD_CONFIG` (overrides system)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod path;
pub mod testing;
pub mod whitelist;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

pub use whitelist::{ArchiveRule, OverlayRule, WhitelistConfig};

/// System-wide config file location
pub const SYSTEM_CONFIG_PATH: &str = "/etc/forkguard/config.toml";

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid descriptor list {value:?}: {reason}")]
    InvalidDescriptors { value: String, reason: String },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub whitelist: WhitelistConfig,
    pub audit: AuditConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. System config
        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            debug!("Loading system config from {:?}", system_path);
            config = Self::from_file(system_path)?;
        }

        // 2. Explicit override file
        if let Ok(path) = std::env::var("FORKGUARD_CONFIG") {
            let path = PathBuf::from(path);
            debug!("Loading override config from {:?}", path);
            config.merge(ConfigOverride::from_file(&path)?);
        }

        // 3. Environment variable overrides
        config.apply_env_overrides()?;

        Ok(config)
    }

    /// Parse a single config file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Apply an override on top of this config. Only settings the override
    /// actually carries replace ours; a rule section it sets replaces the
    /// whole rule, so `dirs = []` disables that rule family.
    pub fn merge(&mut self, other: ConfigOverride) {
        let ConfigOverride { whitelist, audit } = other;
        if let Some(paths) = whitelist.paths {
            self.whitelist.paths = paths;
        }
        if let Some(archives) = whitelist.archives {
            self.whitelist.archives = archives;
        }
        if let Some(overlays) = whitelist.overlays {
            self.whitelist.overlays = overlays;
        }
        if let Some(fds) = audit.preserved_descriptors {
            self.audit.preserved_descriptors = fds;
        }
        if let Some(dir) = audit.proc_fd_dir {
            self.audit.proc_fd_dir = dir;
        }
        if let Some(placeholder) = audit.placeholder {
            self.audit.placeholder = placeholder;
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(fds) = std::env::var("FORKGUARD_PRESERVE_FDS") {
            self.audit.preserved_descriptors = parse_descriptor_list(&fds)?;
        }
        if let Ok(dir) = std::env::var("FORKGUARD_PROC_FD_DIR") {
            self.audit.proc_fd_dir = PathBuf::from(dir);
        }
        if let Ok(placeholder) = std::env::var("FORKGUARD_PLACEHOLDER") {
            self.audit.placeholder = PathBuf::from(placeholder);
        }
        Ok(())
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Settings present in an override file. Absent keys stay `None` and leave
/// the base config untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConfigOverride {
    pub whitelist: WhitelistOverride,
    pub audit: AuditOverride,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WhitelistOverride {
    pub paths: Option<Vec<PathBuf>>,
    pub archives: Option<ArchiveRule>,
    pub overlays: Option<OverlayRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AuditOverride {
    pub proc_fd_dir: Option<PathBuf>,
    pub placeholder: Option<PathBuf>,
    pub preserved_descriptors: Option<Vec<RawFd>>,
}

impl ConfigOverride {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

/// Audit mechanics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Directory listing the process's open descriptors
    pub proc_fd_dir: PathBuf,
    /// Inert file installed over detached sockets
    pub placeholder: PathBuf,
    /// Descriptors designated out-of-band (stdio, control channel).
    /// Audited by restat, never reopened, detached or closed.
    pub preserved_descriptors: Vec<RawFd>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            proc_fd_dir: PathBuf::from("/proc/self/fd"),
            placeholder: PathBuf::from("/dev/null"),
            preserved_descriptors: Vec::new(),
        }
    }
}

/// Parse `"0, 1,2"` into descriptor numbers.
pub fn parse_descriptor_list(value: &str) -> Result<Vec<RawFd>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let fd: RawFd = s.parse().map_err(|e| ConfigError::InvalidDescriptors {
                value: value.to_string(),
                reason: format!("{s:?}: {e}"),
            })?;
            if fd < 0 {
                return Err(ConfigError::InvalidDescriptors {
                    value: value.to_string(),
                    reason: format!("negative descriptor {fd}"),
                });
            }
            Ok(fd)
        })
        .collect()
}
