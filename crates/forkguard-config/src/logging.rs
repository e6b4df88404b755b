//! Structured logging utilities for forkguard components.
//!
//! Every event carries a `component` field naming the audit phase that
//! emitted it, so fork-preparation failures can be filtered per phase.
//!
//! # Usage
//!
//! ```ignore
//! use forkguard_config::log_repair_info;
//!
//! log_repair_info!("Descriptor reopened", fd = 7);
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const SNAPSHOT: &'static str = "SNAPSHOT";
    pub const RESTAT: &'static str = "RESTAT";
    pub const REPAIR: &'static str = "REPAIR";
    pub const POLICY: &'static str = "POLICY";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

// === SNAPSHOT logging macros ===

#[macro_export]
macro_rules! log_snapshot_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = $crate::logging::Component::SNAPSHOT, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_snapshot_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = $crate::logging::Component::SNAPSHOT, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_snapshot_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = $crate::logging::Component::SNAPSHOT, $($key = $value,)* $msg)
    };
}

// === RESTAT logging macros ===

#[macro_export]
macro_rules! log_restat_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = $crate::logging::Component::RESTAT, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_restat_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = $crate::logging::Component::RESTAT, $($key = $value,)* $msg)
    };
}

// === REPAIR logging macros ===

#[macro_export]
macro_rules! log_repair_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = $crate::logging::Component::REPAIR, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_repair_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = $crate::logging::Component::REPAIR, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_repair_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = $crate::logging::Component::REPAIR, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_repair_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = $crate::logging::Component::REPAIR, $($key = $value,)* $msg)
    };
}

// === POLICY logging macros ===

#[macro_export]
macro_rules! log_policy_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = $crate::logging::Component::POLICY, $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at server startup, never from library code.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
