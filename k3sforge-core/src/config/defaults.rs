//! Default configuration values for k3sforge
//!
//! This module centralizes all default values to make them easy to find and modify.

use std::time::Duration;

// SSH defaults
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_REACHABILITY_ATTEMPTS: u32 = 10;
pub const DEFAULT_REACHABILITY_BACKOFF_SECS: u64 = 5;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

// Remote layout defaults
pub const DEFAULT_BIN_DIR: &str = crate::paths::DEFAULT_BIN_DIR;

// Diagnostics defaults
pub const DEFAULT_JOURNAL_LINES: u32 = 200;

// Logging defaults
pub const DEFAULT_LOG_LEVEL: &str = "info";

pub const fn duration_secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}
