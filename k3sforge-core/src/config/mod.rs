//! Engine configuration with TOML support
//!
//! Settings that govern how the engine talks to nodes (SSH readiness policy,
//! default binary directory, diagnostics depth, log level). Loaded from a TOML
//! file, overridable through `K3SFORGE_*` environment variables.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{K3sError, K3sResult};

pub mod defaults;

pub use defaults::*;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// SSH transport settings
    pub ssh: SshConfig,

    /// Remote layout settings
    pub paths: PathsConfig,

    /// Diagnostics gathered when a unit is not active
    pub diagnostics: DiagnosticsConfig,

    /// Logging settings consumed by the CLI
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SshConfig {
    /// Port used when a node does not specify one
    pub port: u16,

    /// Connection attempts made by the readiness probe
    pub reachability_attempts: u32,

    /// Fixed sleep between readiness attempts
    #[serde(with = "humantime_serde")]
    pub reachability_backoff: Duration,

    /// Upper bound for a single dial + handshake
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    pub bin_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Journal lines fetched for an inactive unit
    pub journal_lines: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SSH_PORT,
            reachability_attempts: DEFAULT_REACHABILITY_ATTEMPTS,
            reachability_backoff: duration_secs(DEFAULT_REACHABILITY_BACKOFF_SECS),
            connect_timeout: duration_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            bin_dir: DEFAULT_BIN_DIR.to_string(),
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            journal_lines: DEFAULT_JOURNAL_LINES,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ssh: SshConfig::default(),
            paths: PathsConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> K3sResult<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .map_err(|e| K3sError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let mut config = Self::from_toml(&contents)?;
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(contents: &str) -> K3sResult<Self> {
        toml::from_str(contents)
            .map_err(|e| K3sError::ConfigError(format!("Failed to parse TOML: {}", e)))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(attempts) = std::env::var("K3SFORGE_SSH_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse() {
                self.ssh.reachability_attempts = attempts;
            }
        }
        if let Ok(backoff) = std::env::var("K3SFORGE_SSH_BACKOFF") {
            if let Ok(backoff) = humantime_serde::re::humantime::parse_duration(&backoff) {
                self.ssh.reachability_backoff = backoff;
            }
        }
        if let Ok(dir) = std::env::var("K3SFORGE_BIN_DIR") {
            self.paths.bin_dir = dir;
        }
        if let Ok(level) = std::env::var("K3SFORGE_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> K3sResult<()> {
        if self.ssh.reachability_attempts == 0 {
            return Err(K3sError::ConfigError(
                "ssh.reachability_attempts must be at least 1".to_string(),
            ));
        }

        if !self.paths.bin_dir.starts_with('/') {
            return Err(K3sError::ConfigError(format!(
                "paths.bin_dir must be absolute, got '{}'",
                self.paths.bin_dir
            )));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(K3sError::ConfigError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.ssh.reachability_attempts, 10);
        assert_eq!(config.ssh.reachability_backoff, Duration::from_secs(5));
        assert_eq!(config.paths.bin_dir, "/usr/local/bin");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[ssh]
reachability_attempts = 3
reachability_backoff = "250ms"

[paths]
bin_dir = "/opt/bin"
"#
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.ssh.reachability_attempts, 3);
        assert_eq!(config.ssh.reachability_backoff, Duration::from_millis(250));
        assert_eq!(config.ssh.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.paths.bin_dir, "/opt/bin");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = EngineConfig::from_toml("[ssh]\nreachability_attempts = 0\n").unwrap();
        assert!(config.validate().is_err());

        let config = EngineConfig::from_toml("[paths]\nbin_dir = \"bin\"\n").unwrap();
        assert!(config.validate().is_err());

        let config = EngineConfig::from_toml("[logging]\nlevel = \"loud\"\n").unwrap();
        assert!(config.validate().is_err());
    }
}
