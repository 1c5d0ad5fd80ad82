//! Configuration for the extension host.
//!
//! This module provides configuration management for the host,
//! including loading and saving configuration from files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crankshaft_capability::audit::{DEFAULT_BUFFER_CAPACITY, DEFAULT_MEMORY_WINDOW};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Unsupported config file format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the extension host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Directory scanned for extension manifests.
    pub extensions_dir: PathBuf,

    /// JSON Lines audit file. The audit log stays in memory when unset.
    pub audit_log_path: Option<PathBuf>,

    /// Audit records held while the audit file is unavailable.
    pub audit_buffer_capacity: usize,

    /// Recent audit records kept in memory; older queries read the file.
    pub audit_memory_window: usize,

    /// Bound on validating and initializing one extension.
    pub load_timeout_ms: u64,

    /// Default bound on one core service call.
    pub call_timeout_ms: u64,

    /// Bound on one extension's shutdown hook.
    pub shutdown_timeout_ms: u64,

    /// Log level for tracing.
    pub log_level: String,

    /// Whether to enable JSON formatting for logs.
    pub json_logs: bool,

    /// Platform name matched against manifest `platforms`.
    pub platform: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            extensions_dir: PathBuf::from("extensions"),
            audit_log_path: None,
            audit_buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            audit_memory_window: DEFAULT_MEMORY_WINDOW,
            load_timeout_ms: 5_000,
            call_timeout_ms: 5_000,
            shutdown_timeout_ms: 2_000,
            log_level: "info".to_string(),
            json_logs: false,
            platform: std::env::consts::OS.to_string(),
        }
    }
}

impl HostConfig {
    /// Reject values the host cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.audit_buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "audit_buffer_capacity must be at least 1".to_string(),
            ));
        }
        if self.audit_memory_window == 0 {
            return Err(ConfigError::Invalid(
                "audit_memory_window must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("load_timeout_ms", self.load_timeout_ms),
            ("call_timeout_ms", self.call_timeout_ms),
            ("shutdown_timeout_ms", self.shutdown_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }
        if self.platform.trim().is_empty() {
            return Err(ConfigError::Invalid("platform must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Load configuration from a file.
pub fn load_config(path: &Path) -> Result<HostConfig, ConfigError> {
    // Check file extension
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    // Read the file
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    // Parse the file
    let config: HostConfig = match ext {
        "toml" => toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse TOML config: {}", e)))?,
        "json" => serde_json::from_str(&content)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse JSON config: {}", e)))?,
        _ => return Err(ConfigError::UnsupportedFormat(ext.to_string())),
    };

    config.validate()?;
    Ok(config)
}

/// Save configuration to a file.
pub fn save_config(config: &HostConfig, path: &Path) -> Result<(), ConfigError> {
    // Check file extension
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    // Serialize the config
    let content = match ext {
        "toml" => toml::to_string_pretty(config)
            .map_err(|e| ConfigError::Parse(format!("Failed to serialize TOML config: {}", e)))?,
        "json" => serde_json::to_string_pretty(config)
            .map_err(|e| ConfigError::Parse(format!("Failed to serialize JSON config: {}", e)))?,
        _ => return Err(ConfigError::UnsupportedFormat(ext.to_string())),
    };

    // Write the file
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}
