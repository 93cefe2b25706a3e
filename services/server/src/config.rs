//! Server configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/dev-tracker/server.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `server.bind`
//! - `registry.sqlite_path`
//! - `tracker.config_path`

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub schema_version: u32,
    /// Listen address, e.g. `0.0.0.0:8765`.
    pub bind: String,
    pub registry: RegistryConfig,
    pub stats_interval: Duration,
    /// Path of the embedded tracker's own TOML config.
    pub tracker_config_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub sqlite_path: PathBuf,
    pub log_retention_days: u32,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    server: Option<RawServerSection>,
    registry: Option<RawRegistrySection>,
    stats: Option<RawStatsSection>,
    tracker: Option<RawTrackerSection>,
}

#[derive(Debug, Deserialize)]
struct RawServerSection {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRegistrySection {
    sqlite_path: Option<PathBuf>,
    log_retention_days: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawStatsSection {
    interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawTrackerSection {
    config_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load server config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<ServerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load server config from the default path `/etc/dev-tracker/server.toml`.
pub fn load_config() -> Result<ServerConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/dev-tracker/server.toml"))
}

/// Load server config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<ServerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let bind = raw
        .server
        .and_then(|s| s.bind)
        .ok_or_else(|| ConfigError::MissingField("server.bind".to_owned()))?;

    let raw_registry = raw
        .registry
        .ok_or_else(|| ConfigError::MissingField("registry".to_owned()))?;
    let registry = RegistryConfig {
        sqlite_path: raw_registry
            .sqlite_path
            .ok_or_else(|| ConfigError::MissingField("registry.sqlite_path".to_owned()))?,
        log_retention_days: raw_registry.log_retention_days.unwrap_or(30),
    };

    let stats_interval = Duration::from_secs(
        raw.stats.and_then(|s| s.interval_secs).unwrap_or(300),
    );

    let tracker_config_path = raw
        .tracker
        .and_then(|t| t.config_path)
        .ok_or_else(|| ConfigError::MissingField("tracker.config_path".to_owned()))?;

    Ok(ServerConfig {
        schema_version,
        bind,
        registry,
        stats_interval,
        tracker_config_path,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        schema_version = 1

        [server]
        bind = "0.0.0.0:8765"

        [registry]
        sqlite_path = "/var/lib/dev-tracker/registry.db"

        [tracker]
        config_path = "/etc/dev-tracker/tracker.toml"
    "#;

    #[test]
    fn full_config_loads_with_defaults_applied() {
        let cfg = load_config_from_str(FULL).expect("config loads");
        assert_eq!(cfg.bind, "0.0.0.0:8765");
        assert_eq!(cfg.registry.log_retention_days, 30);
        assert_eq!(cfg.stats_interval, Duration::from_secs(300));
    }

    #[test]
    fn missing_tracker_section_is_reported() {
        let toml = FULL.replace("[tracker]", "[other]");
        let err = load_config_from_str(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "tracker.config_path"));
    }
}
