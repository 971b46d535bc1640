// src/utils/config.rs
//! Worker and location configuration
//!
//! Settings are layered from an optional configuration file (format picked
//! by extension) and `LUA_POOL_*` environment variables, e.g.
//! `LUA_POOL_WORKERS=4` or `LUA_POOL_LOCATIONS__API__MEMORY_MAX=1048576`.

use crate::utils::errors::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "LUA_POOL";

/// Name of the location created when none is configured
pub const DEFAULT_LOCATION: &str = "default";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Per-location pool limits. Zero disables a limit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Memory quota per state in bytes
    pub memory_max: u64,

    /// Idle time before an unused state is closed (milliseconds)
    pub idle_timeout_ms: u64,

    /// Absolute lifetime of a state (milliseconds)
    pub max_lifetime_ms: u64,

    /// Requests served before a state is closed
    pub max_requests: u64,

    /// Memory use in bytes above which a full collection runs on release
    pub gc_threshold: u64,

    /// Capture error messages for the host
    pub diagnostic: bool,

    /// Lua search path; a leading `+` appends to the default
    pub path: String,

    /// Lua C search path; a leading `+` appends to the default
    pub cpath: String,
}

/// Process-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Number of worker threads
    pub workers: usize,

    /// Aggregate usage across workers in a shared monitor
    pub monitor: bool,

    pub log_format: LogFormat,

    /// Prometheus listener address, e.g. "127.0.0.1:9100"
    pub metrics_addr: Option<String>,

    /// Pools by location name
    pub locations: BTreeMap<String, LocationConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let mut locations = BTreeMap::new();
        locations.insert(DEFAULT_LOCATION.to_string(), LocationConfig::default());

        Self {
            workers,
            monitor: true,
            log_format: LogFormat::Plain,
            metrics_addr: None,
            locations,
        }
    }
}

impl Settings {
    /// Load and validate settings from an optional file plus environment
    /// overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = Self::read(path)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read settings without validating them
    ///
    /// Configured locations are merged over the default one, which is
    /// always present.
    pub fn read(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let mut settings: Settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings
            .locations
            .entry(DEFAULT_LOCATION.to_string())
            .or_default();
        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PoolError::ConfigError("workers cannot be 0".to_string()));
        }

        if self.locations.is_empty() {
            return Err(PoolError::ConfigError(
                "at least one location must be configured".to_string(),
            ));
        }

        for (name, location) in &self.locations {
            if location.memory_max > 0 && location.gc_threshold >= location.memory_max {
                warn!(
                    "location {}: gc_threshold {} is not below memory_max {}, collection will not run before the quota fails",
                    name, location.gc_threshold, location.memory_max
                );
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
    fn test_default_settings() {
        let settings = Settings::default();
        assert!(settings.workers >= 1);
        assert!(settings.monitor);
        assert_eq!(settings.log_format, LogFormat::Plain);
        assert!(settings.locations.contains_key(DEFAULT_LOCATION));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
workers = 2
monitor = false
log_format = "json"

[locations.api]
memory_max = 1048576
idle_timeout_ms = 5000
max_requests = 100
diagnostic = true
path = "+/srv/lua/?.lua"
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.workers, 2);
        assert!(!settings.monitor);
        assert_eq!(settings.log_format, LogFormat::Json);

        let api = &settings.locations["api"];
        assert_eq!(api.memory_max, 1_048_576);
        assert_eq!(api.idle_timeout_ms, 5000);
        assert_eq!(api.max_lifetime_ms, 0);
        assert_eq!(api.max_requests, 100);
        assert!(api.diagnostic);
        assert_eq!(api.path, "+/srv/lua/?.lua");
        assert!(api.cpath.is_empty());

        // the default location survives alongside configured ones
        assert!(settings.locations.contains_key(DEFAULT_LOCATION));
        assert_eq!(settings.locations.len(), 2);
    }

    #[test]
    fn test_configured_default_location_is_kept() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[locations.default]\nmax_requests = 7").unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.locations.len(), 1);
        assert_eq!(settings.locations[DEFAULT_LOCATION].max_requests, 7);
    }

    #[test]
    fn test_read_defers_validation() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "workers = 0").unwrap();

        let settings = Settings::read(Some(file.path())).unwrap();
        assert_eq!(settings.workers, 0);
        assert!(settings.validate().is_err());
        assert!(matches!(
            Settings::load(Some(file.path())),
            Err(PoolError::ConfigError(_))
        ));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = Settings::load(Some(Path::new("/nonexistent/lua-pool.toml")));
        assert!(matches!(result, Err(PoolError::ConfigError(_))));
    }

    #[test]
    fn test_validation() {
        let invalid_workers = Settings {
            workers: 0,
            ..Default::default()
        };
        assert!(invalid_workers.validate().is_err());

        let no_locations = Settings {
            locations: BTreeMap::new(),
            ..Default::default()
        };
        assert!(no_locations.validate().is_err());

        let mut odd_threshold = Settings::default();
        odd_threshold.locations.insert(
            "heavy".to_string(),
            LocationConfig {
                memory_max: 1024,
                gc_threshold: 4096,
                ..Default::default()
            },
        );
        // only warned about
        assert!(odd_threshold.validate().is_ok());
    }
}
