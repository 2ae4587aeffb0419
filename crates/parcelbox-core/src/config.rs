//! Application configuration management.
//!
//! Handles loading, saving, and validating parcelbox configuration including:
//! - Pairing session timeout and credential format
//! - Capacity sensor defaults (box height, device id)
//! - HTTP server bind address and logging mode
//! - Data directory and timezone
//!
//! Configuration is layered with the `config` crate: built-in defaults, then an
//! optional TOML file, then `PARCELBOX__SECTION__KEY` environment variables.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "PARCELBOX_CONFIG";

/// Prefix for environment overrides, e.g. `PARCELBOX__PAIRING__TIMEOUT_SECS=45`.
pub const ENV_PREFIX: &str = "PARCELBOX";

/// Default credential format written by the box firmware: 8 upper-case hex characters.
pub const DEFAULT_CREDENTIAL_PATTERN: &str = "^[0-9A-F]{8}$";

/// Errors raised while loading, saving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The configuration file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    ReadError {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be written.
    #[error("failed to write {}: {source}", path.display())]
    WriteError {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The layered sources could not be merged or deserialized.
    #[error("failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),

    /// The configuration could not be serialized to TOML.
    #[error("failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A single field failed validation.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path, e.g. `pairing.timeout_secs`.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields failed validation.
    #[error("{} validation errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),

    /// No platform config directory could be determined.
    #[error("cannot determine config directory")]
    NoConfigDir,
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pairing handshake settings.
    pub pairing: PairingConfig,
    /// Capacity sensor settings.
    pub capacity: CapacityConfig,
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Persistence settings.
    pub storage: StorageConfig,
    /// Miscellaneous system settings.
    pub system: SystemConfig,
}

/// Pairing handshake settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// Seconds a session may stay `waiting` before it expires.
    pub timeout_secs: u64,

    /// Regular expression an upper-cased credential must match.
    pub credential_pattern: String,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            credential_pattern: DEFAULT_CREDENTIAL_PATTERN.to_string(),
        }
    }
}

impl PairingConfig {
    /// Session timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Compile the credential pattern.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the pattern is not a valid regex.
    pub fn credential_regex(&self) -> ConfigResult<Regex> {
        Regex::new(&self.credential_pattern).map_err(|e| ConfigError::ValidationError {
            field: "pairing.credential_pattern",
            message: e.to_string(),
        })
    }
}

/// Capacity sensor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    /// Box height in centimeters used when no reading exists yet.
    pub default_max_height: f64,

    /// Sensor device id used when no reading exists yet.
    pub default_device_id: String,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            default_max_height: 30.0,
            default_device_id: "ESP32_001".to_string(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub bind_address: String,

    /// Use production logging (JSON files + journald-friendly stdout).
    pub production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            production: false,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for JSON data files. Platform default when unset.
    pub data_dir: Option<PathBuf>,
}

/// Miscellaneous system settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// IANA timezone used when rendering local timestamps.
    pub timezone: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default location plus environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the sources cannot be merged or the result is invalid.
    pub fn load() -> ConfigResult<Self> {
        let path = Self::default_path()?;
        Self::load_or_default(path)
    }

    /// Load configuration from `path` (if it exists) plus environment overrides.
    ///
    /// A missing file is not an error; defaults apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or the result is invalid.
    pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`Config::load_or_default`], reading environment overrides from `env`
    /// instead of the process environment when given.
    ///
    /// # Errors
    ///
    /// Returns an error if the sources cannot be merged or the result is invalid.
    pub fn load_with_env(
        path: impl AsRef<Path>,
        env: Option<HashMap<String, String>>,
    ) -> ConfigResult<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Save configuration to `path` as pretty TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Check every field, collecting all problems.
    ///
    /// # Errors
    ///
    /// Returns the single error, or [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if !(1..=600).contains(&self.pairing.timeout_secs) {
            errors.push(ConfigError::ValidationError {
                field: "pairing.timeout_secs",
                message: format!("must be between 1 and 600 (got {})", self.pairing.timeout_secs),
            });
        }
        if let Err(e) = self.pairing.credential_regex() {
            errors.push(e);
        }
        if !self.capacity.default_max_height.is_finite() || self.capacity.default_max_height <= 0.0
        {
            errors.push(ConfigError::ValidationError {
                field: "capacity.default_max_height",
                message: "must be a positive number".to_string(),
            });
        }
        if self.capacity.default_device_id.trim().is_empty() {
            errors.push(ConfigError::ValidationError {
                field: "capacity.default_device_id",
                message: "cannot be empty".to_string(),
            });
        }
        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ConfigError::ValidationError {
                field: "server.bind_address",
                message: format!("'{}' is not a socket address", self.server.bind_address),
            });
        }
        if !is_valid_timezone(&self.system.timezone) {
            errors.push(ConfigError::ValidationError {
                field: "system.timezone",
                message: format!("'{}' is not an IANA timezone", self.system.timezone),
            });
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Get the configuration file path.
    ///
    /// # Errors
    ///
    /// Returns an error if no config directory can be determined.
    pub fn default_path() -> ConfigResult<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }
        // On the box: /etc/parcelbox/config.toml
        // For development: ~/.config/parcelbox/config.toml
        #[cfg(target_os = "linux")]
        {
            Ok(PathBuf::from("/etc/parcelbox/config.toml"))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let dirs = directories::ProjectDirs::from("", "", "parcelbox")
                .ok_or(ConfigError::NoConfigDir)?;
            Ok(dirs.config_dir().join("config.toml"))
        }
    }
}

/// Returns `true` if `tz` names an IANA timezone known to chrono-tz.
#[must_use]
pub fn is_valid_timezone(tz: &str) -> bool {
    tz.parse::<chrono_tz::Tz>().is_ok()
}
