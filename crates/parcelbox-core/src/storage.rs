//! Persistent storage for parcelbox data.
//!
//! Every persisted document is a pretty-printed JSON file under the data directory:
//!
//! ```text
//! <data_dir>/
//! ├── rfid_pairing/current_session.json   rendezvous record
//! ├── capacity/box_sensor.json            latest sensor reading
//! └── users.json                          profiles
//! ```

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Storage backend for parcelbox data.
#[derive(Debug, Clone)]
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    /// Create a new storage instance.
    ///
    /// # Arguments
    ///
    /// * `data_dir` - Directory to store data files
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Storage at the configured directory, or the platform default.
    ///
    /// # Errors
    ///
    /// Returns an error if no default data directory can be determined.
    pub fn from_config(config: &crate::config::StorageConfig) -> Result<Self> {
        match &config.data_dir {
            Some(dir) => Ok(Self::new(dir.clone())),
            None => Ok(Self::new(default_data_dir()?)),
        }
    }

    /// The root data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Absolute path of a document relative to the data directory.
    #[must_use]
    pub fn path_of(&self, relative: &str) -> PathBuf {
        self.data_dir.join(relative)
    }

    /// Load a JSON document, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_json<T: DeserializeOwned>(&self, relative: &str) -> Result<Option<T>> {
        let path = self.path_of(relative);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let value = serde_json::from_str(&content).map_err(|e| {
            Error::PersistenceError(format!("Failed to parse {}: {e}", path.display()))
        })?;
        Ok(Some(value))
    }

    /// Save a JSON document, creating parent directories as needed.
    ///
    /// The document is written to a sibling temp file first and renamed into place.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_json<T: Serialize>(&self, relative: &str, value: &T) -> Result<()> {
        let path = self.path_of(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Get the default storage location.
///
/// On the box: `/var/lib/parcelbox/`
/// For development: `~/.local/share/parcelbox/`
///
/// # Errors
///
/// Returns an error if the platform data directory cannot be determined.
pub fn default_data_dir() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/var/lib/parcelbox"))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let dirs = directories::ProjectDirs::from("", "", "parcelbox").ok_or_else(|| {
            Error::PersistenceError("Cannot determine data directory".into())
        })?;
        Ok(dirs.data_dir().to_path_buf())
    }
}
