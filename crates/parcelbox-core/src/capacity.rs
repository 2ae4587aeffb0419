//! Parcel box fill level.
//!
//! The box's ultrasonic sensor reports how high the stack of parcels is. The latest
//! reading is kept in one document and every change is broadcast to subscribers. The
//! derived [`CapacityStatus`] is a pure function of height and max height.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::config::CapacityConfig;
use crate::error::{Error, Result};
use crate::storage::Storage;

/// Document holding the latest reading, relative to the data directory.
pub const CAPACITY_DOCUMENT: &str = "capacity/box_sensor.json";

const UPDATE_CHANNEL_CAPACITY: usize = 16;

/// Fill level bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum CapacityLevel {
    /// Below 30%.
    #[serde(rename = "Kosong")]
    Empty,
    /// 30% up to 70%.
    #[serde(rename = "Terisi Sebagian")]
    PartlyFilled,
    /// 70% up to 90%.
    #[serde(rename = "Hampir Penuh")]
    AlmostFull,
    /// 90% and above.
    #[serde(rename = "Penuh")]
    Full,
}

impl CapacityLevel {
    /// Bucket for a percentage in `0..=100`.
    #[must_use]
    pub fn from_percentage(percentage: f64) -> Self {
        if percentage >= 90.0 {
            Self::Full
        } else if percentage >= 70.0 {
            Self::AlmostFull
        } else if percentage >= 30.0 {
            Self::PartlyFilled
        } else {
            Self::Empty
        }
    }

    /// Label shown to users.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Empty => "Kosong",
            Self::PartlyFilled => "Terisi Sebagian",
            Self::AlmostFull => "Hampir Penuh",
            Self::Full => "Penuh",
        }
    }

    /// Indicator colour as a hex code.
    #[must_use]
    pub const fn color(self) -> &'static str {
        match self {
            Self::Empty => "#22C55E",
            Self::PartlyFilled => "#3B82F6",
            Self::AlmostFull => "#F59E0B",
            Self::Full => "#EF4444",
        }
    }

    /// Message shown alongside the label.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Empty => "Box kosong, siap menerima paket",
            Self::PartlyFilled => "Box tersedia untuk paket",
            Self::AlmostFull => "Box mulai terisi, perhatikan kapasitas",
            Self::Full => "Box hampir penuh, segera kosongkan",
        }
    }
}

impl fmt::Display for CapacityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Derived fill status.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[schema(example = json!({
    "percentage": 73.33,
    "status": "Hampir Penuh",
    "message": "Box mulai terisi, perhatikan kapasitas",
    "color": "#F59E0B"
}))]
pub struct CapacityStatus {
    /// Fill percentage clamped to `0..=100`.
    pub percentage: f64,
    /// Bucket label.
    pub status: CapacityLevel,
    /// User-facing message.
    pub message: String,
    /// Hex colour.
    pub color: String,
}

/// Fill status for `height` cm of parcels in a box `max_height` cm tall.
///
/// A non-positive `max_height` yields 0%.
#[must_use]
pub fn calculate_capacity_status(height: f64, max_height: f64) -> CapacityStatus {
    let percentage = if max_height > 0.0 {
        (height / max_height * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    };
    let level = CapacityLevel::from_percentage(percentage);

    CapacityStatus {
        percentage,
        status: level,
        message: level.message().to_string(),
        color: level.color().to_string(),
    }
}

/// Latest sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CapacityReading {
    /// Measured parcel height in cm.
    pub height: f64,
    /// Usable box height in cm.
    pub max_height: f64,
    /// Reporting device.
    pub device_id: String,
    /// When the reading was written.
    pub last_updated: DateTime<Utc>,
}

impl CapacityReading {
    /// Empty box with the configured defaults.
    #[must_use]
    pub fn initial(defaults: &CapacityConfig) -> Self {
        Self {
            height: 0.0,
            max_height: defaults.default_max_height,
            device_id: defaults.default_device_id.clone(),
            last_updated: Utc::now(),
        }
    }

    /// Derived fill status of this reading.
    #[must_use]
    pub fn status(&self) -> CapacityStatus {
        calculate_capacity_status(self.height, self.max_height)
    }
}

/// Owner of the capacity document.
#[derive(Debug)]
pub struct CapacityMonitor {
    defaults: CapacityConfig,
    storage: Option<Storage>,
    reading: RwLock<Option<CapacityReading>>,
    updates: broadcast::Sender<CapacityReading>,
}

impl CapacityMonitor {
    /// Monitor without persistence.
    #[must_use]
    pub fn in_memory(defaults: CapacityConfig) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            defaults,
            storage: None,
            reading: RwLock::new(None),
            updates,
        }
    }

    /// Monitor persisted under `storage`, loading the stored reading if any.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing document cannot be read.
    pub fn open(defaults: CapacityConfig, storage: Storage) -> Result<Self> {
        let reading: Option<CapacityReading> = storage.load_json(CAPACITY_DOCUMENT)?;
        let mut monitor = Self::in_memory(defaults);
        monitor.reading = RwLock::new(reading);
        monitor.storage = Some(storage);
        Ok(monitor)
    }

    /// Current reading, creating and storing the default one if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the default reading cannot be persisted.
    pub async fn get(&self) -> Result<CapacityReading> {
        if let Some(reading) = self.reading.read().await.clone() {
            return Ok(reading);
        }

        let mut slot = self.reading.write().await;
        if let Some(reading) = slot.clone() {
            return Ok(reading);
        }
        let reading = CapacityReading::initial(&self.defaults);
        self.persist(&reading)?;
        *slot = Some(reading.clone());
        debug!(device_id = %reading.device_id, "default capacity reading created");
        Ok(reading)
    }

    /// Record a new parcel height reported by `device_id`.
    ///
    /// # Errors
    ///
    /// `InvalidHeight` for a negative or non-finite height, or a persistence error.
    pub async fn set_height(&self, height: f64, device_id: Option<&str>) -> Result<CapacityReading> {
        if !height.is_finite() || height < 0.0 {
            return Err(Error::InvalidHeight {
                value: height,
                reason: "height must be a finite, non-negative number",
            });
        }
        let reading = self
            .mutate(device_id, |reading| reading.height = height)
            .await?;
        let status = reading.status();
        info!(
            height,
            percentage = status.percentage,
            status = %status.status,
            "capacity height updated"
        );
        Ok(reading)
    }

    /// Recalibrate the usable box height.
    ///
    /// # Errors
    ///
    /// `InvalidHeight` for a non-positive or non-finite value, or a persistence error.
    pub async fn set_max_height(
        &self,
        max_height: f64,
        device_id: Option<&str>,
    ) -> Result<CapacityReading> {
        if !max_height.is_finite() || max_height <= 0.0 {
            return Err(Error::InvalidHeight {
                value: max_height,
                reason: "max height must be a finite, positive number",
            });
        }
        let reading = self
            .mutate(device_id, |reading| reading.max_height = max_height)
            .await?;
        info!(max_height, "capacity max height updated");
        Ok(reading)
    }

    /// Subscribe to every stored reading.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CapacityReading> {
        self.updates.subscribe()
    }

    async fn mutate<F>(&self, device_id: Option<&str>, f: F) -> Result<CapacityReading>
    where
        F: FnOnce(&mut CapacityReading),
    {
        let mut slot = self.reading.write().await;
        let mut reading = slot
            .clone()
            .unwrap_or_else(|| CapacityReading::initial(&self.defaults));
        f(&mut reading);
        reading.device_id = device_id
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map_or_else(|| self.defaults.default_device_id.clone(), str::to_string);
        reading.last_updated = Utc::now();

        self.persist(&reading)?;
        *slot = Some(reading.clone());
        // No subscribers is fine.
        let _ = self.updates.send(reading.clone());
        Ok(reading)
    }

    fn persist(&self, reading: &CapacityReading) -> Result<()> {
        match &self.storage {
            Some(storage) => storage.save_json(CAPACITY_DOCUMENT, reading),
            None => Ok(()),
        }
    }
}
