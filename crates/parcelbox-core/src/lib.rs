//! # parcelbox-core
//!
//! Core logic for the parcelbox smart parcel box.
//!
//! This crate provides:
//! - The RFID pairing handshake between the mobile client and the box
//! - Binding issued RFID codes to user profiles
//! - Fill-level monitoring from the box's height sensor
//! - Configuration and JSON persistence
//!
//! ## Architecture
//!
//! - [`pairing`] - Single-writer coordinator for the rendezvous slot, with expiry timers
//! - [`finalizer`] - Background task binding received codes to profiles
//! - [`store`] - Rendezvous record storage and change notification
//! - [`capacity`] - Sensor readings and derived fill status
//! - [`profiles`] - User and admin profiles with soft delete
//! - [`config`] - Configuration loading, saving, and validation
//! - [`storage`] - JSON document persistence under the data directory
//! - [`error`] - Unified error types for the crate

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod capacity;
pub mod config;
pub mod error;
pub mod finalizer;
pub mod pairing;
pub mod profiles;
pub mod storage;
pub mod store;

// Re-export primary types for convenience
pub use capacity::{
    calculate_capacity_status, CapacityLevel, CapacityMonitor, CapacityReading, CapacityStatus,
};
pub use crate::config::{
    is_valid_timezone, CapacityConfig, Config, ConfigError, ConfigResult, PairingConfig,
    ServerConfig, StorageConfig, SystemConfig,
};
pub use error::{Error, ParcelboxError, Result};
pub use finalizer::{Finalizer, FinalizerHandle, PairingOutcome};
pub use pairing::{CancelReason, PairingCoordinator, PairingSession, SessionEvents, SessionState};
pub use profiles::{JsonProfileStore, NewProfile, Profile, ProfileStore, ProfileUpdate, Role};
pub use storage::{default_data_dir, Storage};
pub use store::{
    FileSlotStore, MemorySlotStore, SlotPatch, SlotRecord, SlotStatus, SlotStore, StoreError,
};
