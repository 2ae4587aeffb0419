//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Instant;

use parcelbox_core::{
    CapacityMonitor, Config, FileSlotStore, Finalizer, FinalizerHandle, JsonProfileStore,
    MemorySlotStore, PairingCoordinator, ProfileStore, SlotStore, Storage,
};
use tokio::sync::RwLock;
use tracing::info;

/// Shared application state.
pub type SharedState = Arc<AppState>;

/// Everything the handlers need.
pub struct AppState {
    /// Loaded configuration.
    pub config: RwLock<Config>,
    /// Owner of the rendezvous slot.
    pub pairing: PairingCoordinator,
    /// Background task binding received codes.
    pub finalizer: FinalizerHandle,
    /// Box fill level.
    pub capacity: CapacityMonitor,
    /// User and admin profiles.
    pub profiles: Arc<dyn ProfileStore>,
    /// When the server started.
    pub started_at: Instant,
}

impl AppState {
    /// Build state persisted under the configured data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be determined or existing data cannot
    /// be read.
    pub async fn open(config: Config) -> anyhow::Result<SharedState> {
        let storage = Storage::from_config(&config.storage)?;
        info!(data_dir = %storage.data_dir().display(), "opening data directory");

        let slot: Arc<dyn SlotStore> = Arc::new(FileSlotStore::new(storage.clone()));
        let profiles: Arc<dyn ProfileStore> = Arc::new(JsonProfileStore::open(storage.clone())?);
        let capacity = CapacityMonitor::open(config.capacity.clone(), storage)?;

        Self::assemble(config, slot, profiles, capacity).await
    }

    /// Build state that keeps everything in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the pairing configuration is invalid.
    pub async fn in_memory(config: Config) -> anyhow::Result<SharedState> {
        let slot: Arc<dyn SlotStore> = MemorySlotStore::shared();
        let profiles: Arc<dyn ProfileStore> = Arc::new(JsonProfileStore::in_memory());
        let capacity = CapacityMonitor::in_memory(config.capacity.clone());

        Self::assemble(config, slot, profiles, capacity).await
    }

    async fn assemble(
        config: Config,
        slot: Arc<dyn SlotStore>,
        profiles: Arc<dyn ProfileStore>,
        capacity: CapacityMonitor,
    ) -> anyhow::Result<SharedState> {
        let pairing = PairingCoordinator::new(slot, &config.pairing).await?;
        let finalizer = Finalizer::new(pairing.clone(), profiles.clone()).spawn();

        Ok(Arc::new(Self {
            config: RwLock::new(config),
            pairing,
            finalizer,
            capacity,
            profiles,
            started_at: Instant::now(),
        }))
    }

    /// Seconds since the state was built.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
