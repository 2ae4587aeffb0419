//! The rendezvous record and the stores that hold it.
//!
//! The record is the only channel between the client and the box: the client writes a
//! `waiting` session, the device patches in the credential it wrote to the card, and
//! everyone watches the record through a subscription. Stores offer blind full and
//! partial writes only (no compare-and-swap); serialization of writers is the job of
//! [`PairingCoordinator`](crate::pairing::PairingCoordinator).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use utoipa::ToSchema;

use crate::storage::Storage;

/// Document holding the rendezvous record, relative to the data directory.
pub const SLOT_DOCUMENT: &str = "rfid_pairing/current_session.json";

const CHANNEL_CAPACITY: usize = 64;

/// Errors raised by a [`SlotStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot be reached right now.
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Why.
        message: String,
    },

    /// The persisted record could not be decoded.
    #[error("corrupt record at {}: {source}", path.display())]
    Corrupt {
        /// File that failed.
        path: PathBuf,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },

    /// Reading or writing the backing file failed.
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The `status` field of the rendezvous record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    /// Empty slot. Serialized as `""`.
    #[default]
    #[serde(rename = "")]
    Idle,
    /// A requester is waiting for the device to issue a credential.
    Waiting,
    /// The device has issued a credential.
    Received,
}

impl SlotStatus {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "",
            Self::Waiting => "waiting",
            Self::Received => "received",
        }
    }
}

/// The rendezvous record as it appears on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
#[schema(example = json!({
    "isActive": true,
    "userId": "uid-123",
    "startTime": "2025-01-15T03:30:00Z",
    "rfidCode": "",
    "status": "waiting",
    "cancelledTime": "",
    "receivedTime": "",
    "generation": 7
}))]
pub struct SlotRecord {
    /// True while `waiting` or `received`.
    pub is_active: bool,

    /// Requester; empty when idle.
    pub user_id: String,

    /// RFC 3339 start time; empty when idle.
    pub start_time: String,

    /// Issued credential; empty until the device submits one.
    pub rfid_code: String,

    /// Session status.
    pub status: SlotStatus,

    /// Audit: when the slot was last reset.
    pub cancelled_time: String,

    /// Audit: when the credential arrived.
    pub received_time: String,

    /// Session instance occupying the slot.
    pub generation: u64,
}

impl SlotRecord {
    /// A freshly started session.
    #[must_use]
    pub fn waiting(generation: u64, user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            is_active: true,
            user_id: user_id.to_string(),
            start_time: now.to_rfc3339(),
            rfid_code: String::new(),
            status: SlotStatus::Waiting,
            cancelled_time: String::new(),
            received_time: String::new(),
            generation,
        }
    }

    /// A reset slot. The generation is kept so stale timers still compare against it.
    #[must_use]
    pub fn idle(generation: u64, now: DateTime<Utc>) -> Self {
        Self {
            cancelled_time: now.to_rfc3339(),
            generation,
            ..Self::default()
        }
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, patch: &SlotPatch) {
        if let Some(rfid_code) = &patch.rfid_code {
            self.rfid_code.clone_from(rfid_code);
        }
        if let Some(status) = patch.status {
            self.status = status;
            self.is_active = status != SlotStatus::Idle;
        }
        if let Some(received_time) = &patch.received_time {
            self.received_time.clone_from(received_time);
        }
    }
}

/// A partial update of the rendezvous record. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotPatch {
    /// New credential.
    pub rfid_code: Option<String>,
    /// New status; also drives `is_active`.
    pub status: Option<SlotStatus>,
    /// New receive timestamp.
    pub received_time: Option<String>,
}

/// A live subscription to slot changes. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<SlotRecord>,
}

impl Subscription {
    /// Wait for the next change.
    ///
    /// # Errors
    ///
    /// Returns [`broadcast::error::RecvError::Lagged`] if changes were dropped, or
    /// `Closed` once the store is gone.
    pub async fn recv(&mut self) -> Result<SlotRecord, broadcast::error::RecvError> {
        self.receiver.recv().await
    }
}

/// Contract of the session record store.
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Read the record, if any.
    async fn read(&self) -> StoreResult<Option<SlotRecord>>;

    /// Replace the record.
    async fn write_full(&self, record: SlotRecord) -> StoreResult<()>;

    /// Patch the record. A missing record is patched from the default.
    async fn write_partial(&self, patch: SlotPatch) -> StoreResult<()>;

    /// Subscribe to every subsequent change.
    fn subscribe(&self) -> Subscription;
}

/// Shared broadcast plumbing used by both stores.
#[derive(Debug)]
struct Notifier {
    tx: broadcast::Sender<SlotRecord>,
}

impl Notifier {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    fn publish(&self, record: &SlotRecord) {
        // No subscribers is fine.
        let _ = self.tx.send(record.clone());
    }

    fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.tx.subscribe(),
        }
    }
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

/// In-process store, used in tests and when no data directory is wanted.
#[derive(Debug)]
pub struct MemorySlotStore {
    record: RwLock<Option<SlotRecord>>,
    available: AtomicBool,
    notifier: Notifier,
}

impl Default for MemorySlotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySlotStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            record: RwLock::new(None),
            available: AtomicBool::new(true),
            notifier: Notifier::new(),
        }
    }

    /// Convenience constructor returning an `Arc`.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate the store going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Re-send the current record to subscribers, as an at-least-once backend may.
    pub async fn redeliver(&self) {
        if let Some(record) = self.record.read().await.as_ref() {
            self.notifier.publish(record);
        }
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                message: "memory store is offline".to_string(),
            })
        }
    }
}

#[async_trait]
impl SlotStore for MemorySlotStore {
    async fn read(&self) -> StoreResult<Option<SlotRecord>> {
        self.check_available()?;
        Ok(self.record.read().await.clone())
    }

    async fn write_full(&self, record: SlotRecord) -> StoreResult<()> {
        self.check_available()?;
        let mut guard = self.record.write().await;
        self.notifier.publish(&record);
        *guard = Some(record);
        Ok(())
    }

    async fn write_partial(&self, patch: SlotPatch) -> StoreResult<()> {
        self.check_available()?;
        let mut guard = self.record.write().await;
        let record = guard.get_or_insert_with(SlotRecord::default);
        record.apply(&patch);
        self.notifier.publish(record);
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        self.notifier.subscribe()
    }
}

// =============================================================================
// FILE-BACKED STORE
// =============================================================================

/// Store persisting the record as JSON under the data directory.
#[derive(Debug)]
pub struct FileSlotStore {
    storage: Storage,
    // Serializes file access within the process.
    lock: tokio::sync::Mutex<()>,
    notifier: Notifier,
}

impl FileSlotStore {
    /// Store rooted at `storage`.
    #[must_use]
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            lock: tokio::sync::Mutex::new(()),
            notifier: Notifier::new(),
        }
    }

    fn load(&self) -> StoreResult<Option<SlotRecord>> {
        let path = self.storage.path_of(SLOT_DOCUMENT);
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|source| StoreError::Corrupt { path, source }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn persist(&self, record: &SlotRecord) -> StoreResult<()> {
        self.storage
            .save_json(SLOT_DOCUMENT, record)
            .map_err(|e| StoreError::Unavailable {
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl SlotStore for FileSlotStore {
    async fn read(&self) -> StoreResult<Option<SlotRecord>> {
        let _guard = self.lock.lock().await;
        self.load()
    }

    async fn write_full(&self, record: SlotRecord) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        self.persist(&record)?;
        self.notifier.publish(&record);
        Ok(())
    }

    async fn write_partial(&self, patch: SlotPatch) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        let mut record = self.load()?.unwrap_or_default();
        record.apply(&patch);
        self.persist(&record)?;
        self.notifier.publish(&record);
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        self.notifier.subscribe()
    }
}
