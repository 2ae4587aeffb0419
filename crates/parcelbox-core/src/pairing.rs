//! RFID pairing session coordinator.
//!
//! A requester (the mobile client) starts a session in the single rendezvous slot, the box
//! notices the `waiting` record, writes a fresh code to a card, and submits that code back.
//! The [`Finalizer`](crate::finalizer::Finalizer) then binds the code to the requester's
//! profile and releases the slot.
//!
//! ```text
//! Idle --start--> Waiting --submit--> Received --finalize--> Idle
//!                    |                    |
//!                    +--timeout/cancel--> Idle <--cancel--+
//! ```
//!
//! Every mutation of the slot goes through one mutex held by the coordinator, so the
//! expiry timer, device submissions and client cancels never interleave their
//! read-then-write steps. Each session gets a strictly increasing generation; expiry
//! timers and targeted cancels only act when the stored generation still matches.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use regex::Regex;
use serde::Serialize;
use tokio::sync::{broadcast::error::RecvError, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::config::PairingConfig;
use crate::error::{Error, Result};
use crate::store::{SlotPatch, SlotRecord, SlotStatus, SlotStore, Subscription};

/// Lifecycle state of a pairing session.
pub type SessionState = SlotStatus;

/// Domain view of the session occupying the rendezvous slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[schema(example = json!({
    "generation": 7,
    "requester_id": "uid-123",
    "state": "received",
    "issued_credential": "A1B2C3D4",
    "started_at": "2025-01-15T03:30:00Z",
    "received_at": "2025-01-15T03:30:12Z"
}))]
pub struct PairingSession {
    /// Session instance number.
    pub generation: u64,

    /// Who asked for the card.
    pub requester_id: String,

    /// Current state.
    pub state: SessionState,

    /// Code written to the card. Only present once `received`.
    pub issued_credential: Option<String>,

    /// When the session started.
    pub started_at: Option<DateTime<Utc>>,

    /// When the box submitted the code.
    pub received_at: Option<DateTime<Utc>>,
}

impl From<&SlotRecord> for PairingSession {
    fn from(record: &SlotRecord) -> Self {
        let issued_credential = (record.status == SlotStatus::Received
            && !record.rfid_code.is_empty())
        .then(|| record.rfid_code.clone());

        Self {
            generation: record.generation,
            requester_id: record.user_id.clone(),
            state: record.status,
            issued_credential,
            started_at: parse_timestamp(&record.start_time),
            received_at: parse_timestamp(&record.received_time),
        }
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Why a slot was reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// A client or administrator asked.
    Manual,
    /// The expiry timer fired while still waiting.
    Timeout,
    /// The credential was bound to the profile.
    Finalized,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Manual => "manual",
            Self::Timeout => "timeout",
            Self::Finalized => "finalized",
        })
    }
}

struct ExpiryTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct Inner {
    last_generation: u64,
    timer: Option<ExpiryTimer>,
}

impl Inner {
    /// Abort the pending timer if it belongs to `generation` (or any, when `None`).
    fn abort_timer(&mut self, generation: Option<u64>) {
        let matches = self
            .timer
            .as_ref()
            .is_some_and(|t| generation.map_or(true, |g| t.generation == g));
        if matches {
            if let Some(timer) = self.timer.take() {
                timer.handle.abort();
                debug!(generation = timer.generation, "expiry timer aborted");
            }
        }
    }
}

struct Shared {
    store: Arc<dyn SlotStore>,
    timeout: Duration,
    credential_format: Regex,
    inner: Mutex<Inner>,
}

/// Owner of the rendezvous slot. Cheap to clone.
#[derive(Clone)]
pub struct PairingCoordinator {
    shared: Arc<Shared>,
}

impl fmt::Debug for PairingCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingCoordinator")
            .field("timeout", &self.shared.timeout)
            .finish_non_exhaustive()
    }
}

impl PairingCoordinator {
    /// Create a coordinator over `store`.
    ///
    /// Reads the slot once so generation numbers continue from whatever is stored. A
    /// session found `waiting` gets a fresh expiry timer.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store cannot be read, or a config error if the
    /// credential pattern does not compile.
    pub async fn new(store: Arc<dyn SlotStore>, config: &PairingConfig) -> Result<Self> {
        let credential_format = config.credential_regex()?;
        let stored = store.read().await?;
        let last_generation = stored.as_ref().map_or(0, |r| r.generation);

        let coordinator = Self {
            shared: Arc::new(Shared {
                store,
                timeout: config.timeout(),
                credential_format,
                inner: Mutex::new(Inner {
                    last_generation,
                    timer: None,
                }),
            }),
        };

        if stored.is_some_and(|r| r.status == SlotStatus::Waiting) {
            info!(generation = last_generation, "re-arming expiry for waiting session");
            let timer = coordinator.spawn_expiry(last_generation);
            coordinator.shared.inner.lock().await.timer = Some(timer);
        }

        debug!(last_generation, "pairing coordinator ready");
        Ok(coordinator)
    }

    /// How long a session may wait for the box.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    /// Start a session for `requester_id`, superseding whatever occupies the slot.
    ///
    /// Returns the new session's generation.
    ///
    /// # Errors
    ///
    /// `InvalidRequester` for a blank id, `StoreUnavailable` if the write fails.
    pub async fn start_session(&self, requester_id: &str) -> Result<u64> {
        let requester_id = requester_id.trim();
        if requester_id.is_empty() {
            return Err(Error::InvalidRequester);
        }

        let mut inner = self.shared.inner.lock().await;
        inner.last_generation += 1;
        let generation = inner.last_generation;

        self.shared
            .store
            .write_full(SlotRecord::waiting(generation, requester_id, Utc::now()))
            .await?;

        inner.abort_timer(None);
        inner.timer = Some(self.spawn_expiry(generation));

        info!(
            generation,
            requester_id,
            timeout_secs = self.shared.timeout.as_secs(),
            "pairing session started"
        );
        Ok(generation)
    }

    /// Reset the slot to idle.
    ///
    /// With a generation, only that session is cancelled and an already idle slot is left
    /// alone. Without one, the slot is reset unconditionally (administrative cancel).
    /// Returns whether a reset was written.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if the store cannot be read or written.
    pub async fn cancel_session(&self, generation: Option<u64>) -> Result<bool> {
        self.reset(generation, CancelReason::Manual).await
    }

    /// Run `bind` for a received session and release the slot, holding the slot lock
    /// throughout so no cancel or new session can land in between.
    ///
    /// Returns `Ok(false)` without polling `bind` when the slot no longer holds
    /// `generation` as `received` with `credential`. A failed `bind` leaves the slot as is.
    pub(crate) async fn complete<F>(&self, generation: u64, credential: &str, bind: F) -> Result<bool>
    where
        F: Future<Output = Result<()>> + Send,
    {
        let mut inner = self.shared.inner.lock().await;

        match self.shared.store.read().await? {
            Some(record)
                if record.generation == generation
                    && record.status == SlotStatus::Received
                    && record.rfid_code == credential => {}
            _ => {
                debug!(generation, "session left the slot before finalization");
                return Ok(false);
            }
        }

        bind.await?;

        if let Err(e) = self
            .shared
            .store
            .write_full(SlotRecord::idle(generation, Utc::now()))
            .await
        {
            warn!(generation, error = %e, "credential bound but slot release failed");
            return Err(e.into());
        }
        inner.abort_timer(Some(generation));

        info!(generation, reason = %CancelReason::Finalized, "pairing session reset");
        Ok(true)
    }

    async fn reset(&self, target: Option<u64>, reason: CancelReason) -> Result<bool> {
        let mut inner = self.shared.inner.lock().await;

        let generation = match target {
            Some(generation) => {
                let stored = self.shared.store.read().await?;
                match stored {
                    Some(record)
                        if record.generation == generation
                            && record.status != SlotStatus::Idle => {}
                    _ => {
                        debug!(generation, %reason, "cancel ignored, session no longer in slot");
                        return Ok(false);
                    }
                }
                generation
            }
            None => inner.last_generation,
        };

        self.shared
            .store
            .write_full(SlotRecord::idle(generation, Utc::now()))
            .await?;
        inner.abort_timer(target);

        info!(generation, %reason, "pairing session reset");
        Ok(true)
    }

    /// Record the credential the box wrote to the card.
    ///
    /// The code is trimmed and upper-cased before validation. With a generation, only that
    /// session accepts it; without one, whichever session is waiting does.
    /// Returns the generation that received the credential.
    ///
    /// # Errors
    ///
    /// `InvalidCredential` for a malformed code, `SessionNotActive` unless a matching
    /// session is waiting (the store is left untouched), `StoreUnavailable` on store failure.
    pub async fn submit_credential(&self, generation: Option<u64>, credential: &str) -> Result<u64> {
        let code = credential.trim().to_uppercase();
        if !self.shared.credential_format.is_match(&code) {
            return Err(Error::InvalidCredential(credential.trim().to_string()));
        }

        let _inner = self.shared.inner.lock().await;

        let target = match self.shared.store.read().await? {
            Some(record)
                if record.status == SlotStatus::Waiting
                    && generation.map_or(true, |g| g == record.generation) =>
            {
                record.generation
            }
            other => {
                warn!(
                    requested = ?generation,
                    stored = ?other.as_ref().map(|r| (r.generation, r.status.as_str())),
                    "credential rejected, no matching session waiting"
                );
                return Err(Error::SessionNotActive);
            }
        };

        self.shared
            .store
            .write_partial(SlotPatch {
                rfid_code: Some(code),
                status: Some(SlotStatus::Received),
                received_time: Some(Utc::now().to_rfc3339()),
            })
            .await?;

        info!(generation = target, "credential received from box");
        Ok(target)
    }

    /// The active session, if any. An empty or idle slot is `None`.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if the store cannot be read.
    pub async fn status(&self) -> Result<Option<PairingSession>> {
        let record = self.shared.store.read().await?;
        Ok(record
            .filter(|r| r.status != SlotStatus::Idle)
            .map(|r| PairingSession::from(&r)))
    }

    /// Subscribe to every change of the slot.
    ///
    /// Delivery is at-least-once; the same transition may be seen more than once.
    #[must_use]
    pub fn observe(&self) -> SessionEvents {
        SessionEvents {
            subscription: self.shared.store.subscribe(),
        }
    }

    fn spawn_expiry(&self, generation: u64) -> ExpiryTimer {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let timeout = self.shared.timeout;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let coordinator = Self { shared };
            if let Err(e) = coordinator.expire(generation).await {
                warn!(generation, error = %e, "failed to expire pairing session");
            }
        });

        ExpiryTimer { generation, handle }
    }

    /// Expire `generation` if it is still waiting in the slot.
    async fn expire(&self, generation: u64) -> Result<bool> {
        let mut inner = self.shared.inner.lock().await;

        // This task is the timer; forget its handle without aborting ourselves.
        if inner
            .timer
            .as_ref()
            .is_some_and(|t| t.generation == generation)
        {
            inner.timer = None;
        }

        match self.shared.store.read().await? {
            Some(record)
                if record.generation == generation && record.status == SlotStatus::Waiting => {}
            _ => {
                debug!(generation, "stale expiry ignored");
                return Ok(false);
            }
        }

        self.shared
            .store
            .write_full(SlotRecord::idle(generation, Utc::now()))
            .await?;

        info!(generation, reason = %CancelReason::Timeout, "pairing session reset");
        Ok(true)
    }
}

/// Ordered stream of slot changes.
#[derive(Debug)]
pub struct SessionEvents {
    subscription: Subscription,
}

impl SessionEvents {
    /// Next change, `Some(Err(_))` if changes were dropped, `None` once the store is gone.
    pub async fn next(&mut self) -> Option<Result<PairingSession>> {
        match self.subscription.recv().await {
            Ok(record) => Some(Ok(PairingSession::from(&record))),
            Err(RecvError::Lagged(missed)) => Some(Err(Error::Subscription(format!(
                "missed {missed} session updates"
            )))),
            Err(RecvError::Closed) => None,
        }
    }

    /// Adapt into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<PairingSession>> + Send {
        futures::stream::unfold(self, |mut events| async move {
            events.next().await.map(|item| (item, events))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySlotStore;

    async fn coordinator(store: &Arc<MemorySlotStore>) -> PairingCoordinator {
        PairingCoordinator::new(store.clone(), &PairingConfig::default())
            .await
            .unwrap()
    }

    /// Let the paused clock run forward and give spawned tasks a chance to finish.
    async fn elapse(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_produces_waiting_session_with_increasing_generation() {
        let store = MemorySlotStore::shared();
        let pairing = coordinator(&store).await;

        let first = pairing.start_session("alice").await.unwrap();
        let session = pairing.status().await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Waiting);
        assert_eq!(session.requester_id, "alice");
        assert!(session.issued_credential.is_none());
        assert!(session.started_at.is_some());

        let second = pairing.start_session("alice").await.unwrap();
        assert!(second > first);
        assert_eq!(pairing.status().await.unwrap().unwrap().generation, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_requester_rejected() {
        let store = MemorySlotStore::shared();
        let pairing = coordinator(&store).await;
        assert!(matches!(
            pairing.start_session("   ").await,
            Err(Error::InvalidRequester)
        ));
        assert!(store.read().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_session_expires_and_later_cancel_is_noop() {
        let store = MemorySlotStore::shared();
        let pairing = coordinator(&store).await;

        let generation = pairing.start_session("alice").await.unwrap();
        elapse(31).await;

        assert!(pairing.status().await.unwrap().is_none());
        let expired = store.read().await.unwrap().unwrap();
        assert_eq!(expired.status, SlotStatus::Idle);
        assert_eq!(expired.generation, generation);
        assert!(expired.user_id.is_empty());

        assert!(!pairing.cancel_session(Some(generation)).await.unwrap());
        assert_eq!(store.read().await.unwrap().unwrap(), expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_does_not_cancel_newer_session() {
        let store = MemorySlotStore::shared();
        let pairing = coordinator(&store).await;

        pairing.start_session("alice").await.unwrap();
        elapse(20).await;
        let newer = pairing.start_session("bob").await.unwrap();

        // alice's timer would have fired at t=30.
        elapse(15).await;
        let session = pairing.status().await.unwrap().unwrap();
        assert_eq!(session.generation, newer);
        assert_eq!(session.requester_id, "bob");
        assert_eq!(session.state, SessionState::Waiting);

        // bob's timer fires at t=50.
        elapse(20).await;
        assert!(pairing.status().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_expiry_is_noop_even_if_it_runs() {
        let store = MemorySlotStore::shared();
        let pairing = coordinator(&store).await;

        let old = pairing.start_session("alice").await.unwrap();
        let newer = pairing.start_session("bob").await.unwrap();

        assert!(!pairing.expire(old).await.unwrap());
        assert_eq!(pairing.status().await.unwrap().unwrap().generation, newer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_received_session_is_not_expired() {
        let store = MemorySlotStore::shared();
        let pairing = coordinator(&store).await;

        let generation = pairing.start_session("alice").await.unwrap();
        pairing
            .submit_credential(Some(generation), "a1b2c3d4")
            .await
            .unwrap();
        elapse(120).await;

        let session = pairing.status().await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Received);
        assert_eq!(session.issued_credential.as_deref(), Some("A1B2C3D4"));
        assert!(session.received_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_without_waiting_session_leaves_store_unchanged() {
        let store = MemorySlotStore::shared();
        let pairing = coordinator(&store).await;

        assert!(matches!(
            pairing.submit_credential(None, "A1B2C3D4").await,
            Err(Error::SessionNotActive)
        ));
        assert!(store.read().await.unwrap().is_none());

        let generation = pairing.start_session("alice").await.unwrap();
        let before = store.read().await.unwrap();

        assert!(matches!(
            pairing
                .submit_credential(Some(generation + 1), "A1B2C3D4")
                .await,
            Err(Error::SessionNotActive)
        ));
        assert_eq!(store.read().await.unwrap(), before);

        pairing.submit_credential(None, "A1B2C3D4").await.unwrap();
        let received = store.read().await.unwrap();
        assert!(matches!(
            pairing.submit_credential(None, "FFFFFFFF").await,
            Err(Error::SessionNotActive)
        ));
        assert_eq!(store.read().await.unwrap(), received);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_credential_rejected() {
        let store = MemorySlotStore::shared();
        let pairing = coordinator(&store).await;
        pairing.start_session("alice").await.unwrap();
        let before = store.read().await.unwrap();

        for bad in ["", "A1B2", "A1B2C3D4E5", "ZZZZZZZZ"] {
            assert!(matches!(
                pairing.submit_credential(None, bad).await,
                Err(Error::InvalidCredential(_))
            ));
        }
        assert_eq!(store.read().await.unwrap(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_targets_only_matching_generation() {
        let store = MemorySlotStore::shared();
        let pairing = coordinator(&store).await;

        let old = pairing.start_session("alice").await.unwrap();
        let newer = pairing.start_session("bob").await.unwrap();

        assert!(!pairing.cancel_session(Some(old)).await.unwrap());
        assert_eq!(pairing.status().await.unwrap().unwrap().generation, newer);

        assert!(pairing.cancel_session(Some(newer)).await.unwrap());
        assert!(pairing.status().await.unwrap().is_none());
        assert!(!pairing.cancel_session(Some(newer)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconditional_cancel_resets_received_session() {
        let store = MemorySlotStore::shared();
        let pairing = coordinator(&store).await;

        pairing.start_session("alice").await.unwrap();
        pairing.submit_credential(None, "0BADC0DE").await.unwrap();

        assert!(pairing.cancel_session(None).await.unwrap());
        let record = store.read().await.unwrap().unwrap();
        assert_eq!(record.status, SlotStatus::Idle);
        assert!(record.rfid_code.is_empty());
        assert!(!record.cancelled_time.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_starts_settle_on_later_generation() {
        let store = MemorySlotStore::shared();
        let pairing = coordinator(&store).await;

        let (a, b) = tokio::join!(pairing.start_session("alice"), pairing.start_session("bob"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a, b);

        let record = store.read().await.unwrap().unwrap();
        let winner = a.max(b);
        assert_eq!(record.generation, winner);
        assert_eq!(record.user_id, if winner == a { "alice" } else { "bob" });
        assert_eq!(record.status, SlotStatus::Waiting);
        assert!(record.rfid_code.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_continues_from_stored_record() {
        let store = MemorySlotStore::shared();
        store
            .write_full(SlotRecord::idle(41, Utc::now()))
            .await
            .unwrap();

        let pairing = coordinator(&store).await;
        assert_eq!(pairing.start_session("alice").await.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_session_found_at_startup_still_expires() {
        let store = MemorySlotStore::shared();
        store
            .write_full(SlotRecord::waiting(9, "alice", Utc::now()))
            .await
            .unwrap();

        let pairing = coordinator(&store).await;
        assert_eq!(pairing.status().await.unwrap().unwrap().generation, 9);

        elapse(31).await;
        assert!(pairing.status().await.unwrap().is_none());
        assert_eq!(store.read().await.unwrap().unwrap().generation, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_unavailable_fails_fast() {
        let store = MemorySlotStore::shared();
        let pairing = coordinator(&store).await;

        store.set_available(false);
        assert!(matches!(
            pairing.start_session("alice").await,
            Err(Error::StoreUnavailable(_))
        ));
        assert!(matches!(
            pairing.status().await,
            Err(Error::StoreUnavailable(_))
        ));

        store.set_available(true);
        assert!(pairing.status().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_observe_delivers_each_transition() {
        let store = MemorySlotStore::shared();
        let pairing = coordinator(&store).await;
        let mut events = pairing.observe();

        let generation = pairing.start_session("alice").await.unwrap();
        pairing.submit_credential(None, "CAFEBABE").await.unwrap();
        pairing.cancel_session(Some(generation)).await.unwrap();

        let states: Vec<SessionState> = [
            events.next().await,
            events.next().await,
            events.next().await,
        ]
        .into_iter()
        .map(|e| e.unwrap().unwrap().state)
        .collect();
        assert_eq!(
            states,
            vec![
                SessionState::Waiting,
                SessionState::Received,
                SessionState::Idle
            ]
        );
    }

    #[tokio::test]
    async fn test_overflowed_subscription_reports_error_then_resumes() {
        let store = MemorySlotStore::shared();
        let pairing = coordinator(&store).await;
        let mut events = pairing.observe();

        let generation = pairing.start_session("alice").await.unwrap();
        for _ in 0..100 {
            store.redeliver().await;
        }

        assert!(matches!(
            events.next().await,
            Some(Err(Error::Subscription(_)))
        ));
        let resumed = events.next().await.unwrap().unwrap();
        assert_eq!(resumed.generation, generation);
        assert_eq!(resumed.state, SessionState::Waiting);
    }
}
