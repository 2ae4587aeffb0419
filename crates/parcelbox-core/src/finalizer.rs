//! Binds received credentials to profiles.
//!
//! The finalizer drains the coordinator's change stream on a single task. When a session
//! reaches `received` it writes the code into the requester's profile, releases the slot and
//! publishes a [`PairingOutcome`]. Change notifications are at-least-once, so every
//! `(generation, credential)` pair is attempted at most once unless [`retry`] is asked for.
//!
//! A failed profile write leaves the session `received`. Nothing retries it on its own,
//! except that a lagged change stream triggers one re-read of the current session.
//!
//! [`retry`]: FinalizerHandle::retry

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::error::{Error, Result};
use crate::pairing::{PairingCoordinator, PairingSession, SessionState};
use crate::profiles::ProfileStore;

const OUTCOME_CHANNEL_CAPACITY: usize = 32;
const COMMAND_CHANNEL_CAPACITY: usize = 8;

/// Result of a finalization attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PairingOutcome {
    /// The credential is now bound to the requester and the slot was released.
    Paired {
        /// Session instance.
        generation: u64,
        /// Bound code.
        credential: String,
        /// Profile that received the code.
        requester_id: String,
    },
    /// Binding failed, or session changes were lost.
    Failed {
        /// Affected session; `None` when the change stream failed.
        generation: Option<u64>,
        /// What went wrong.
        error: String,
    },
}

/// Single-task consumer of session changes.
pub struct Finalizer {
    coordinator: PairingCoordinator,
    profiles: Arc<dyn ProfileStore>,
    /// Last `(generation, credential)` attempted.
    attempted: Option<(u64, String)>,
    outcomes: broadcast::Sender<PairingOutcome>,
}

impl std::fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Finalizer")
            .field("attempted", &self.attempted)
            .finish_non_exhaustive()
    }
}

impl Finalizer {
    /// Create a finalizer writing into `profiles`.
    #[must_use]
    pub fn new(coordinator: PairingCoordinator, profiles: Arc<dyn ProfileStore>) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            coordinator,
            profiles,
            attempted: None,
            outcomes,
        }
    }

    /// Subscribe to outcomes.
    #[must_use]
    pub fn outcomes(&self) -> broadcast::Receiver<PairingOutcome> {
        self.outcomes.subscribe()
    }

    fn already_attempted(&self, generation: u64, credential: &str) -> bool {
        self.attempted.as_ref().is_some_and(|(g, c)| {
            generation < *g || (generation == *g && credential == c)
        })
    }

    /// Act on one observed session.
    ///
    /// Returns the outcome when an attempt was made, `None` when the change was ignored or
    /// the session had already left the slot (for example, cancelled after `received`).
    pub async fn handle_change(&mut self, session: &PairingSession) -> Option<PairingOutcome> {
        if session.state != SessionState::Received || session.requester_id.is_empty() {
            return None;
        }
        let credential = session.issued_credential.as_deref().filter(|c| !c.is_empty())?;
        let generation = session.generation;

        if self.already_attempted(generation, credential) {
            debug!(generation, "duplicate received notification ignored");
            return None;
        }
        self.attempted = Some((generation, credential.to_string()));

        let outcome = self.finalize(generation, credential, &session.requester_id).await?;
        self.publish(outcome.clone());
        Some(outcome)
    }

    async fn finalize(
        &self,
        generation: u64,
        credential: &str,
        requester_id: &str,
    ) -> Option<PairingOutcome> {
        let profiles = &self.profiles;
        let bind = async move {
            profiles
                .credential_update(requester_id, credential)
                .await
                .map_err(|e| Error::FinalizationFailed(e.to_string()))
        };

        match self.coordinator.complete(generation, credential, bind).await {
            Ok(true) => {
                info!(generation, requester_id, "rfid card paired");
                Some(PairingOutcome::Paired {
                    generation,
                    credential: credential.to_string(),
                    requester_id: requester_id.to_string(),
                })
            }
            Ok(false) => None,
            Err(e) => {
                error!(generation, requester_id, error = %e, "pairing finalization failed");
                Some(PairingOutcome::Failed {
                    generation: Some(generation),
                    error: e.to_string(),
                })
            }
        }
    }

    /// Act on one item of the change stream.
    ///
    /// A lagged stream is reported as a failure, then the current session is re-read so a
    /// dropped `received` change is still finalized.
    pub async fn handle_event(&mut self, event: Result<PairingSession>) {
        match event {
            Ok(session) => {
                self.handle_change(&session).await;
            }
            Err(e) => {
                warn!(error = %e, "session change stream lagged");
                self.publish(PairingOutcome::Failed {
                    generation: None,
                    error: e.to_string(),
                });
                match self.coordinator.status().await {
                    Ok(Some(session)) => {
                        self.handle_change(&session).await;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "could not re-read session after lag"),
                }
            }
        }
    }

    /// Re-attempt the session currently `received`, ignoring earlier attempts.
    ///
    /// Returns `None` when no session is waiting for finalization.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if the slot cannot be read.
    pub async fn retry(&mut self) -> Result<Option<PairingOutcome>> {
        let Some(session) = self.coordinator.status().await? else {
            return Ok(None);
        };
        if session.state != SessionState::Received {
            debug!(generation = session.generation, "nothing to retry");
            return Ok(None);
        }

        info!(generation = session.generation, "retrying pairing finalization");
        self.attempted = None;
        Ok(self.handle_change(&session).await)
    }

    fn publish(&self, outcome: PairingOutcome) {
        // No subscribers is fine.
        let _ = self.outcomes.send(outcome);
    }

    /// Run on a background task.
    ///
    /// The change subscription is taken before the task starts, so no change written after
    /// this call is missed.
    #[must_use]
    pub fn spawn(mut self) -> FinalizerHandle {
        let mut events = self.coordinator.observe();
        let (commands_tx, mut commands) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let outcomes = self.outcomes.clone();

        let task = tokio::spawn(async move {
            debug!("finalizer started");
            loop {
                tokio::select! {
                    event = events.next() => match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    },
                    command = commands.recv() => match command {
                        Some(Command::Retry(reply)) => {
                            let _ = reply.send(self.retry().await);
                        }
                        Some(Command::Shutdown) | None => break,
                    },
                }
            }
            debug!("finalizer stopped");
        });

        FinalizerHandle {
            commands: commands_tx,
            outcomes,
            task: Mutex::new(Some(task)),
        }
    }
}

enum Command {
    Retry(oneshot::Sender<Result<Option<PairingOutcome>>>),
    Shutdown,
}

/// Control handle for a spawned [`Finalizer`].
#[derive(Debug)]
pub struct FinalizerHandle {
    commands: mpsc::Sender<Command>,
    outcomes: broadcast::Sender<PairingOutcome>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FinalizerHandle {
    /// Subscribe to outcomes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PairingOutcome> {
        self.outcomes.subscribe()
    }

    /// Ask the task to re-attempt the currently received session.
    ///
    /// # Errors
    ///
    /// `FinalizationFailed` if the task is no longer running, otherwise whatever
    /// [`Finalizer::retry`] returns.
    pub async fn retry(&self) -> Result<Option<PairingOutcome>> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Retry(reply))
            .await
            .map_err(|_| not_running())?;
        response.await.map_err(|_| not_running())?
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "finalizer task ended abnormally");
            }
        }
    }
}

fn not_running() -> Error {
    Error::FinalizationFailed("finalizer is not running".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    use crate::config::PairingConfig;
    use crate::profiles::{JsonProfileStore, NewProfile, Profile, ProfileUpdate, Role};
    use crate::store::{MemorySlotStore, SlotStore};

    /// Counts credential writes on top of an in-memory store.
    #[derive(Default)]
    struct CountingProfiles {
        inner: JsonProfileStore,
        credential_writes: AtomicUsize,
    }

    #[async_trait]
    impl ProfileStore for CountingProfiles {
        async fn create(&self, id: Option<String>, profile: NewProfile) -> Result<Profile> {
            self.inner.create(id, profile).await
        }
        async fn get(&self, id: &str) -> Result<Profile> {
            self.inner.get(id).await
        }
        async fn update(&self, id: &str, update: ProfileUpdate) -> Result<Profile> {
            self.inner.update(id, update).await
        }
        async fn list(&self, role: Role, deleted: bool) -> Result<Vec<Profile>> {
            self.inner.list(role, deleted).await
        }
        async fn soft_delete(&self, id: &str, deleted_by: &str) -> Result<Profile> {
            self.inner.soft_delete(id, deleted_by).await
        }
        async fn restore(&self, id: &str) -> Result<Profile> {
            self.inner.restore(id).await
        }
        async fn credential_update(&self, id: &str, code: &str) -> Result<()> {
            self.credential_writes.fetch_add(1, Ordering::SeqCst);
            self.inner.credential_update(id, code).await
        }
        async fn credential_clear(&self, id: &str) -> Result<()> {
            self.inner.credential_clear(id).await
        }
    }

    struct Fixture {
        store: Arc<MemorySlotStore>,
        pairing: PairingCoordinator,
        profiles: Arc<CountingProfiles>,
    }

    async fn fixture() -> Fixture {
        let store = MemorySlotStore::shared();
        let pairing = PairingCoordinator::new(store.clone(), &PairingConfig::default())
            .await
            .unwrap();
        Fixture {
            store,
            pairing,
            profiles: Arc::new(CountingProfiles::default()),
        }
    }

    async fn add_user(profiles: &CountingProfiles, id: &str) {
        profiles
            .create(
                Some(id.to_string()),
                NewProfile {
                    email: format!("{id}@example.com"),
                    role: Role::User,
                    name: Some(id.to_string()),
                    ..NewProfile::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_notifications_write_profile_once() {
        let f = fixture().await;
        add_user(&f.profiles, "alice").await;

        let handle = Finalizer::new(f.pairing.clone(), f.profiles.clone()).spawn();
        let mut outcomes = handle.subscribe();

        let generation = f.pairing.start_session("alice").await.unwrap();
        f.pairing
            .submit_credential(Some(generation), "A1B2C3D4")
            .await
            .unwrap();
        f.store.redeliver().await;
        f.store.redeliver().await;

        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(
            outcome,
            PairingOutcome::Paired {
                generation,
                credential: "A1B2C3D4".into(),
                requester_id: "alice".into(),
            }
        );

        handle.shutdown().await;
        assert_eq!(f.profiles.credential_writes.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.profiles.get("alice").await.unwrap().rfid_code.as_deref(),
            Some("A1B2C3D4")
        );
        assert!(f.pairing.status().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handle_change_guards_repeats() {
        let f = fixture().await;
        add_user(&f.profiles, "alice").await;
        let mut finalizer = Finalizer::new(f.pairing.clone(), f.profiles.clone());

        let generation = f.pairing.start_session("alice").await.unwrap();
        f.pairing.submit_credential(None, "CAFEBABE").await.unwrap();
        let session = f.pairing.status().await.unwrap().unwrap();

        assert!(finalizer.handle_change(&session).await.is_some());
        assert!(finalizer.handle_change(&session).await.is_none());
        assert!(finalizer.handle_change(&session).await.is_none());
        assert_eq!(f.profiles.credential_writes.load(Ordering::SeqCst), 1);

        let record = assert_ok!(f.store.read().await).unwrap();
        assert_eq!(record.generation, generation);
        assert!(!record.is_active);
    }

    #[tokio::test]
    async fn test_non_received_changes_ignored() {
        let f = fixture().await;
        add_user(&f.profiles, "alice").await;
        let mut finalizer = Finalizer::new(f.pairing.clone(), f.profiles.clone());

        f.pairing.start_session("alice").await.unwrap();
        let waiting = f.pairing.status().await.unwrap().unwrap();
        assert!(finalizer.handle_change(&waiting).await.is_none());
        assert_eq!(f.profiles.credential_writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_keeps_session_received_until_retry() {
        let f = fixture().await;
        let handle = Finalizer::new(f.pairing.clone(), f.profiles.clone()).spawn();
        let mut outcomes = handle.subscribe();

        let generation = f.pairing.start_session("ghost").await.unwrap();
        f.pairing.submit_credential(None, "0BADC0DE").await.unwrap();

        match outcomes.recv().await.unwrap() {
            PairingOutcome::Failed { generation: g, error } => {
                assert_eq!(g, Some(generation));
                assert!(error.contains("ghost"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        let session = f.pairing.status().await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Received);

        // A duplicate notification does not retry on its own.
        f.store.redeliver().await;
        tokio::task::yield_now().await;
        assert_eq!(f.profiles.credential_writes.load(Ordering::SeqCst), 1);

        add_user(&f.profiles, "ghost").await;
        let outcome = assert_ok!(handle.retry().await);
        assert!(matches!(
            outcome,
            Some(PairingOutcome::Paired { generation: g, .. }) if g == generation
        ));
        assert!(f.pairing.status().await.unwrap().is_none());

        // Nothing left to retry.
        assert_eq!(assert_ok!(handle.retry().await), None);

        handle.shutdown().await;
        assert_err!(handle.retry().await);
    }

    #[tokio::test]
    async fn test_session_cancelled_after_received_is_not_bound() {
        let f = fixture().await;
        add_user(&f.profiles, "alice").await;
        let mut finalizer = Finalizer::new(f.pairing.clone(), f.profiles.clone());
        let mut outcomes = finalizer.outcomes();

        f.pairing.start_session("alice").await.unwrap();
        f.pairing.submit_credential(None, "A1B2C3D4").await.unwrap();
        let received = f.pairing.status().await.unwrap().unwrap();
        assert!(assert_ok!(f.pairing.cancel_session(None).await));

        // The received change is drained only after the cancel landed.
        assert!(finalizer.handle_change(&received).await.is_none());
        assert_eq!(f.profiles.credential_writes.load(Ordering::SeqCst), 0);
        assert!(f.profiles.get("alice").await.unwrap().rfid_code.is_none());
        assert!(outcomes.try_recv().is_err());

        // Nothing is left for a retry either.
        assert_eq!(assert_ok!(finalizer.retry().await), None);
    }

    #[tokio::test]
    async fn test_lagged_stream_reports_failure_and_resyncs() {
        let f = fixture().await;
        add_user(&f.profiles, "alice").await;
        let mut finalizer = Finalizer::new(f.pairing.clone(), f.profiles.clone());
        let mut outcomes = finalizer.outcomes();
        let mut events = f.pairing.observe();

        let generation = f.pairing.start_session("alice").await.unwrap();
        f.pairing.submit_credential(None, "CAFEBABE").await.unwrap();
        for _ in 0..70 {
            f.store.redeliver().await;
        }

        let lagged = events.next().await.unwrap();
        assert!(matches!(lagged, Err(Error::Subscription(_))));
        finalizer.handle_event(lagged).await;

        match outcomes.recv().await.unwrap() {
            PairingOutcome::Failed { generation: None, error } => {
                assert!(error.contains("missed"));
            }
            other => panic!("expected stream failure, got {other:?}"),
        }
        assert!(matches!(
            outcomes.recv().await.unwrap(),
            PairingOutcome::Paired { generation: g, .. } if g == generation
        ));
        assert!(f.pairing.status().await.unwrap().is_none());

        // The retained redeliveries are duplicates of what was just finalized.
        for _ in 0..3 {
            let event = events.next().await.unwrap();
            finalizer.handle_event(event).await;
        }
        assert_eq!(f.profiles.credential_writes.load(Ordering::SeqCst), 1);
    }
}
