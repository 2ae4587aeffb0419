//! User and admin profiles.
//!
//! Profiles are never removed outright: deleting one sets the `deleted` flag and stamps
//! who deleted it and when, and [`ProfileStore::restore`] brings it back. A `user`
//! profile carries the RFID code bound by the pairing handshake.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::error::{Error, Result};
use crate::storage::Storage;

/// Document holding all profiles, relative to the data directory.
pub const PROFILES_DOCUMENT: &str = "users.json";

/// Who restores profiles through the admin surface.
pub const RESTORED_BY: &str = "admin";

static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("Invalid email regex pattern")
});

static PHONE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9]{8,15}$").expect("Invalid phone regex pattern"));

/// Returns `true` for a plausible email address.
#[must_use]
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_REGEX.is_match(email)
}

/// Returns `true` for 8 to 15 digits with an optional leading `+`.
#[must_use]
pub fn is_valid_phone(phone: &str) -> bool {
    PHONE_REGEX.is_match(phone)
}

/// Profile role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Parcel recipient who can own an RFID card.
    #[default]
    User,
    /// Administrator.
    Admin,
}

/// A stored profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    /// Stable id (auth uid).
    pub id: String,
    /// Login email.
    pub email: String,
    /// Role.
    pub role: Role,
    /// Full name (users only).
    pub name: Option<String>,
    /// Phone number (users only).
    pub phone: Option<String>,
    /// Bound RFID code, if paired.
    pub rfid_code: Option<String>,
    /// Soft-delete flag.
    pub deleted: bool,
    /// When the profile was deleted.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Who deleted it.
    pub deleted_by: Option<String>,
    /// When it was last restored.
    pub restored_at: Option<DateTime<Utc>>,
    /// Who restored it.
    pub restored_by: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating a profile.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[schema(example = json!({
    "email": "sari@example.com",
    "role": "user",
    "name": "Sari Wulandari",
    "phone": "+6281234567890"
}))]
pub struct NewProfile {
    /// Login email.
    pub email: String,
    /// Role.
    #[serde(default)]
    pub role: Role,
    /// Full name; required for users.
    pub name: Option<String>,
    /// Phone number.
    pub phone: Option<String>,
    /// Pre-assigned RFID code.
    pub rfid_code: Option<String>,
}

/// Partial profile update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct ProfileUpdate {
    /// New email.
    pub email: Option<String>,
    /// New name.
    pub name: Option<String>,
    /// New phone number.
    pub phone: Option<String>,
}

/// Contract of the profile store.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Create a profile. A random id is assigned when `id` is `None`.
    async fn create(&self, id: Option<String>, profile: NewProfile) -> Result<Profile>;

    /// Fetch an active profile.
    async fn get(&self, id: &str) -> Result<Profile>;

    /// Apply a partial update to an active profile.
    async fn update(&self, id: &str, update: ProfileUpdate) -> Result<Profile>;

    /// Profiles of `role` with the given deletion flag.
    ///
    /// Active profiles are sorted by name, deleted ones newest deletion first.
    async fn list(&self, role: Role, deleted: bool) -> Result<Vec<Profile>>;

    /// Soft-delete a profile.
    async fn soft_delete(&self, id: &str, deleted_by: &str) -> Result<Profile>;

    /// Undo a soft delete.
    async fn restore(&self, id: &str) -> Result<Profile>;

    /// Bind an RFID code to an active profile.
    async fn credential_update(&self, id: &str, code: &str) -> Result<()>;

    /// Remove the RFID code from a profile.
    async fn credential_clear(&self, id: &str) -> Result<()>;
}

/// Profile store kept in memory and optionally mirrored to `users.json`.
#[derive(Debug)]
pub struct JsonProfileStore {
    profiles: RwLock<BTreeMap<String, Profile>>,
    storage: Option<Storage>,
}

impl Default for JsonProfileStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl JsonProfileStore {
    /// Store without persistence.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            profiles: RwLock::new(BTreeMap::new()),
            storage: None,
        }
    }

    /// Store persisted under `storage`, loading existing profiles.
    ///
    /// # Errors
    ///
    /// Returns an error if the existing document cannot be read.
    pub fn open(storage: Storage) -> Result<Self> {
        let profiles: BTreeMap<String, Profile> =
            storage.load_json(PROFILES_DOCUMENT)?.unwrap_or_default();
        debug!(count = profiles.len(), "profiles loaded");
        Ok(Self {
            profiles: RwLock::new(profiles),
            storage: Some(storage),
        })
    }

    fn persist(&self, profiles: &BTreeMap<String, Profile>) -> Result<()> {
        match &self.storage {
            Some(storage) => storage.save_json(PROFILES_DOCUMENT, profiles),
            None => Ok(()),
        }
    }

    /// Write `profile` into a copy of the map, persist the copy, then swap it in.
    ///
    /// The in-memory map only changes once the document is on disk.
    fn commit(&self, profiles: &mut BTreeMap<String, Profile>, profile: Profile) -> Result<()> {
        let mut next = profiles.clone();
        next.insert(profile.id.clone(), profile);
        self.persist(&next)?;
        *profiles = next;
        Ok(())
    }

    /// Run `f` on an active profile, stamp `updated_at` and commit.
    ///
    /// `f` sees the whole map under the write lock, so checks across profiles hold until
    /// the change lands.
    async fn mutate_active<F>(&self, id: &str, f: F) -> Result<Profile>
    where
        F: FnOnce(&BTreeMap<String, Profile>, &mut Profile) -> Result<()> + Send,
    {
        let mut profiles = self.profiles.write().await;
        let mut profile = active(&profiles, id)?.clone();
        f(&profiles, &mut profile)?;
        profile.updated_at = Utc::now();
        self.commit(&mut profiles, profile.clone())?;
        Ok(profile)
    }
}

fn active<'a>(profiles: &'a BTreeMap<String, Profile>, id: &str) -> Result<&'a Profile> {
    match profiles.get(id) {
        None => Err(Error::ProfileNotFound(id.to_string())),
        Some(p) if p.deleted => Err(Error::ProfileDeleted(id.to_string())),
        Some(p) => Ok(p),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn validate_email(email: &str) -> Result<()> {
    if is_valid_email(email) {
        Ok(())
    } else {
        Err(Error::InvalidProfile(format!("'{email}' is not a valid email")))
    }
}

fn validate_phone(phone: Option<&str>) -> Result<()> {
    match phone {
        Some(p) if !is_valid_phone(p) => Err(Error::InvalidProfile(format!(
            "'{p}' is not a valid phone number"
        ))),
        _ => Ok(()),
    }
}

#[async_trait]
impl ProfileStore for JsonProfileStore {
    async fn create(&self, id: Option<String>, new: NewProfile) -> Result<Profile> {
        let email = new.email.trim().to_string();
        validate_email(&email)?;

        let (name, phone, rfid_code) = match new.role {
            Role::User => {
                let name = non_blank(new.name)
                    .ok_or_else(|| Error::InvalidProfile("name is required for users".into()))?;
                let phone = non_blank(new.phone);
                validate_phone(phone.as_deref())?;
                (Some(name), phone, non_blank(new.rfid_code))
            }
            Role::Admin => (None, None, None),
        };

        let id = non_blank(id).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut profiles = self.profiles.write().await;
        if profiles.contains_key(&id) {
            return Err(Error::ProfileExists(id));
        }

        let now = Utc::now();
        let profile = Profile {
            id: id.clone(),
            email,
            role: new.role,
            name,
            phone,
            rfid_code,
            deleted: false,
            deleted_at: None,
            deleted_by: None,
            restored_at: None,
            restored_by: None,
            created_at: now,
            updated_at: now,
        };
        self.commit(&mut profiles, profile.clone())?;

        info!(profile_id = %id, role = ?profile.role, "profile created");
        Ok(profile)
    }

    async fn get(&self, id: &str) -> Result<Profile> {
        let profiles = self.profiles.read().await;
        active(&profiles, id).cloned()
    }

    async fn update(&self, id: &str, update: ProfileUpdate) -> Result<Profile> {
        let email = non_blank(update.email);
        if let Some(email) = &email {
            validate_email(email)?;
        }
        let phone = non_blank(update.phone);
        validate_phone(phone.as_deref())?;
        let name = non_blank(update.name);

        self.mutate_active(id, move |_, profile| {
            if let Some(email) = email {
                profile.email = email;
            }
            if name.is_some() {
                profile.name = name;
            }
            if phone.is_some() {
                profile.phone = phone;
            }
            Ok(())
        })
        .await
    }

    async fn list(&self, role: Role, deleted: bool) -> Result<Vec<Profile>> {
        let profiles = self.profiles.read().await;
        let mut matching: Vec<Profile> = profiles
            .values()
            .filter(|p| p.role == role && p.deleted == deleted)
            .cloned()
            .collect();

        if deleted {
            matching.sort_by(|a, b| b.deleted_at.cmp(&a.deleted_at));
        } else {
            matching.sort_by_cached_key(|p| {
                p.name
                    .as_deref()
                    .unwrap_or(&p.email)
                    .to_lowercase()
            });
        }
        Ok(matching)
    }

    async fn soft_delete(&self, id: &str, deleted_by: &str) -> Result<Profile> {
        let mut profiles = self.profiles.write().await;
        let mut deleted = profiles
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ProfileNotFound(id.to_string()))?;
        if deleted.deleted {
            return Err(Error::ProfileAlreadyDeleted(id.to_string()));
        }

        let now = Utc::now();
        deleted.deleted = true;
        deleted.deleted_at = Some(now);
        deleted.deleted_by = Some(deleted_by.to_string());
        deleted.updated_at = now;
        self.commit(&mut profiles, deleted.clone())?;

        info!(profile_id = %id, deleted_by, "profile soft-deleted");
        Ok(deleted)
    }

    async fn restore(&self, id: &str) -> Result<Profile> {
        let mut profiles = self.profiles.write().await;
        let mut restored = profiles
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ProfileNotFound(id.to_string()))?;

        let now = Utc::now();
        restored.deleted = false;
        restored.deleted_at = None;
        restored.deleted_by = None;
        restored.restored_at = Some(now);
        restored.restored_by = Some(RESTORED_BY.to_string());
        restored.updated_at = now;
        self.commit(&mut profiles, restored.clone())?;

        info!(profile_id = %id, "profile restored");
        Ok(restored)
    }

    async fn credential_update(&self, id: &str, code: &str) -> Result<()> {
        let code = code.to_string();
        self.mutate_active(id, move |profiles, profile| {
            let taken = profiles.values().any(|p| {
                p.id != profile.id && !p.deleted && p.rfid_code.as_deref() == Some(code.as_str())
            });
            if taken {
                return Err(Error::CredentialInUse(code));
            }
            profile.rfid_code = Some(code);
            Ok(())
        })
        .await?;
        info!(profile_id = %id, "rfid code bound to profile");
        Ok(())
    }

    async fn credential_clear(&self, id: &str) -> Result<()> {
        self.mutate_active(id, |_, profile| {
            profile.rfid_code = None;
            Ok(())
        })
        .await?;
        info!(profile_id = %id, "rfid code cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(email: &str, name: &str) -> NewProfile {
        NewProfile {
            email: email.to_string(),
            role: Role::User,
            name: Some(name.to_string()),
            phone: Some("081234567890".to_string()),
            rfid_code: None,
        }
    }

    #[test]
    fn test_email_and_phone_validation() {
        assert!(is_valid_email("sari@example.com"));
        assert!(!is_valid_email("sari@"));
        assert!(!is_valid_email("no spaces@example.com"));

        assert!(is_valid_phone("+6281234567890"));
        assert!(is_valid_phone("081234567890"));
        assert!(!is_valid_phone("12-34"));
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = JsonProfileStore::in_memory();
        let created = store
            .create(Some("u1".into()), user("sari@example.com", "Sari"))
            .await
            .unwrap();
        assert_eq!(created.id, "u1");
        assert!(!created.deleted);
        assert!(created.rfid_code.is_none());

        assert_eq!(store.get("u1").await.unwrap(), created);
        assert!(matches!(
            store.get("nobody").await,
            Err(Error::ProfileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_assigns_random_id_and_rejects_duplicates() {
        let store = JsonProfileStore::in_memory();
        let created = store
            .create(None, user("a@example.com", "A"))
            .await
            .unwrap();
        assert!(uuid::Uuid::parse_str(&created.id).is_ok());

        assert!(matches!(
            store
                .create(Some(created.id.clone()), user("b@example.com", "B"))
                .await,
            Err(Error::ProfileExists(_))
        ));
    }

    #[tokio::test]
    async fn test_user_requires_name() {
        let store = JsonProfileStore::in_memory();
        let mut profile = user("a@example.com", "");
        profile.name = Some("   ".into());
        assert!(matches!(
            store.create(None, profile).await,
            Err(Error::InvalidProfile(_))
        ));
    }

    #[tokio::test]
    async fn test_soft_delete_and_restore() {
        let store = JsonProfileStore::in_memory();
        store
            .create(Some("u1".into()), user("a@example.com", "A"))
            .await
            .unwrap();

        let deleted = store.soft_delete("u1", "admin-1").await.unwrap();
        assert!(deleted.deleted);
        assert_eq!(deleted.deleted_by.as_deref(), Some("admin-1"));
        assert!(matches!(store.get("u1").await, Err(Error::ProfileDeleted(_))));
        assert!(matches!(
            store.soft_delete("u1", "admin-1").await,
            Err(Error::ProfileAlreadyDeleted(_))
        ));

        let restored = store.restore("u1").await.unwrap();
        assert!(!restored.deleted);
        assert!(restored.deleted_at.is_none());
        assert!(restored.deleted_by.is_none());
        assert!(restored.restored_at.is_some());
        assert_eq!(restored.restored_by.as_deref(), Some(RESTORED_BY));
        assert!(store.get("u1").await.is_ok());
    }

    #[tokio::test]
    async fn test_list_filters_and_sorts() {
        let store = JsonProfileStore::in_memory();
        for (id, name) in [("u1", "citra"), ("u2", "Andi"), ("u3", "budi")] {
            store
                .create(Some(id.into()), user(&format!("{id}@example.com"), name))
                .await
                .unwrap();
        }
        store
            .create(
                Some("admin".into()),
                NewProfile {
                    email: "admin@example.com".into(),
                    role: Role::Admin,
                    ..NewProfile::default()
                },
            )
            .await
            .unwrap();

        let names: Vec<String> = store
            .list(Role::User, false)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["Andi", "budi", "citra"]);

        store.soft_delete("u1", "admin").await.unwrap();
        store.soft_delete("u3", "admin").await.unwrap();
        let deleted: Vec<String> = store
            .list(Role::User, true)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(deleted, vec!["u3", "u1"]);
        assert_eq!(store.list(Role::User, false).await.unwrap().len(), 1);
        assert_eq!(store.list(Role::Admin, false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_credential_update_and_clear() {
        let store = JsonProfileStore::in_memory();
        store
            .create(Some("u1".into()), user("a@example.com", "A"))
            .await
            .unwrap();
        store
            .create(Some("u2".into()), user("b@example.com", "B"))
            .await
            .unwrap();

        store.credential_update("u1", "A1B2C3D4").await.unwrap();
        assert_eq!(
            store.get("u1").await.unwrap().rfid_code.as_deref(),
            Some("A1B2C3D4")
        );
        // Rebinding the same code to its owner is fine.
        store.credential_update("u1", "A1B2C3D4").await.unwrap();

        assert!(matches!(
            store.credential_update("u2", "A1B2C3D4").await,
            Err(Error::CredentialInUse(_))
        ));

        store.credential_clear("u1").await.unwrap();
        assert!(store.get("u1").await.unwrap().rfid_code.is_none());
        store.credential_update("u2", "A1B2C3D4").await.unwrap();
    }

    #[tokio::test]
    async fn test_credential_update_on_deleted_profile_fails() {
        let store = JsonProfileStore::in_memory();
        store
            .create(Some("u1".into()), user("a@example.com", "A"))
            .await
            .unwrap();
        store.soft_delete("u1", "admin").await.unwrap();
        assert!(matches!(
            store.credential_update("u1", "A1B2C3D4").await,
            Err(Error::ProfileDeleted(_))
        ));
    }

    #[tokio::test]
    async fn test_update_fields() {
        let store = JsonProfileStore::in_memory();
        let created = store
            .create(Some("u1".into()), user("a@example.com", "A"))
            .await
            .unwrap();

        let updated = store
            .update(
                "u1",
                ProfileUpdate {
                    name: Some("Ayu".into()),
                    ..ProfileUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name.as_deref(), Some("Ayu"));
        assert_eq!(updated.email, created.email);
        assert!(updated.updated_at >= created.updated_at);

        assert!(matches!(
            store
                .update(
                    "u1",
                    ProfileUpdate {
                        email: Some("broken".into()),
                        ..ProfileUpdate::default()
                    }
                )
                .await,
            Err(Error::InvalidProfile(_))
        ));
    }

    #[tokio::test]
    async fn test_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonProfileStore::open(Storage::new(dir.path())).unwrap();
            store
                .create(Some("u1".into()), user("a@example.com", "A"))
                .await
                .unwrap();
            store.credential_update("u1", "0BADC0DE").await.unwrap();
        }

        let reopened = JsonProfileStore::open(Storage::new(dir.path())).unwrap();
        let profile = reopened.get("u1").await.unwrap();
        assert_eq!(profile.rfid_code.as_deref(), Some("0BADC0DE"));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonProfileStore::open(Storage::new(dir.path())).unwrap();
        store
            .create(Some("u1".into()), user("a@example.com", "A"))
            .await
            .unwrap();

        // A directory where the temp file goes makes every later save fail.
        std::fs::create_dir(dir.path().join("users.json.tmp")).unwrap();

        assert!(store
            .create(Some("u2".into()), user("b@example.com", "B"))
            .await
            .is_err());
        assert!(matches!(
            store.get("u2").await,
            Err(Error::ProfileNotFound(_))
        ));

        assert!(store.credential_update("u1", "A1B2C3D4").await.is_err());
        assert!(store.get("u1").await.unwrap().rfid_code.is_none());

        assert!(store.soft_delete("u1", "admin").await.is_err());
        assert!(!store.get("u1").await.unwrap().deleted);

        std::fs::remove_dir(dir.path().join("users.json.tmp")).unwrap();
        store.soft_delete("u1", "admin").await.unwrap();
        assert!(store.restore("u1").await.is_ok());

        let reopened = JsonProfileStore::open(Storage::new(dir.path())).unwrap();
        assert!(reopened.get("u1").await.unwrap().rfid_code.is_none());
        assert!(matches!(
            reopened.get("u2").await,
            Err(Error::ProfileNotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_binds_of_one_code_admit_a_single_owner() {
        let store = std::sync::Arc::new(JsonProfileStore::in_memory());
        let ids: Vec<String> = (0..8).map(|i| format!("u{i}")).collect();
        for id in &ids {
            store
                .create(Some(id.clone()), user(&format!("{id}@example.com"), id))
                .await
                .unwrap();
        }

        let binds: Vec<_> = ids
            .iter()
            .map(|id| {
                let store = store.clone();
                let id = id.clone();
                tokio::spawn(async move { store.credential_update(&id, "CAFEBABE").await })
            })
            .collect();

        let mut bound = 0;
        for bind in binds {
            match bind.await.unwrap() {
                Ok(()) => bound += 1,
                Err(e) => assert!(matches!(e, Error::CredentialInUse(_))),
            }
        }
        assert_eq!(bound, 1);

        let holders = store
            .list(Role::User, false)
            .await
            .unwrap()
            .into_iter()
            .filter(|p| p.rfid_code.as_deref() == Some("CAFEBABE"))
            .count();
        assert_eq!(holders, 1);
    }
}
