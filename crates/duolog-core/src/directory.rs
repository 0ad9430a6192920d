//! User directory: profiles keyed by platform identity, with a reverse
//! index from anonymous id.
//!
//! Single-profile writes go through [`UserDirectory::update`], which
//! persists before committing. Transitions that must land together with
//! another entity use [`UserDirectory::prepare`], hand the prepared profile
//! to the owner of the other entity as part of one batch, and then call
//! [`UserDirectory::commit`]. The caller must hold the user's lock across
//! that sequence.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use duolog_shared::models::UserProfile;
use duolog_shared::repository::{Mutation, Repository};
use duolog_shared::types::{AnonId, Gender, Preference, UserId};

use crate::error::{PreconditionError, Result};

/// Onboarding answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub gender: Gender,
    pub preference: Preference,
    #[serde(default)]
    pub allow_files: bool,
}

/// Partial settings change; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub gender: Option<Gender>,
    pub preference: Option<Preference>,
    pub allow_files: Option<bool>,
}

impl SettingsUpdate {
    pub fn apply_to(&self, profile: &mut UserProfile) {
        if let Some(gender) = self.gender {
            profile.gender = gender;
        }
        if let Some(preference) = self.preference {
            profile.preference = preference;
        }
        if let Some(allow_files) = self.allow_files {
            profile.allow_files = allow_files;
        }
    }
}

#[derive(Default)]
struct DirectoryState {
    users: HashMap<UserId, UserProfile>,
    by_anon: HashMap<AnonId, UserId>,
}

impl DirectoryState {
    fn insert(&mut self, profile: UserProfile) {
        self.by_anon.insert(profile.anon_id.clone(), profile.user_id);
        self.users.insert(profile.user_id, profile);
    }
}

pub struct UserDirectory {
    state: RwLock<DirectoryState>,
    repo: Arc<dyn Repository>,
}

impl UserDirectory {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self::with_users(repo, Vec::new())
    }

    /// Build from previously persisted profiles.
    pub fn with_users(repo: Arc<dyn Repository>, users: Vec<UserProfile>) -> Self {
        let mut state = DirectoryState::default();
        for profile in users {
            state.insert(profile);
        }
        Self {
            state: RwLock::new(state),
            repo,
        }
    }

    /// Create a profile on first contact with a fresh, unique anonymous id.
    pub async fn register(
        &self,
        user_id: UserId,
        registration: &Registration,
        now: DateTime<Utc>,
    ) -> Result<UserProfile> {
        let mut state = self.state.write().await;
        if state.users.contains_key(&user_id) {
            return Err(PreconditionError::AlreadyRegistered.into());
        }

        let anon_id = loop {
            let candidate = AnonId::generate();
            if !state.by_anon.contains_key(&candidate) {
                break candidate;
            }
            debug!(anon = %candidate, "Anonymous id collision, drawing again");
        };

        let profile = UserProfile::new(
            user_id,
            anon_id,
            registration.gender,
            registration.preference,
            registration.allow_files,
            now,
        );
        self.repo.apply(&[Mutation::PutUser(profile.clone())])?;
        state.insert(profile.clone());

        info!(user = %user_id, anon = %profile.anon_id, "User registered");
        Ok(profile)
    }

    pub async fn get(&self, user_id: UserId) -> Option<UserProfile> {
        self.state.read().await.users.get(&user_id).cloned()
    }

    pub async fn require(&self, user_id: UserId) -> Result<UserProfile> {
        self.get(user_id)
            .await
            .ok_or_else(|| PreconditionError::NotRegistered.into())
    }

    pub async fn find_by_anon(&self, anon_id: &AnonId) -> Option<UserProfile> {
        let state = self.state.read().await;
        state
            .by_anon
            .get(anon_id)
            .and_then(|user_id| state.users.get(user_id))
            .cloned()
    }

    /// Mutate, persist, then commit one profile.
    pub async fn update<F>(&self, user_id: UserId, mutate: F) -> Result<UserProfile>
    where
        F: FnOnce(&mut UserProfile),
    {
        let mut state = self.state.write().await;
        let mut profile = state
            .users
            .get(&user_id)
            .cloned()
            .ok_or(PreconditionError::NotRegistered)?;
        mutate(&mut profile);

        self.repo.apply(&[Mutation::PutUser(profile.clone())])?;
        state.users.insert(user_id, profile.clone());
        Ok(profile)
    }

    /// Return a mutated copy without persisting or committing it.
    pub async fn prepare<F>(&self, user_id: UserId, mutate: F) -> Result<UserProfile>
    where
        F: FnOnce(&mut UserProfile),
    {
        let mut profile = self.require(user_id).await?;
        mutate(&mut profile);
        Ok(profile)
    }

    /// Install a profile that has already been persisted by the caller.
    pub async fn commit(&self, profile: UserProfile) {
        self.state.write().await.users.insert(profile.user_id, profile);
    }

    pub async fn update_settings(
        &self,
        user_id: UserId,
        settings: &SettingsUpdate,
        now: DateTime<Utc>,
    ) -> Result<UserProfile> {
        self.update(user_id, |profile| {
            settings.apply_to(profile);
            profile.last_active_at = now;
        })
        .await
    }

    pub async fn touch(&self, user_id: UserId, now: DateTime<Utc>) -> Result<UserProfile> {
        self.update(user_id, |profile| {
            profile.last_active_at = profile.last_active_at.max(now)
        })
        .await
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.users.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
