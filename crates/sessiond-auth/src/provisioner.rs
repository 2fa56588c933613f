//! Profile provisioning
//!
//! Guarantees one profile row per user under concurrent triggers:
//!
//! 1. fetch; an existing row is returned as is
//! 2. take the per-user [`ProvisioningLock`]; if another caller holds it,
//!    report [`ProvisionOutcome::InProgress`]
//! 3. fetch again under the lock
//! 4. insert; a uniqueness conflict means a concurrent writer won, so the
//!    row is fetched instead of surfacing the conflict
//!
//! The lock guard is dropped on every exit path.

use crate::config::ProvisioningConfig;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sessiond_error::{ErrorContext, SessionError};
use sessiond_resilience::ResilientExecutor;
use sessiond_traits::{Identity, NewProfile, Profile, ProfileStore, UserId};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::time::Instant;

/// Whether a user is being provisioned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// No provisioning running
    Idle,
    /// Provisioning started at `since`
    InFlight {
        /// Lock acquisition time
        since: Instant,
    },
}

/// Per-user mutual exclusion for profile creation
#[derive(Debug, Clone, Default)]
pub struct ProvisioningLock {
    held: Arc<DashMap<UserId, Instant>>,
}

impl ProvisioningLock {
    /// Create an empty lock set
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `user_id`, or `None` if it is already held.
    ///
    /// Check and insert happen under one shard lock.
    pub fn try_acquire(&self, user_id: &UserId) -> Option<ProvisioningGuard> {
        match self.held.entry(user_id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                Some(ProvisioningGuard {
                    held: Arc::clone(&self.held),
                    user_id: user_id.clone(),
                })
            }
        }
    }

    /// Lock state for `user_id`
    pub fn state(&self, user_id: &UserId) -> KeyState {
        match self.held.get(user_id) {
            Some(since) => KeyState::InFlight { since: *since },
            None => KeyState::Idle,
        }
    }

    /// Number of users currently locked
    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// True when nobody is being provisioned
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// Releases a user's provisioning lock when dropped
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ProvisioningGuard {
    held: Arc<DashMap<UserId, Instant>>,
    user_id: UserId,
}

impl ProvisioningGuard {
    /// The locked user
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }
}

impl Drop for ProvisioningGuard {
    fn drop(&mut self) {
        self.held.remove(&self.user_id);
    }
}

/// Result of [`ProfileProvisioner::ensure_profile`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The row already existed
    Existing(Profile),
    /// This call created the row
    Created(Profile),
    /// A concurrent writer created the row during this call
    Recovered(Profile),
    /// Another caller holds the lock and will finish provisioning
    InProgress,
}

impl ProvisionOutcome {
    /// The profile, unless provisioning is still in progress elsewhere
    pub fn profile(&self) -> Option<&Profile> {
        match self {
            ProvisionOutcome::Existing(profile)
            | ProvisionOutcome::Created(profile)
            | ProvisionOutcome::Recovered(profile) => Some(profile),
            ProvisionOutcome::InProgress => None,
        }
    }

    /// Take the profile
    pub fn into_profile(self) -> Option<Profile> {
        match self {
            ProvisionOutcome::Existing(profile)
            | ProvisionOutcome::Created(profile)
            | ProvisionOutcome::Recovered(profile) => Some(profile),
            ProvisionOutcome::InProgress => None,
        }
    }
}

/// Creates or fetches the profile row of a signed-in user
pub struct ProfileProvisioner {
    profiles: Arc<dyn ProfileStore>,
    executor: ResilientExecutor,
    config: ProvisioningConfig,
    lock: ProvisioningLock,
}

impl std::fmt::Debug for ProfileProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileProvisioner")
            .field("locked", &self.lock.len())
            .finish()
    }
}

impl ProfileProvisioner {
    /// Create a provisioner
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        executor: ResilientExecutor,
        config: ProvisioningConfig,
    ) -> Self {
        Self {
            profiles,
            executor,
            config,
            lock: ProvisioningLock::new(),
        }
    }

    /// The per-user lock set
    pub fn lock(&self) -> &ProvisioningLock {
        &self.lock
    }

    /// Make sure `identity` has exactly one profile row
    pub async fn ensure_profile(
        &self,
        identity: &Identity,
    ) -> Result<ProvisionOutcome, SessionError> {
        let user_id = &identity.id;

        if let Some(profile) = self.fetch(user_id).await? {
            return Ok(ProvisionOutcome::Existing(profile));
        }

        let Some(_guard) = self.lock.try_acquire(user_id) else {
            tracing::debug!(user_id = %user_id, "Profile provisioning already in progress");
            return Ok(ProvisionOutcome::InProgress);
        };

        if let Some(profile) = self.fetch(user_id).await? {
            tracing::debug!(user_id = %user_id, "Profile appeared before insert");
            return Ok(ProvisionOutcome::Existing(profile));
        }

        let row = NewProfile::for_identity(identity, SystemTime::now());
        match self.insert(&row).await {
            Ok(profile) => {
                tracing::info!(user_id = %user_id, "Profile created");
                Ok(ProvisionOutcome::Created(profile))
            }
            Err(SessionError::Conflict(reason)) => {
                tracing::info!(
                    user_id = %user_id,
                    %reason,
                    "Profile insert lost the race, fetching winner"
                );
                let profile = self
                    .fetch(user_id)
                    .await?
                    .with_context(|| format!("profile for {user_id} after conflicting insert"))?;
                Ok(ProvisionOutcome::Recovered(profile))
            }
            Err(err) => {
                tracing::warn!(user_id = %user_id, error = %err, "Profile provisioning failed");
                Err(err)
            }
        }
    }

    async fn fetch(&self, user_id: &UserId) -> Result<Option<Profile>, SessionError> {
        let profiles = &self.profiles;
        self.executor
            .execute_resiliently(
                "fetch_profile",
                &self.config.timeout,
                &self.config.retry,
                || async move { profiles.fetch_profile(user_id).await.map_err(SessionError::from) },
            )
            .await
    }

    async fn insert(&self, row: &NewProfile) -> Result<Profile, SessionError> {
        let profiles = &self.profiles;
        self.executor
            .execute_resiliently(
                "insert_profile",
                &self.config.timeout,
                &self.config.retry,
                || async move { profiles.insert_profile(row).await.map_err(SessionError::from) },
            )
            .await
    }
}
