//! Per-user premium tiers and feature gating

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{CleanupError, Result};

/// Subscription tier, stored as 0/1/2
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PremiumLevel {
    #[default]
    Free = 0,
    Basic = 1,
    Pro = 2,
}

impl TryFrom<u8> for PremiumLevel {
    type Error = CleanupError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PremiumLevel::Free),
            1 => Ok(PremiumLevel::Basic),
            2 => Ok(PremiumLevel::Pro),
            other => Err(CleanupError::ConfigError(format!(
                "Invalid premium level {} (expected 0, 1 or 2)",
                other
            ))),
        }
    }
}

impl From<PremiumLevel> for u8 {
    fn from(level: PremiumLevel) -> u8 {
        level as u8
    }
}

impl fmt::Display for PremiumLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PremiumLevel::Free => write!(f, "free"),
            PremiumLevel::Basic => write!(f, "basic"),
            PremiumLevel::Pro => write!(f, "pro"),
        }
    }
}

/// Features behind a premium tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    AutoUnsubscribe,
    ScheduledCleaning,
}

impl Feature {
    pub fn required_level(self) -> PremiumLevel {
        match self {
            Feature::AutoUnsubscribe => PremiumLevel::Basic,
            Feature::ScheduledCleaning => PremiumLevel::Pro,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feature::AutoUnsubscribe => write!(f, "auto-unsubscribe"),
            Feature::ScheduledCleaning => write!(f, "scheduled cleaning"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEntitlement {
    pub id: Uuid,
    pub email: String,
    pub premium_level: PremiumLevel,
    pub subscription_valid: bool,
    pub subscription_expiry: Option<DateTime<Utc>>,
    pub preferences: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserEntitlement {
    fn new(email: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            email,
            premium_level: PremiumLevel::Free,
            subscription_valid: false,
            subscription_expiry: None,
            preferences: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial subscription update; `None` leaves the field unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    pub level: Option<PremiumLevel>,
    pub valid: Option<bool>,
    pub expiry: Option<DateTime<Utc>>,
}

/// Persistence for user entitlements
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<UserEntitlement>>;
    async fn find_by_email(&self, email: &str) -> Result<Option<UserEntitlement>>;
    async fn put(&self, user: UserEntitlement) -> Result<()>;
    async fn delete(&self, id: Uuid) -> Result<bool>;
    async fn list(&self) -> Result<Vec<UserEntitlement>>;
}

/// Process-lifetime store
#[derive(Debug, Default)]
pub struct InMemoryUserStore {
    users: RwLock<HashMap<Uuid, UserEntitlement>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn get(&self, id: Uuid) -> Result<Option<UserEntitlement>> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserEntitlement>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn put(&self, user: UserEntitlement) -> Result<()> {
        self.users.write().await.insert(user.id, user);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.users.write().await.remove(&id).is_some())
    }

    async fn list(&self) -> Result<Vec<UserEntitlement>> {
        Ok(self.users.read().await.values().cloned().collect())
    }
}

/// User identities and their premium access
pub struct EntitlementStore<S = InMemoryUserStore> {
    store: S,
    // Serializes every read-modify-write against the store: concurrent first
    // lookups yield one identity and concurrent field updates never drop
    // each other's writes
    write_lock: Mutex<()>,
}

impl EntitlementStore<InMemoryUserStore> {
    pub fn in_memory() -> Self {
        Self::new(InMemoryUserStore::new())
    }
}

impl<S: UserStore> EntitlementStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Look up a user by email, creating a free-tier user on first sight
    pub async fn get_or_create_user(&self, email: &str) -> Result<UserEntitlement> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(CleanupError::ConfigError("User email must not be empty".to_string()));
        }

        let _guard = self.write_lock.lock().await;
        if let Some(existing) = self.store.find_by_email(&email).await? {
            return Ok(existing);
        }

        let user = UserEntitlement::new(email);
        info!(user_id = %user.id, email = %user.email, "Created user");
        self.store.put(user.clone()).await?;
        Ok(user)
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<Option<UserEntitlement>> {
        self.store.get(user_id).await
    }

    pub async fn update_subscription(
        &self,
        user_id: Uuid,
        update: SubscriptionUpdate,
    ) -> Result<Option<UserEntitlement>> {
        let _guard = self.write_lock.lock().await;
        let Some(mut user) = self.store.get(user_id).await? else {
            return Ok(None);
        };

        if let Some(level) = update.level {
            user.premium_level = level;
        }
        if let Some(valid) = update.valid {
            user.subscription_valid = valid;
        }
        if let Some(expiry) = update.expiry {
            user.subscription_expiry = Some(expiry);
        }
        user.updated_at = Utc::now();

        debug!(
            user_id = %user.id,
            level = %user.premium_level,
            valid = user.subscription_valid,
            "Updated subscription"
        );
        self.store.put(user.clone()).await?;
        Ok(Some(user))
    }

    /// True when the user exists, has a valid subscription and at least `required` tier
    ///
    /// Expiry dates are not consulted here; see [`Self::expire_lapsed`].
    pub async fn has_access(&self, user_id: Uuid, required: PremiumLevel) -> Result<bool> {
        Ok(self
            .store
            .get(user_id)
            .await?
            .is_some_and(|u| u.subscription_valid && u.premium_level >= required))
    }

    /// Fail with [`CleanupError::AccessDenied`] unless the user's tier covers `feature`
    pub async fn require_feature(&self, user_id: Uuid, feature: Feature) -> Result<()> {
        let required = feature.required_level();
        if self.has_access(user_id, required).await? {
            Ok(())
        } else {
            Err(CleanupError::AccessDenied(format!(
                "{} requires an active {} subscription",
                feature, required
            )))
        }
    }

    /// Shallow-merge `prefs` into the stored preferences
    pub async fn update_preferences(
        &self,
        user_id: Uuid,
        prefs: Map<String, Value>,
    ) -> Result<Option<UserEntitlement>> {
        let _guard = self.write_lock.lock().await;
        let Some(mut user) = self.store.get(user_id).await? else {
            return Ok(None);
        };

        user.preferences.extend(prefs);
        user.updated_at = Utc::now();
        self.store.put(user.clone()).await?;
        Ok(Some(user))
    }

    pub async fn get_preferences(&self, user_id: Uuid) -> Result<Option<Map<String, Value>>> {
        Ok(self.store.get(user_id).await?.map(|u| u.preferences))
    }

    /// Invalidate subscriptions whose expiry is at or before `now`
    ///
    /// Returns how many users changed.
    pub async fn expire_lapsed(&self, now: DateTime<Utc>) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut changed = 0;
        for mut user in self.store.list().await? {
            let lapsed = user.subscription_valid
                && user.subscription_expiry.is_some_and(|expiry| expiry <= now);
            if lapsed {
                user.subscription_valid = false;
                user.updated_at = now;
                info!(user_id = %user.id, "Subscription lapsed");
                self.store.put(user).await?;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
