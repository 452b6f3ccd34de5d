//! Quota definitions and per-subject resolution.
//!
//! Overrides live in the shared store so every worker resolves the same
//! effective quota. A subject without an override gets the configured default;
//! an override always replaces both fields.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::key::{quota_key, redact};
use crate::error::{Result, TurnstileError};
use crate::lock::LockManager;
use crate::store::{StateStore, StoreError};

/// How many requests a subject may make per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Quota {
    /// Window length in seconds
    pub window: u64,
    /// Requests allowed per window
    pub max: u64,
}

impl Quota {
    pub const fn new(window: u64, max: u64) -> Self {
        Self { window, max }
    }

    /// Check the quota invariants: a positive window. `max` may be zero,
    /// which blocks the subject entirely.
    pub fn validate(&self) -> Result<()> {
        if self.window == 0 {
            return Err(TurnstileError::InvalidQuota("window must be greater than zero".to_string()));
        }
        Ok(())
    }

    /// Continuous rate implied by this quota, in requests per second.
    pub fn rate_per_second(&self) -> f64 {
        if self.window == 0 {
            return 0.0;
        }
        self.max as f64 / self.window as f64
    }

    pub fn window_duration(&self) -> Duration {
        Duration::from_secs(self.window)
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s", self.max, self.window)
    }
}

/// Kind of subject a quota override applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectType {
    User,
    Api,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectType::User => "user",
            SubjectType::Api => "api",
        }
    }
}

impl fmt::Display for SubjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted quota override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub subject_type: SubjectType,
    pub subject_id: String,
    pub window_seconds: u64,
    pub max_requests: u64,
}

impl QuotaConfig {
    pub fn quota(&self) -> Quota {
        Quota::new(self.window_seconds, self.max_requests)
    }
}

/// Resolves the effective quota of users and API keys.
pub struct QuotaResolver {
    store: Arc<dyn StateStore>,
    user_default: Quota,
    api_default: Quota,
}

impl QuotaResolver {
    /// Create a resolver falling back to the given defaults.
    pub fn new(store: Arc<dyn StateStore>, user_default: Quota, api_default: Quota) -> Self {
        Self {
            store,
            user_default,
            api_default,
        }
    }

    /// The quota used when a subject has no override.
    pub fn default_quota(&self, subject_type: SubjectType) -> Quota {
        match subject_type {
            SubjectType::User => self.user_default,
            SubjectType::Api => self.api_default,
        }
    }

    /// Resolve the quota in force for a subject.
    pub async fn effective_quota(&self, subject_type: SubjectType, subject_id: &str) -> Result<Quota> {
        self.resolve(subject_type, subject_id)
            .await
            .map_err(|e| TurnstileError::from_store(subject_type.as_str(), e))
    }

    /// Same as [`effective_quota`](Self::effective_quota), leaving the store
    /// error for the caller to attribute.
    pub(crate) async fn resolve(
        &self,
        subject_type: SubjectType,
        subject_id: &str,
    ) -> std::result::Result<Quota, StoreError> {
        Ok(self
            .load_config(subject_type, subject_id)
            .await?
            .map(|config| config.quota())
            .unwrap_or_else(|| self.default_quota(subject_type)))
    }

    /// Read the override for a subject, if one is set.
    pub async fn quota_config(&self, subject_type: SubjectType, subject_id: &str) -> Result<Option<QuotaConfig>> {
        self.load_config(subject_type, subject_id)
            .await
            .map_err(|e| TurnstileError::from_store(subject_type.as_str(), e))
    }

    async fn load_config(
        &self,
        subject_type: SubjectType,
        subject_id: &str,
    ) -> std::result::Result<Option<QuotaConfig>, StoreError> {
        let key = quota_key(subject_type.as_str(), subject_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };

        let config = serde_json::from_str::<QuotaConfig>(&raw)
            .map_err(|e| e.to_string())
            .and_then(|config| match config.quota().validate() {
                Ok(()) => Ok(config),
                Err(e) => Err(e.to_string()),
            })
            .map_err(|reason| {
                warn!(subject_type = %subject_type, error = %reason, "Unreadable quota override");
                StoreError::Corrupted { key, reason }
            })?;
        Ok(Some(config))
    }

    /// Persist an override after validating it.
    pub async fn set_quota(&self, subject_type: SubjectType, subject_id: &str, quota: Quota) -> Result<()> {
        if subject_id.is_empty() {
            return Err(TurnstileError::InvalidQuota("subject id must not be empty".to_string()));
        }
        quota.validate()?;

        let config = QuotaConfig {
            subject_type,
            subject_id: subject_id.to_string(),
            window_seconds: quota.window,
            max_requests: quota.max,
        };
        self.write_config(&config).await?;

        info!(
            subject_type = %subject_type,
            subject = %log_subject_id(subject_type, subject_id),
            quota = %quota,
            "Quota override set"
        );
        Ok(())
    }

    /// Remove an override. Returns whether one existed.
    pub async fn clear_quota(&self, subject_type: SubjectType, subject_id: &str) -> Result<bool> {
        let removed = self.store.delete(&quota_key(subject_type.as_str(), subject_id)).await?;
        if removed {
            info!(
                subject_type = %subject_type,
                subject = %log_subject_id(subject_type, subject_id),
                "Quota override cleared"
            );
        }
        Ok(removed)
    }

    pub async fn set_user_quota(&self, user_id: &str, quota: Quota) -> Result<()> {
        self.set_quota(SubjectType::User, user_id, quota).await
    }

    pub async fn get_user_quota_config(&self, user_id: &str) -> Result<Option<QuotaConfig>> {
        self.quota_config(SubjectType::User, user_id).await
    }

    pub async fn set_api_quota(&self, api_key: &str, quota: Quota) -> Result<()> {
        self.set_quota(SubjectType::Api, api_key, quota).await
    }

    pub async fn get_api_quota_config(&self, api_key: &str) -> Result<Option<QuotaConfig>> {
        self.quota_config(SubjectType::Api, api_key).await
    }

    /// Move an API key's override onto a replacement key.
    ///
    /// Read, write and delete are three store calls, so the migration runs
    /// under a lock on the old key. Returns the migrated override, or `None`
    /// when the old key had none.
    pub async fn rotate_api_key(
        &self,
        locks: &LockManager,
        old_key: &str,
        new_key: &str,
    ) -> Result<Option<QuotaConfig>> {
        if new_key.is_empty() {
            return Err(TurnstileError::InvalidQuota("new API key must not be empty".to_string()));
        }
        if new_key == old_key {
            return Err(TurnstileError::InvalidQuota(
                "new API key must differ from the old one".to_string(),
            ));
        }

        let resource = rotation_resource(old_key);
        let Some(token) = locks.acquire_with_retry(&resource, locks.default_ttl()).await? else {
            return Err(TurnstileError::LockNotHeld { key: resource });
        };

        let migrated = self.migrate_api_override(old_key, new_key).await;
        let released = locks.release(&resource, &token).await;

        // A failed migration outranks a failed release.
        let migrated = migrated?;
        released?;
        Ok(migrated)
    }

    async fn migrate_api_override(&self, old_key: &str, new_key: &str) -> Result<Option<QuotaConfig>> {
        let Some(existing) = self.quota_config(SubjectType::Api, old_key).await? else {
            debug!(old_key = %redact(old_key), "No override to rotate");
            return Ok(None);
        };

        let moved = QuotaConfig {
            subject_id: new_key.to_string(),
            ..existing
        };
        self.write_config(&moved).await?;
        self.store.delete(&quota_key(SubjectType::Api.as_str(), old_key)).await?;

        info!(
            old_key = %redact(old_key),
            new_key = %redact(new_key),
            "API key quota rotated"
        );
        Ok(Some(moved))
    }

    async fn write_config(&self, config: &QuotaConfig) -> Result<()> {
        let key = quota_key(config.subject_type.as_str(), &config.subject_id);
        let encoded = serde_json::to_string(config).map_err(|e| TurnstileError::PipelineStage {
            stage: config.subject_type.as_str().to_string(),
            reason: e.to_string(),
        })?;
        self.store.set(&key, &encoded, None).await?;
        Ok(())
    }
}

/// Lock resource guarding the rotation of `old_key`.
///
/// Derived with a name-based UUID so every worker picks the same lock
/// without the key itself showing up in lock names or logs.
fn rotation_resource(old_key: &str) -> String {
    format!("quota-rotation:{}", Uuid::new_v5(&Uuid::NAMESPACE_OID, old_key.as_bytes()))
}

/// Loggable form of a subject id. API keys are redacted.
fn log_subject_id(subject_type: SubjectType, subject_id: &str) -> Cow<'_, str> {
    match subject_type {
        SubjectType::Api => Cow::Owned(redact(subject_id)),
        SubjectType::User => Cow::Borrowed(subject_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use crate::store::testing::UnreachableStore;
    use crate::store::MemoryStore;

    fn resolver() -> (Arc<MemoryStore>, QuotaResolver) {
        let store = Arc::new(MemoryStore::new());
        let resolver = QuotaResolver::new(store.clone(), Quota::new(60, 100), Quota::new(60, 1000));
        (store, resolver)
    }

    #[test]
    fn test_quota_validation() {
        assert!(Quota::new(60, 0).validate().is_ok());
        assert!(matches!(
            Quota::new(0, 10).validate(),
            Err(TurnstileError::InvalidQuota(_))
        ));
    }

    #[test]
    fn test_rate_per_second() {
        assert_eq!(Quota::new(10, 30).rate_per_second(), 3.0);
        assert_eq!(Quota::new(0, 30).rate_per_second(), 0.0);
    }

    #[tokio::test]
    async fn test_default_is_stable_across_calls() {
        let (_store, resolver) = resolver();

        for _ in 0..5 {
            let quota = resolver.effective_quota(SubjectType::User, "nobody").await.unwrap();
            assert_eq!(quota, Quota::new(60, 100));
        }
        let quota = resolver.effective_quota(SubjectType::Api, "nokey").await.unwrap();
        assert_eq!(quota, Quota::new(60, 1000));
    }

    #[tokio::test]
    async fn test_override_replaces_default_entirely() {
        let (_store, resolver) = resolver();

        resolver.set_user_quota("u1", Quota::new(3600, 5)).await.unwrap();

        let quota = resolver.effective_quota(SubjectType::User, "u1").await.unwrap();
        assert_eq!(quota, Quota::new(3600, 5));
        let config = resolver.get_user_quota_config("u1").await.unwrap().unwrap();
        assert_eq!(config.subject_type, SubjectType::User);
        assert_eq!(config.window_seconds, 3600);

        // Overrides are per subject type.
        assert!(resolver.get_api_quota_config("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_quota_is_never_persisted() {
        let (store, resolver) = resolver();

        let err = resolver.set_api_quota("k1", Quota::new(0, 10)).await.unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidQuota(_)));
        assert!(store.is_empty());

        let err = resolver.set_api_quota("", Quota::new(60, 10)).await.unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidQuota(_)));
    }

    #[tokio::test]
    async fn test_clear_quota_reverts_to_default() {
        let (_store, resolver) = resolver();

        resolver.set_api_quota("k1", Quota::new(60, 1)).await.unwrap();
        assert!(resolver.clear_quota(SubjectType::Api, "k1").await.unwrap());
        assert!(!resolver.clear_quota(SubjectType::Api, "k1").await.unwrap());

        let quota = resolver.effective_quota(SubjectType::Api, "k1").await.unwrap();
        assert_eq!(quota, Quota::new(60, 1000));
    }

    #[tokio::test]
    async fn test_corrupted_override_is_reported() {
        let (store, resolver) = resolver();
        store.set("quota:user:u1", "{not json", None).await.unwrap();

        let err = resolver.effective_quota(SubjectType::User, "u1").await.unwrap_err();
        assert!(matches!(err, TurnstileError::PipelineStage { .. }));
    }

    #[tokio::test]
    async fn test_store_failure_surfaces() {
        let resolver = QuotaResolver::new(Arc::new(UnreachableStore), Quota::new(60, 100), Quota::new(60, 1000));

        let err = resolver.effective_quota(SubjectType::User, "u1").await.unwrap_err();
        assert!(matches!(err, TurnstileError::StoreUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_rotate_api_key_moves_override() {
        let (store, resolver) = resolver();
        let locks = LockManager::new(store.clone(), LockConfig::default());

        resolver.set_api_quota("old", Quota::new(60, 7)).await.unwrap();
        let moved = resolver.rotate_api_key(&locks, "old", "new").await.unwrap().unwrap();

        assert_eq!(moved.subject_id, "new");
        assert!(resolver.get_api_quota_config("old").await.unwrap().is_none());
        assert_eq!(
            resolver.effective_quota(SubjectType::Api, "new").await.unwrap(),
            Quota::new(60, 7)
        );
        // The migration lock is gone afterwards.
        let lock = crate::ratelimit::key::lock_key(&rotation_resource("old"));
        assert!(store.get(&lock).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rotate_without_override_is_noop() {
        let (store, resolver) = resolver();
        let locks = LockManager::new(store, LockConfig::default());

        assert!(resolver.rotate_api_key(&locks, "old", "new").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rotate_fails_while_migration_lock_is_held() {
        let (store, resolver) = resolver();
        let locks = LockManager::new(
            store,
            LockConfig {
                acquire_timeout_ms: 30,
                initial_backoff_ms: 5,
                max_backoff_ms: 10,
                ..LockConfig::default()
            },
        );

        let _held = locks
            .acquire(&rotation_resource("old"), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let err = resolver.rotate_api_key(&locks, "old", "new").await.unwrap_err();
        assert!(matches!(err, TurnstileError::LockNotHeld { .. }));
    }

    #[tokio::test]
    async fn test_rotate_onto_same_key_keeps_override() {
        let (store, resolver) = resolver();
        let locks = LockManager::new(store, LockConfig::default());

        resolver.set_api_quota("k", Quota::new(60, 7)).await.unwrap();
        let err = resolver.rotate_api_key(&locks, "k", "k").await.unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidQuota(_)));

        let config = resolver.get_api_quota_config("k").await.unwrap().unwrap();
        assert_eq!(config.quota(), Quota::new(60, 7));
    }

    #[tokio::test]
    async fn test_rotate_onto_empty_key_is_rejected() {
        let (store, resolver) = resolver();
        let locks = LockManager::new(store.clone(), LockConfig::default());

        resolver.set_api_quota("k2", Quota::new(60, 7)).await.unwrap();
        let err = resolver.rotate_api_key(&locks, "k2", "").await.unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidQuota(_)));
        assert!(resolver.get_api_quota_config("k2").await.unwrap().is_some());
        // Rejected before any lock was taken.
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_rotation_lock_name_is_stable_and_hides_the_key() {
        let resource = rotation_resource("sk-live-secret");
        assert_eq!(resource, rotation_resource("sk-live-secret"));
        assert_ne!(resource, rotation_resource("sk-live-other"));
        assert!(!resource.contains("sk-live-secret"));
    }

    #[tokio::test]
    async fn test_stored_override_with_zero_window_is_corrupted() {
        let (store, resolver) = resolver();
        let bad = r#"{"subject_type":"user","subject_id":"u1","window_seconds":0,"max_requests":5}"#;
        store.set("quota:user:u1", bad, None).await.unwrap();

        match resolver.effective_quota(SubjectType::User, "u1").await {
            Err(TurnstileError::PipelineStage { stage, .. }) => assert_eq!(stage, "user"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
