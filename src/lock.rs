//! Distributed mutual exclusion over the shared state store.
//!
//! A lock is a single key holding a random owner token with a TTL. Acquire is
//! one "set if absent"; release and extend are conditional on the token, so a
//! holder whose lock already expired can never remove or prolong a lock that
//! someone else now owns. The TTL frees locks of crashed holders.
//!
//! Locks are for rare multi-step administrative work, never for the
//! per-request admission path.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::key::lock_key;
use crate::store::StateStore;

/// Opaque proof of lock ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LockToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Acquires and releases locks on named resources.
pub struct LockManager {
    store: Arc<dyn StateStore>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(store: Arc<dyn StateStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    /// TTL used when callers have no better estimate of their critical section.
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.config.default_ttl_ms)
    }

    /// Try once to take the lock. Returns `None` if someone else holds it.
    pub async fn acquire(&self, resource: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let key = lock_key(resource);
        let token = LockToken::generate();

        if self.store.set_if_absent(&key, token.as_str(), ttl).await? {
            debug!(
                resource = %resource,
                ttl_ms = ttl.as_millis() as u64,
                "Lock acquired"
            );
            Ok(Some(token))
        } else {
            debug!(resource = %resource, "Lock busy");
            Ok(None)
        }
    }

    /// Retry [`acquire`](Self::acquire) with jittered exponential backoff until
    /// the configured acquire timeout passes.
    pub async fn acquire_with_retry(&self, resource: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let deadline = Instant::now() + Duration::from_millis(self.config.acquire_timeout_ms);
        let mut backoff_ms = self.config.initial_backoff_ms.max(1);

        loop {
            if let Some(token) = self.acquire(resource, ttl).await? {
                return Ok(Some(token));
            }

            let jitter = rand::thread_rng().gen_range(0..=backoff_ms / 2);
            let wait = Duration::from_millis(backoff_ms + jitter);
            if Instant::now() + wait > deadline {
                debug!(resource = %resource, "Gave up waiting for lock");
                return Ok(None);
            }

            tokio::time::sleep(wait).await;
            backoff_ms = (backoff_ms * 2).min(self.config.max_backoff_ms.max(1));
        }
    }

    /// Release a lock held under `token`.
    ///
    /// Fails with [`TurnstileError::LockNotHeld`] when the lock expired or
    /// belongs to another owner; the lock itself is left untouched.
    pub async fn release(&self, resource: &str, token: &LockToken) -> Result<()> {
        let key = lock_key(resource);
        if self.store.compare_and_delete(&key, token.as_str()).await? {
            debug!(resource = %resource, "Lock released");
            Ok(())
        } else {
            warn!(resource = %resource, "Release attempted without holding the lock");
            Err(TurnstileError::LockNotHeld {
                key: resource.to_string(),
            })
        }
    }

    /// Push the expiry of a held lock to `ttl` from now.
    pub async fn extend(&self, resource: &str, token: &LockToken, ttl: Duration) -> Result<()> {
        let key = lock_key(resource);
        let renewed = self
            .store
            .compare_and_swap(&key, Some(token.as_str()), token.as_str(), ttl)
            .await?;
        if renewed {
            debug!(resource = %resource, ttl_ms = ttl.as_millis() as u64, "Lock extended");
            Ok(())
        } else {
            Err(TurnstileError::LockNotHeld {
                key: resource.to_string(),
            })
        }
    }
}
