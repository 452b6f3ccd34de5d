//! In-process implementation of [`StateStore`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{StateStore, StoreError, UpdateFn};
use crate::clock::{Clock, SystemClock};

/// A stored value and its absolute expiry.
#[derive(Debug, Clone)]
struct Slot {
    value: String,
    /// Epoch millis after which the slot is dead; `None` never expires.
    expires_at_ms: Option<u64>,
}

impl Slot {
    fn new(value: impl Into<String>, now_ms: u64, ttl: Option<Duration>) -> Self {
        Self {
            value: value.into(),
            expires_at_ms: ttl.map(|ttl| now_ms.saturating_add(ttl.as_millis() as u64)),
        }
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expires_at_ms, Some(deadline) if now_ms >= deadline)
    }
}

/// A shared store held in process memory.
///
/// Each key is guarded by its shard lock for the duration of an operation,
/// which makes every trait method atomic per key. Expiry is applied lazily on
/// access and eagerly by [`MemoryStore::purge_expired`].
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that reads time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.entries.iter().filter(|e| !e.value().is_expired(now)).count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, slot| !slot.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Periodically purge expired keys in the background.
    ///
    /// Abort the returned handle to stop the sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        info!(interval_secs = every.as_secs(), "Starting expired key sweeper");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let removed = store.purge_expired();
                if removed > 0 {
                    debug!(removed, "Purged expired keys");
                }
            }
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_ms();
        Ok(self
            .entries
            .get(key)
            .filter(|slot| !slot.is_expired(now))
            .map(|slot| slot.value.clone()))
    }

    async fn incr(&self, key: &str, delta: u64, ttl: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired(now) => {
                let current: u64 = occupied.get().value.parse().map_err(|_| StoreError::Corrupted {
                    key: key.to_string(),
                    reason: "value is not an integer".to_string(),
                })?;
                let next = current.saturating_add(delta);
                occupied.get_mut().value = next.to_string();
                Ok(next)
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(Slot::new(delta.to_string(), now, Some(ttl)));
                Ok(delta)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(delta.to_string(), now, Some(ttl)));
                Ok(delta)
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        self.entries.insert(key.to_string(), Slot::new(value, now, ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) if !occupied.get().is_expired(now) => Ok(false),
            Entry::Occupied(mut occupied) => {
                occupied.insert(Slot::new(value, now, Some(ttl)));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(value, now, Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = Some(occupied.get())
                    .filter(|slot| !slot.is_expired(now))
                    .map(|slot| slot.value.as_str());
                if current != expected {
                    return Ok(false);
                }
                occupied.insert(Slot::new(new_value, now, Some(ttl)));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(Slot::new(new_value, now, Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        Ok(self
            .entries
            .remove_if(key, |_, slot| !slot.is_expired(now) && slot.value == expected)
            .is_some())
    }

    async fn update(&self, key: &str, ttl: Duration, apply: UpdateFn<'_>) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        // `apply` runs while the entry's shard lock is held.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = Some(occupied.get())
                    .filter(|slot| !slot.is_expired(now))
                    .map(|slot| slot.value.as_str());
                match apply(current)? {
                    Some(next) => {
                        occupied.insert(Slot::new(next, now, Some(ttl)));
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            Entry::Vacant(vacant) => match apply(None)? {
                Some(next) => {
                    vacant.insert(Slot::new(next, now, Some(ttl)));
                    Ok(true)
                }
                None => Ok(false),
            },
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        match self.entries.get_mut(key) {
            Some(mut slot) if !slot.is_expired(now) => {
                slot.expires_at_ms = Some(now.saturating_add(ttl.as_millis() as u64));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, slot)| !slot.is_expired(now))
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_at(now_ms: u64) -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(now_ms));
        let store = MemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_incr_creates_and_accumulates() {
        let (_clock, store) = store_at(0);
        let ttl = Duration::from_secs(10);

        assert_eq!(store.incr("k", 1, ttl).await.unwrap(), 1);
        assert_eq!(store.incr("k", 4, ttl).await.unwrap(), 5);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn test_incr_keeps_original_expiry() {
        let (clock, store) = store_at(0);

        store.incr("k", 1, Duration::from_secs(10)).await.unwrap();
        clock.advance(Duration::from_secs(9));
        store.incr("k", 1, Duration::from_secs(10)).await.unwrap();
        clock.advance(Duration::from_secs(1));

        // The second increment must not have pushed the deadline out.
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.incr("k", 1, Duration::from_secs(10)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_incr_rejects_non_integer() {
        let (_clock, store) = store_at(0);
        store.set("k", "abc", None).await.unwrap();

        let err = store.incr("k", 1, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupted { .. }));
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let (clock, store) = store_at(0);
        let ttl = Duration::from_millis(500);

        assert!(store.set_if_absent("lock", "a", ttl).await.unwrap());
        assert!(!store.set_if_absent("lock", "b", ttl).await.unwrap());

        clock.advance(Duration::from_millis(500));
        assert!(store.set_if_absent("lock", "b", ttl).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let (clock, store) = store_at(0);
        let ttl = Duration::from_secs(1);

        assert!(store.compare_and_swap("k", None, "v1", ttl).await.unwrap());
        assert!(!store.compare_and_swap("k", None, "v2", ttl).await.unwrap());
        assert!(!store.compare_and_swap("k", Some("v0"), "v2", ttl).await.unwrap());
        assert!(store.compare_and_swap("k", Some("v1"), "v2", ttl).await.unwrap());

        // An expired key counts as absent.
        clock.advance(Duration::from_secs(1));
        assert!(!store.compare_and_swap("k", Some("v2"), "v3", ttl).await.unwrap());
        assert!(store.compare_and_swap("k", None, "v3", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let (_clock, store) = store_at(0);
        store.set("k", "owner", None).await.unwrap();

        assert!(!store.compare_and_delete("k", "intruder").await.unwrap());
        assert!(store.get("k").await.unwrap().is_some());
        assert!(store.compare_and_delete("k", "owner").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expire_and_delete() {
        let (clock, store) = store_at(0);
        store.set("k", "v", None).await.unwrap();

        assert!(store.expire("k", Duration::from_secs(2)).await.unwrap());
        assert!(!store.expire("missing", Duration::from_secs(2)).await.unwrap());
        clock.advance(Duration::from_secs(2));
        assert!(!store.delete("k").await.unwrap());

        store.set("k", "v", None).await.unwrap();
        assert!(store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (clock, store) = store_at(0);
        store.set("short", "v", Some(Duration::from_secs(1))).await.unwrap();
        store.set("forever", "v", None).await.unwrap();

        clock.advance(Duration::from_secs(5));
        assert_eq!(store.len(), 1);
        assert_eq!(store.purge_expired(), 1);
        assert!(!store.is_empty());
    }

    #[tokio::test]
    async fn test_update_sees_live_value_only() {
        let (clock, store) = store_at(0);
        let ttl = Duration::from_secs(1);

        let mut seen = Vec::new();
        let mut append = |current: Option<&str>| -> Result<Option<String>, StoreError> {
            seen.push(current.map(str::to_string));
            Ok(Some(format!("{}x", current.unwrap_or(""))))
        };
        assert!(store.update("k", ttl, &mut append).await.unwrap());
        assert!(store.update("k", ttl, &mut append).await.unwrap());
        clock.advance(ttl);
        assert!(store.update("k", ttl, &mut append).await.unwrap());

        assert_eq!(seen, vec![None, Some("x".to_string()), None]);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_update_can_decline_or_fail_without_writing() {
        let (_clock, store) = store_at(0);
        store.set("k", "v", None).await.unwrap();

        assert!(!store.update("k", Duration::from_secs(1), &mut |_| Ok(None)).await.unwrap());
        let err = store
            .update("k", Duration::from_secs(1), &mut |_| {
                Err(StoreError::Corrupted {
                    key: "k".to_string(),
                    reason: "bad".to_string(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Corrupted { .. }));
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_lose_nothing() {
        let store = Arc::new(MemoryStore::new());
        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .update("n", Duration::from_secs(60), &mut |current| {
                            let n: u64 = current.and_then(|v| v.parse().ok()).unwrap_or(0);
                            Ok(Some((n + 1).to_string()))
                        })
                        .await
                })
            })
            .collect();

        for task in futures::future::join_all(tasks).await {
            assert!(task.unwrap().unwrap());
        }
        assert_eq!(store.get("n").await.unwrap().as_deref(), Some("64"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_incr_loses_no_updates() {
        let store = Arc::new(MemoryStore::new());
        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.incr("hits", 1, Duration::from_secs(60)).await })
            })
            .collect();

        for task in futures::future::join_all(tasks).await {
            task.unwrap().unwrap();
        }
        assert_eq!(store.get("hits").await.unwrap().as_deref(), Some("64"));
    }
}
