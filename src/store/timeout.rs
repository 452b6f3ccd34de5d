//! Per-call deadlines for a [`StateStore`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{StateStore, StoreError, UpdateFn};

/// Wraps a store so that every call fails with [`StoreError::Timeout`] once
/// its deadline passes, instead of hanging the admission check.
pub struct TimeoutStore<S> {
    inner: S,
    timeout: Duration,
}

impl<S: StateStore> TimeoutStore<S> {
    /// Bound every call on `inner` by `timeout`.
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        key: &str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    op,
                    key = %key,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "State store call timed out"
                );
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl<S: StateStore> StateStore for TimeoutStore<S> {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.bounded("get", key, self.inner.get(key)).await
    }

    async fn incr(&self, key: &str, delta: u64, ttl: Duration) -> Result<u64, StoreError> {
        self.bounded("incr", key, self.inner.incr(key, delta, ttl)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.bounded("set", key, self.inner.set(key, value, ttl)).await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.bounded("set_if_absent", key, self.inner.set_if_absent(key, value, ttl))
            .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.bounded(
            "compare_and_swap",
            key,
            self.inner.compare_and_swap(key, expected, new_value, ttl),
        )
        .await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.bounded("compare_and_delete", key, self.inner.compare_and_delete(key, expected))
            .await
    }

    async fn update(&self, key: &str, ttl: Duration, apply: UpdateFn<'_>) -> Result<bool, StoreError> {
        self.bounded("update", key, self.inner.update(key, ttl, apply)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.bounded("expire", key, self.inner.expire(key, ttl)).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.bounded("delete", key, self.inner.delete(key)).await
    }
}
