//! Shared state store abstraction.
//!
//! The store is the only medium through which concurrent admission checks
//! share state. Every operation on a single key is atomic; nothing here
//! offers atomicity across keys.

mod memory;
mod timeout;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
pub use timeout::TimeoutStore;

/// Errors reported by a [`StateStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within its deadline.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// A record exists but could not be decoded.
    #[error("corrupted record at '{key}': {reason}")]
    Corrupted { key: String, reason: String },
}

/// Mutation run by [`StateStore::update`].
///
/// Receives the live value (`None` when absent or expired) and returns the
/// value to store, or `None` to leave the key untouched. An error aborts the
/// update without writing.
pub type UpdateFn<'a> = &'a mut (dyn FnMut(Option<&str>) -> Result<Option<String>, StoreError> + Send);

/// Atomic per-key primitives over a shared key-value store with expiry.
///
/// Expired keys are indistinguishable from absent keys for every operation.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the value of a live key.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Atomically add `delta` to an integer key and return the new value.
    ///
    /// A key created by this call starts at zero and gets `ttl`; an existing
    /// key keeps its expiry.
    async fn incr(&self, key: &str, delta: u64, ttl: Duration) -> Result<u64, StoreError>;

    /// Unconditionally write a value. `None` means the key never expires.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Write only if the key is absent. Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Replace the value only if it currently equals `expected`
    /// (`None` = only if absent). A successful swap resets the expiry to `ttl`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Delete the key only if it currently equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Read, transform and write a key as one atomic step.
    ///
    /// No other operation on `key` interleaves with `apply`. A write resets
    /// the expiry to `ttl`. Returns whether a value was written.
    async fn update(&self, key: &str, ttl: Duration, apply: UpdateFn<'_>) -> Result<bool, StoreError>;

    /// Reset the expiry of a live key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete a key. Returns whether a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

#[async_trait]
impl<S: StateStore + ?Sized> StateStore for Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key).await
    }

    async fn incr(&self, key: &str, delta: u64, ttl: Duration) -> Result<u64, StoreError> {
        (**self).incr(key, delta, ttl).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        (**self).set(key, value, ttl).await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        (**self).set_if_absent(key, value, ttl).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        (**self).compare_and_swap(key, expected, new_value, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        (**self).compare_and_delete(key, expected).await
    }

    async fn update(&self, key: &str, ttl: Duration, apply: UpdateFn<'_>) -> Result<bool, StoreError> {
        (**self).update(key, ttl, apply).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        (**self).expire(key, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        (**self).delete(key).await
    }
}
