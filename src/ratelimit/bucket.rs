//! Atomic read-modify-write of a bucket record.
//!
//! Buckets are JSON records transformed inside a single
//! [`StateStore::update`] call, so refill, consume and lazy initialisation
//! commit as one unit per subject and concurrent checks never conflict.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::store::{StateStore, StoreError};

/// Result of one bucket evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketDecision {
    /// Whether the request was let through
    pub admitted: bool,
    /// Tokens left (token bucket) or queue depth (leaky bucket) after the step
    pub level: f64,
    /// Estimated wait before the next request could pass; zero when admitted
    pub retry_after: Duration,
}

/// Apply `step` to the record at `key` atomically.
///
/// `init` builds the record for a subject seen for the first time (or whose
/// record expired). `step` returns the next record and whether the request is
/// admitted. The next record is written either way, so a denial still
/// persists the refreshed level and timestamp.
pub(crate) async fn update<R, I, F>(
    store: &dyn StateStore,
    key: &str,
    ttl: Duration,
    init: I,
    step: F,
) -> Result<(R, bool), StoreError>
where
    R: Serialize + DeserializeOwned + Send,
    I: Fn() -> R + Send + Sync,
    F: Fn(R) -> (R, bool) + Send + Sync,
{
    let mut outcome = None;

    store
        .update(key, ttl, &mut |current| {
            let record = match current {
                Some(raw) => serde_json::from_str(raw).map_err(|e| corrupted(key, e))?,
                None => init(),
            };
            let (next, admitted) = step(record);
            let encoded = serde_json::to_string(&next).map_err(|e| corrupted(key, e))?;
            outcome = Some((next, admitted));
            Ok(Some(encoded))
        })
        .await?;

    outcome.ok_or_else(|| StoreError::Corrupted {
        key: key.to_string(),
        reason: "store skipped the update".to_string(),
    })
}

fn corrupted(key: &str, err: serde_json::Error) -> StoreError {
    StoreError::Corrupted {
        key: key.to_string(),
        reason: err.to_string(),
    }
}

/// Seconds to report for a wait, rounded up and kept within `[1, ceiling]`.
pub(crate) fn retry_after_secs(wait: Duration, ceiling_secs: u64) -> u64 {
    let secs = wait.as_secs().saturating_add(u64::from(wait.subsec_nanos() > 0));
    secs.clamp(1, ceiling_secs.max(1))
}

/// Time needed to accumulate `amount` units at `rate` per second.
pub(crate) fn time_for(amount: f64, rate_per_sec: f64) -> Duration {
    if amount <= 0.0 {
        return Duration::ZERO;
    }
    if rate_per_sec <= 0.0 {
        return Duration::MAX;
    }
    Duration::from_millis((amount / rate_per_sec * 1000.0).ceil() as u64)
}
