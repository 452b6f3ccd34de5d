//! Token bucket burst limiter.
//!
//! Capacity refills continuously at a fixed rate; each admitted request
//! spends one token. Records are created full on first access.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::bucket::{self, BucketDecision};
use super::key::{log_identity, token_bucket_key};
use crate::clock::Clock;
use crate::store::{StateStore, StoreError};

/// Persisted state of one subject's token bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketRecord {
    pub tokens: f64,
    pub capacity: u64,
    pub refill_rate_per_sec: f64,
    pub last_refill_ms: u64,
}

impl TokenBucketRecord {
    fn full(capacity: u64, refill_rate_per_sec: f64, now_ms: u64) -> Self {
        Self {
            tokens: capacity as f64,
            capacity,
            refill_rate_per_sec,
            last_refill_ms: now_ms,
        }
    }

    /// Bring the record up to `now_ms` under the given parameters.
    ///
    /// The caller's capacity and rate win over the stored ones so that a
    /// changed burst quota takes effect on the next request.
    fn refilled(self, capacity: u64, refill_rate_per_sec: f64, now_ms: u64) -> Self {
        let elapsed_ms = now_ms.saturating_sub(self.last_refill_ms);
        let replenished = elapsed_ms as f64 / 1000.0 * refill_rate_per_sec;
        Self {
            tokens: (self.tokens + replenished).clamp(0.0, capacity as f64),
            capacity,
            refill_rate_per_sec,
            last_refill_ms: now_ms.max(self.last_refill_ms),
        }
    }
}

/// Per-subject token buckets in the shared store.
pub struct TokenBucket {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    idle_ttl: Duration,
}

impl TokenBucket {
    /// `idle_ttl` bounds how long an untouched record is kept.
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, idle_ttl: Duration) -> Self {
        Self { store, clock, idle_ttl }
    }

    /// Refill the subject's bucket, then spend one token if one is available.
    pub async fn consume(
        &self,
        subject: &str,
        capacity: u64,
        refill_rate_per_sec: f64,
    ) -> Result<BucketDecision, StoreError> {
        let key = token_bucket_key(subject);
        let clock = self.clock.as_ref();

        let (record, admitted) = bucket::update(
            self.store.as_ref(),
            &key,
            self.idle_ttl,
            || TokenBucketRecord::full(capacity, refill_rate_per_sec, clock.now_ms()),
            |record: TokenBucketRecord| {
                let mut record = record.refilled(capacity, refill_rate_per_sec, clock.now_ms());
                if record.tokens >= 1.0 {
                    record.tokens -= 1.0;
                    (record, true)
                } else {
                    (record, false)
                }
            },
        )
        .await?;

        trace!(
            subject = %log_identity(subject),
            tokens = record.tokens,
            admitted,
            "Token bucket evaluated"
        );

        let retry_after = if admitted {
            Duration::ZERO
        } else {
            debug!(subject = %log_identity(subject), capacity, "Token bucket empty");
            bucket::time_for(1.0 - record.tokens, refill_rate_per_sec)
        };

        Ok(BucketDecision {
            admitted,
            level: record.tokens,
            retry_after,
        })
    }

    /// Tokens the subject could spend right now, without spending any.
    pub async fn available(
        &self,
        subject: &str,
        capacity: u64,
        refill_rate_per_sec: f64,
    ) -> Result<f64, StoreError> {
        let key = token_bucket_key(subject);
        let now_ms = self.clock.now_ms();

        let Some(raw) = self.store.get(&key).await? else {
            return Ok(capacity as f64);
        };
        let record: TokenBucketRecord = serde_json::from_str(&raw).map_err(|e| StoreError::Corrupted {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        Ok(record.refilled(capacity, refill_rate_per_sec, now_ms).tokens)
    }
}
