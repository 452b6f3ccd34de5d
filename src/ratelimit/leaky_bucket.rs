//! Leaky bucket burst limiter.
//!
//! Where the token bucket limits the rate of admission, the leaky bucket
//! limits the depth of recently admitted work: the level drains at a fixed
//! rate and every admitted request raises it by one.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::bucket::{self, BucketDecision};
use super::key::{leaky_bucket_key, log_identity};
use crate::clock::Clock;
use crate::store::{StateStore, StoreError};

/// Persisted state of one subject's leaky bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakyBucketRecord {
    pub level: f64,
    pub burst_capacity: u64,
    pub leak_rate_per_sec: f64,
    pub last_leak_ms: u64,
}

impl LeakyBucketRecord {
    fn empty(burst_capacity: u64, leak_rate_per_sec: f64, now_ms: u64) -> Self {
        Self {
            level: 0.0,
            burst_capacity,
            leak_rate_per_sec,
            last_leak_ms: now_ms,
        }
    }

    fn drained(self, burst_capacity: u64, leak_rate_per_sec: f64, now_ms: u64) -> Self {
        let elapsed_ms = now_ms.saturating_sub(self.last_leak_ms);
        let leaked = elapsed_ms as f64 / 1000.0 * leak_rate_per_sec;
        Self {
            level: (self.level - leaked).clamp(0.0, burst_capacity as f64),
            burst_capacity,
            leak_rate_per_sec,
            last_leak_ms: now_ms.max(self.last_leak_ms),
        }
    }
}

/// Per-subject leaky buckets in the shared store.
pub struct LeakyBucket {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    idle_ttl: Duration,
}

impl LeakyBucket {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, idle_ttl: Duration) -> Self {
        Self { store, clock, idle_ttl }
    }

    /// Drain the subject's bucket, then admit if it is below capacity.
    ///
    /// The level never exceeds `burst_capacity`: a request admitted with a
    /// fractional level just under capacity fills the bucket exactly.
    pub async fn admit(
        &self,
        subject: &str,
        leak_rate_per_sec: f64,
        burst_capacity: u64,
    ) -> Result<BucketDecision, StoreError> {
        let key = leaky_bucket_key(subject);
        let clock = self.clock.as_ref();
        let capacity = burst_capacity as f64;

        let (record, admitted) = bucket::update(
            self.store.as_ref(),
            &key,
            self.idle_ttl,
            || LeakyBucketRecord::empty(burst_capacity, leak_rate_per_sec, clock.now_ms()),
            |record: LeakyBucketRecord| {
                let mut record = record.drained(burst_capacity, leak_rate_per_sec, clock.now_ms());
                if record.level < capacity {
                    record.level = (record.level + 1.0).min(capacity);
                    (record, true)
                } else {
                    (record, false)
                }
            },
        )
        .await?;

        trace!(
            subject = %log_identity(subject),
            level = record.level,
            admitted,
            "Leaky bucket evaluated"
        );

        let retry_after = if admitted {
            Duration::ZERO
        } else {
            debug!(subject = %log_identity(subject), burst_capacity, "Leaky bucket full");
            // Any drain at all brings the level under capacity; report one
            // whole unit so a retrying client actually gets through.
            bucket::time_for(record.level - capacity + 1.0, leak_rate_per_sec)
        };

        Ok(BucketDecision {
            admitted,
            level: record.level,
            retry_after,
        })
    }

    /// Current queue depth of the subject, without admitting anything.
    pub async fn level(&self, subject: &str, leak_rate_per_sec: f64, burst_capacity: u64) -> Result<f64, StoreError> {
        let key = leaky_bucket_key(subject);
        let now_ms = self.clock.now_ms();

        let Some(raw) = self.store.get(&key).await? else {
            return Ok(0.0);
        };
        let record: LeakyBucketRecord = serde_json::from_str(&raw).map_err(|e| StoreError::Corrupted {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        Ok(record.drained(burst_capacity, leak_rate_per_sec, now_ms).level)
    }
}
