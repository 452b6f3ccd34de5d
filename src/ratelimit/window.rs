//! Window counters.
//!
//! Time is cut into windows of `quota.window` seconds aligned to the Unix
//! epoch. Each check increments the subject's counter for the current window
//! with a single atomic store call and compares the result with the quota.
//!
//! Every attempt is charged, including requests that a later stage rejects.
//! This makes probing for remaining quota cost quota.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::key::{log_subject, window_key, Scope};
use super::quota::Quota;
use crate::clock::Clock;
use crate::store::{StateStore, StoreError};

/// Extra lifetime of a counter past the end of its window.
const WINDOW_GRACE: Duration = Duration::from_secs(1);

/// How windows are evaluated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowStrategy {
    /// Independent fixed windows. Up to twice the quota can pass around a
    /// window boundary.
    #[default]
    Fixed,
    /// Sliding window approximation: the previous window's count is weighted
    /// by how much of it still overlaps the trailing window.
    Sliding,
}

/// Result of a window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    pub admitted: bool,
    /// Requests counted in the window, including this one
    pub count: u64,
    /// Requests left before the limit is hit
    pub remaining: u64,
    /// Seconds until the current window ends
    pub reset_after_secs: u64,
}

/// Start of the window containing `now_secs`.
pub fn window_start(now_secs: u64, window_secs: u64) -> u64 {
    now_secs - (now_secs % window_secs)
}

/// Counts requests per (scope, subject, window length).
pub struct WindowCounter {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    strategy: WindowStrategy,
}

impl WindowCounter {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, strategy: WindowStrategy) -> Self {
        Self { store, clock, strategy }
    }

    pub fn strategy(&self) -> WindowStrategy {
        self.strategy
    }

    /// Count one request against `quota` and report whether it fits.
    ///
    /// `quota` must have passed [`Quota::validate`]; a zero window panics.
    pub async fn check_and_increment(
        &self,
        scope: &Scope,
        subject: &str,
        quota: Quota,
    ) -> Result<WindowOutcome, StoreError> {
        let window_secs = quota.window;
        let now_ms = self.clock.now_ms();
        let now_secs = now_ms / 1000;
        let start = window_start(now_secs, window_secs);
        let key = window_key(scope, subject, window_secs, start);

        trace!(
            scope = %scope,
            subject = %log_subject(scope, subject),
            window = start,
            "Checking window counter"
        );

        let count = match self.strategy {
            WindowStrategy::Fixed => {
                let ttl = Duration::from_secs(window_secs) + WINDOW_GRACE;
                self.store.incr(&key, 1, ttl).await?
            }
            WindowStrategy::Sliding => {
                // The current counter must outlive the next window, which reads it.
                let ttl = Duration::from_secs(2 * window_secs) + WINDOW_GRACE;
                let current = self.store.incr(&key, 1, ttl).await?;
                let previous_key = window_key(scope, subject, window_secs, start.saturating_sub(window_secs));
                let previous = self.read_count(&previous_key).await?;

                let elapsed_ms = now_ms.saturating_sub(start * 1000) as f64;
                let overlap = 1.0 - elapsed_ms / (window_secs * 1000) as f64;
                current + (previous as f64 * overlap.clamp(0.0, 1.0)).floor() as u64
            }
        };

        let admitted = count <= quota.max;
        if !admitted {
            debug!(
                scope = %scope,
                subject = %log_subject(scope, subject),
                count,
                limit = quota.max,
                "Window limit exceeded"
            );
        }

        Ok(WindowOutcome {
            admitted,
            count,
            remaining: quota.max.saturating_sub(count),
            reset_after_secs: (start + window_secs).saturating_sub(now_secs),
        })
    }

    async fn read_count(&self, key: &str) -> Result<u64, StoreError> {
        match self.store.get(key).await? {
            Some(raw) => raw.parse().map_err(|_| StoreError::Corrupted {
                key: key.to_string(),
                reason: "counter is not an integer".to_string(),
            }),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::testing::UnreachableStore;
    use crate::store::MemoryStore;

    // 2024-01-01T00:00:00Z, a multiple of every window used below.
    const EPOCH_MS: u64 = 1_704_067_200_000;

    fn counter(strategy: WindowStrategy) -> (Arc<ManualClock>, WindowCounter) {
        let clock = Arc::new(ManualClock::new(EPOCH_MS));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        (clock.clone(), WindowCounter::new(store, clock, strategy))
    }

    #[test]
    fn test_window_start() {
        assert_eq!(window_start(125, 60), 120);
        assert_eq!(window_start(120, 60), 120);
        assert_eq!(window_start(7, 1), 7);
    }

    #[test]
    fn test_strategy_parses_lowercase() {
        let strategy: WindowStrategy = serde_yaml::from_str("sliding").unwrap();
        assert_eq!(strategy, WindowStrategy::Sliding);
    }

    #[tokio::test]
    async fn test_max_admitted_then_denied() {
        let (_clock, counter) = counter(WindowStrategy::Fixed);
        let quota = Quota::new(60, 5);

        for i in 1..=5 {
            let outcome = counter.check_and_increment(&Scope::User, "u1", quota).await.unwrap();
            assert!(outcome.admitted, "request {i} should pass");
            assert_eq!(outcome.count, i);
            assert_eq!(outcome.remaining, 5 - i);
        }

        let outcome = counter.check_and_increment(&Scope::User, "u1", quota).await.unwrap();
        assert!(!outcome.admitted);
        assert_eq!(outcome.count, 6);
        assert_eq!(outcome.remaining, 0);
    }

    #[tokio::test]
    async fn test_next_window_starts_fresh() {
        let (clock, counter) = counter(WindowStrategy::Fixed);
        let quota = Quota::new(60, 1);

        assert!(counter.check_and_increment(&Scope::User, "u1", quota).await.unwrap().admitted);
        assert!(!counter.check_and_increment(&Scope::User, "u1", quota).await.unwrap().admitted);

        clock.advance(Duration::from_secs(60));
        let outcome = counter.check_and_increment(&Scope::User, "u1", quota).await.unwrap();
        assert!(outcome.admitted);
        assert_eq!(outcome.count, 1);
    }

    #[tokio::test]
    async fn test_reset_after_counts_down() {
        let (clock, counter) = counter(WindowStrategy::Fixed);
        let quota = Quota::new(60, 10);

        clock.advance(Duration::from_secs(45));
        let outcome = counter.check_and_increment(&Scope::Global, "all", quota).await.unwrap();
        assert_eq!(outcome.reset_after_secs, 15);
    }

    #[tokio::test]
    async fn test_scopes_and_windows_are_independent() {
        let (_clock, counter) = counter(WindowStrategy::Fixed);

        counter.check_and_increment(&Scope::User, "x", Quota::new(60, 1)).await.unwrap();
        let api = counter.check_and_increment(&Scope::Api, "x", Quota::new(60, 1)).await.unwrap();
        let longer = counter.check_and_increment(&Scope::User, "x", Quota::new(3600, 1)).await.unwrap();
        assert!(api.admitted);
        assert!(longer.admitted);
    }

    #[tokio::test]
    async fn test_fixed_window_allows_boundary_burst() {
        let (clock, counter) = counter(WindowStrategy::Fixed);
        let quota = Quota::new(60, 3);

        clock.advance(Duration::from_secs(59));
        for _ in 0..3 {
            assert!(counter.check_and_increment(&Scope::User, "u1", quota).await.unwrap().admitted);
        }
        clock.advance(Duration::from_secs(1));
        for _ in 0..3 {
            assert!(counter.check_and_increment(&Scope::User, "u1", quota).await.unwrap().admitted);
        }
    }

    #[tokio::test]
    async fn test_sliding_window_smooths_boundary_burst() {
        let (clock, counter) = counter(WindowStrategy::Sliding);
        let quota = Quota::new(60, 3);

        clock.advance(Duration::from_secs(59));
        for _ in 0..3 {
            assert!(counter.check_and_increment(&Scope::User, "u1", quota).await.unwrap().admitted);
        }

        // At the start of the next window the previous one still counts in full.
        clock.advance(Duration::from_secs(1));
        let outcome = counter.check_and_increment(&Scope::User, "u1", quota).await.unwrap();
        assert!(!outcome.admitted);

        // Half way through, 3 * 0.5 = 1.5 rounds down to 1 carried request,
        // next to the 2 charged in this window (the denied attempt included).
        clock.advance(Duration::from_secs(30));
        let outcome = counter.check_and_increment(&Scope::User, "u1", quota).await.unwrap();
        assert_eq!(outcome.count, 3);
        assert!(outcome.admitted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_checks_admit_exactly_max() {
        let (_clock, counter) = counter(WindowStrategy::Fixed);
        let counter = Arc::new(counter);
        let quota = Quota::new(60, 25);

        let attempts: Vec<_> = (0..100)
            .map(|_| {
                let counter = counter.clone();
                tokio::spawn(async move { counter.check_and_increment(&Scope::Global, "all", quota).await })
            })
            .collect();

        let admitted = futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(outcome)) if outcome.admitted))
            .count();
        assert_eq!(admitted, 25);
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let counter = WindowCounter::new(
            Arc::new(UnreachableStore),
            Arc::new(ManualClock::new(EPOCH_MS)),
            WindowStrategy::Fixed,
        );

        let err = counter
            .check_and_increment(&Scope::Global, "all", Quota::new(60, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
