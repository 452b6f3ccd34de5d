//! The admission pipeline.
//!
//! A request passes through a fixed chain of checks and stops at the first
//! one that rejects it:
//!
//! global window -> user window -> API key window -> token bucket -> leaky bucket
//!
//! Checks that already ran keep their charge when a later check rejects.
//! A store failure at any stage aborts the chain with an error rather than a
//! decision, so callers can tell an exhausted quota from a broken limiter.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, instrument, trace, warn};

use super::bucket::{self, BucketDecision};
use super::key::Scope;
use super::leaky_bucket::LeakyBucket;
use super::quota::{Quota, QuotaResolver, SubjectType};
use super::token_bucket::TokenBucket;
use super::window::{WindowCounter, WindowOutcome};
use crate::clock::Clock;
use crate::config::{LimitsConfig, TurnstileConfig};
use crate::error::{Result, TurnstileError};
use crate::store::{StateStore, StoreError};

/// User id charged when a request carries none.
pub const ANONYMOUS_USER: &str = "anonymous";
/// API key charged when a request carries none.
pub const NO_API_KEY: &str = "none";
/// Subject id of the global window.
const GLOBAL_SUBJECT: &str = "all";

/// Identities a request is charged against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subject {
    pub user_id: Option<String>,
    pub api_key: Option<String>,
}

impl Subject {
    pub fn new(user_id: Option<impl Into<String>>, api_key: Option<impl Into<String>>) -> Self {
        Self {
            user_id: user_id.map(Into::into),
            api_key: api_key.map(Into::into),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user_id(&self) -> &str {
        self.user_id.as_deref().filter(|id| !id.is_empty()).unwrap_or(ANONYMOUS_USER)
    }

    pub fn api_key(&self) -> &str {
        self.api_key.as_deref().filter(|key| !key.is_empty()).unwrap_or(NO_API_KEY)
    }

    /// Identity the burst buckets are keyed on: the user when known,
    /// otherwise the API key, otherwise the shared anonymous bucket.
    pub fn burst_identity(&self) -> String {
        match (self.user_id(), self.api_key()) {
            (ANONYMOUS_USER, NO_API_KEY) => format!("user/{}", ANONYMOUS_USER),
            (ANONYMOUS_USER, key) => format!("api/{}", key),
            (user, _) => format!("user/{}", user),
        }
    }
}

/// A check in the admission chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Global,
    User,
    Api,
    TokenBucket,
    LeakyBucket,
    /// Service-to-service budget, checked by the gateway
    Service,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Global => "global",
            Stage::User => "user",
            Stage::Api => "api",
            Stage::TokenBucket => "token_bucket",
            Stage::LeakyBucket => "leaky_bucket",
            Stage::Service => "service",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a request was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Denial {
    pub stage: Stage,
    /// The quota that was exhausted
    pub limit: Quota,
    /// Seconds a well-behaved client should wait before retrying
    pub retry_after_secs: u64,
}

impl Denial {
    pub fn status_code(&self) -> u16 {
        429
    }

    /// Response headers describing the exhausted limit.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("X-RateLimit-Limit", self.limit.max.to_string()),
            ("X-RateLimit-Window", self.limit.window.to_string()),
            ("Retry-After", self.retry_after_secs.to_string()),
        ]
    }

    /// JSON response body.
    pub fn body(&self) -> serde_json::Value {
        json!({
            "error": "Too Many Requests",
            "type": self.stage.as_str(),
            "limit": self.limit,
            "message": format!(
                "Rate limit exceeded for {}: {} requests per {} seconds. Retry after {} seconds.",
                self.stage, self.limit.max, self.limit.window, self.retry_after_secs
            ),
        })
    }
}

/// Consumption of one window stage by an admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowUsage {
    pub stage: Stage,
    pub limit: Quota,
    pub remaining: u64,
    pub reset_after_secs: u64,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Admitted { usage: Vec<WindowUsage> },
    Denied(Denial),
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted { .. })
    }

    pub fn denial(&self) -> Option<&Denial> {
        match self {
            Decision::Denied(denial) => Some(denial),
            Decision::Admitted { .. } => None,
        }
    }

    /// Headers for the response. Admitted requests report the window with
    /// the least headroom.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            Decision::Denied(denial) => denial.headers(),
            Decision::Admitted { usage } => usage
                .iter()
                .min_by_key(|u| u.remaining)
                .map(|u| {
                    vec![
                        ("X-RateLimit-Limit", u.limit.max.to_string()),
                        ("X-RateLimit-Window", u.limit.window.to_string()),
                        ("X-RateLimit-Remaining", u.remaining.to_string()),
                    ]
                })
                .unwrap_or_default(),
        }
    }
}

pub(crate) fn window_decision(stage: Stage, limit: Quota, outcome: &WindowOutcome) -> Option<Denial> {
    if outcome.admitted {
        return None;
    }
    Some(Denial {
        stage,
        limit,
        retry_after_secs: outcome.reset_after_secs.clamp(1, limit.window.max(1)),
    })
}

fn bucket_denial(stage: Stage, limit: Quota, decision: &BucketDecision) -> Denial {
    Denial {
        stage,
        limit,
        retry_after_secs: bucket::retry_after_secs(decision.retry_after, limit.window),
    }
}

pub(crate) fn stage_failure(stage: Stage, err: StoreError) -> TurnstileError {
    warn!(stage = %stage, error = %err, "Admission stage failed");
    TurnstileError::from_store(stage.as_str(), err)
}

/// Runs the ordered admission checks.
pub struct AdmissionPipeline {
    limits: LimitsConfig,
    windows: WindowCounter,
    tokens: TokenBucket,
    leaky: LeakyBucket,
    quotas: QuotaResolver,
}

impl AdmissionPipeline {
    /// Build a pipeline over a shared store.
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, config: &TurnstileConfig) -> Self {
        let idle_ttl = config.buckets.idle_ttl();
        Self {
            limits: config.limits,
            windows: WindowCounter::new(store.clone(), clock.clone(), config.window_strategy),
            tokens: TokenBucket::new(store.clone(), clock.clone(), idle_ttl),
            leaky: LeakyBucket::new(store.clone(), clock, idle_ttl),
            quotas: QuotaResolver::new(store, config.limits.user, config.limits.api),
        }
    }

    /// The quota resolver, for the administrative interface.
    pub fn quotas(&self) -> &QuotaResolver {
        &self.quotas
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Decide whether a request from `subject` may proceed.
    #[instrument(skip(self, subject), fields(user = %subject.user_id()))]
    pub async fn check(&self, subject: &Subject) -> Result<Decision> {
        let mut usage = Vec::with_capacity(3);

        let global = self.limits.global;
        let outcome = self
            .windows
            .check_and_increment(&Scope::Global, GLOBAL_SUBJECT, global)
            .await
            .map_err(|e| stage_failure(Stage::Global, e))?;
        if let Some(denial) = window_decision(Stage::Global, global, &outcome) {
            return Ok(self.deny(denial));
        }
        usage.push(usage_of(Stage::Global, global, &outcome));

        let user_quota = self
            .quotas
            .resolve(SubjectType::User, subject.user_id())
            .await
            .map_err(|e| stage_failure(Stage::User, e))?;
        let outcome = self
            .windows
            .check_and_increment(&Scope::User, subject.user_id(), user_quota)
            .await
            .map_err(|e| stage_failure(Stage::User, e))?;
        if let Some(denial) = window_decision(Stage::User, user_quota, &outcome) {
            return Ok(self.deny(denial));
        }
        usage.push(usage_of(Stage::User, user_quota, &outcome));

        let api_quota = self
            .quotas
            .resolve(SubjectType::Api, subject.api_key())
            .await
            .map_err(|e| stage_failure(Stage::Api, e))?;
        let outcome = self
            .windows
            .check_and_increment(&Scope::Api, subject.api_key(), api_quota)
            .await
            .map_err(|e| stage_failure(Stage::Api, e))?;
        if let Some(denial) = window_decision(Stage::Api, api_quota, &outcome) {
            return Ok(self.deny(denial));
        }
        usage.push(usage_of(Stage::Api, api_quota, &outcome));

        let burst = self.limits.burst;
        let burst_subject = subject.burst_identity();

        let decision = self
            .tokens
            .consume(&burst_subject, burst.max, burst.rate_per_second())
            .await
            .map_err(|e| stage_failure(Stage::TokenBucket, e))?;
        if !decision.admitted {
            return Ok(self.deny(bucket_denial(Stage::TokenBucket, burst, &decision)));
        }

        let decision = self
            .leaky
            .admit(&burst_subject, burst.rate_per_second(), burst.max)
            .await
            .map_err(|e| stage_failure(Stage::LeakyBucket, e))?;
        if !decision.admitted {
            return Ok(self.deny(bucket_denial(Stage::LeakyBucket, burst, &decision)));
        }

        trace!("Request admitted");
        Ok(Decision::Admitted { usage })
    }

    fn deny(&self, denial: Denial) -> Decision {
        debug!(
            stage = %denial.stage,
            limit = %denial.limit,
            retry_after_secs = denial.retry_after_secs,
            "Request denied"
        );
        Decision::Denied(denial)
    }
}

fn usage_of(stage: Stage, limit: Quota, outcome: &WindowOutcome) -> WindowUsage {
    WindowUsage {
        stage,
        limit,
        remaining: outcome.remaining,
        reset_after_secs: outcome.reset_after_secs,
    }
}
