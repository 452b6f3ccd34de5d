//! Error types for the Turnstile admission core.

use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Turnstile operations.
///
/// Every variant is distinct from a denial: a denied request is a normal
/// [`Decision`](crate::ratelimit::Decision), while these errors mean the
/// limiter itself could not reach a decision.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// The shared state store could not be reached or timed out.
    #[error("State store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    /// A quota failed validation and was not persisted.
    #[error("Invalid quota: {0}")]
    InvalidQuota(String),

    /// A lock operation was attempted with a token that does not own the lock.
    #[error("Lock not held: {key}")]
    LockNotHeld { key: String },

    /// A limiter failed for a reason other than store reachability.
    #[error("Stage '{stage}' failed: {reason}")]
    PipelineStage { stage: String, reason: String },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Attach a pipeline stage to a store error.
    ///
    /// Reachability failures stay `StoreUnavailable`; anything else the store
    /// reports (such as an undecodable record) is pinned to the stage.
    pub fn from_store(stage: &str, err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) | StoreError::Timeout(_) => TurnstileError::StoreUnavailable {
                reason: err.to_string(),
            },
            other => TurnstileError::PipelineStage {
                stage: stage.to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// Stable machine-readable name of this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            TurnstileError::StoreUnavailable { .. } => "store_unavailable",
            TurnstileError::InvalidQuota(_) => "invalid_quota",
            TurnstileError::LockNotHeld { .. } => "lock_not_held",
            TurnstileError::PipelineStage { .. } => "pipeline_stage_error",
            TurnstileError::Config(_) => "config_error",
            TurnstileError::Io(_) => "io_error",
        }
    }

    /// HTTP-equivalent status the surrounding layer should render.
    pub fn status_code(&self) -> u16 {
        match self {
            TurnstileError::InvalidQuota(_) => 400,
            TurnstileError::LockNotHeld { .. } => 409,
            _ => 500,
        }
    }

    /// JSON body describing the failure.
    pub fn body(&self) -> serde_json::Value {
        json!({
            "error": "Internal Server Error",
            "type": self.kind(),
            "message": self.to_string(),
        })
    }
}

impl From<StoreError> for TurnstileError {
    fn from(err: StoreError) -> Self {
        TurnstileError::from_store("store", err)
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_store_timeout_maps_to_unavailable() {
        let err = TurnstileError::from_store("global", StoreError::Timeout(Duration::from_millis(250)));
        assert!(matches!(err, TurnstileError::StoreUnavailable { .. }));
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn test_corrupted_record_is_stage_error() {
        let err = TurnstileError::from_store(
            "token_bucket",
            StoreError::Corrupted {
                key: "tb:u1".to_string(),
                reason: "bad json".to_string(),
            },
        );
        match err {
            TurnstileError::PipelineStage { ref stage, .. } => assert_eq!(stage, "token_bucket"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_error_body() {
        let err = TurnstileError::InvalidQuota("window must be positive".to_string());
        let body = err.body();
        assert_eq!(body["type"], "invalid_quota");
        assert_eq!(err.status_code(), 400);
    }
}
