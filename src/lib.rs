//! Turnstile - Distributed Admission Control
//!
//! This crate admits or rejects requests against several simultaneous quotas
//! (global, per-user, per-API-key and burst). All mutable state lives in a
//! shared key-value store so that any number of request-handling workers can
//! run the same checks concurrently without in-process coordination.

pub mod clock;
pub mod config;
pub mod error;
pub mod lock;
pub mod ratelimit;
pub mod store;
