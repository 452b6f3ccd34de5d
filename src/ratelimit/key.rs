//! Composite store keys for limiter records.

use std::borrow::Cow;
use std::fmt;

/// Namespace a window counter is charged against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// One budget shared by every request
    Global,
    /// Per end-user budgets
    User,
    /// Per API key budgets
    Api,
    /// Budgets for calls made by another service
    Service(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::User => write!(f, "user"),
            Scope::Api => write!(f, "api"),
            Scope::Service(name) => write!(f, "svc/{}", escape(name)),
        }
    }
}

/// Escape the key delimiter so subject ids cannot forge another record's key.
fn escape(part: &str) -> String {
    part.replace('%', "%25").replace(':', "%3A")
}

/// Key of a fixed-window counter.
///
/// Format: `rl:{scope}:{subject}:{window_secs}:{window_start}`
pub fn window_key(scope: &Scope, subject: &str, window_secs: u64, window_start: u64) -> String {
    format!("rl:{}:{}:{}:{}", scope, escape(subject), window_secs, window_start)
}

/// Key of a subject's token bucket.
pub fn token_bucket_key(subject: &str) -> String {
    format!("tb:{}", escape(subject))
}

/// Key of a subject's leaky bucket.
pub fn leaky_bucket_key(subject: &str) -> String {
    format!("lb:{}", escape(subject))
}

/// Key of a quota override.
pub fn quota_key(subject_type: &str, subject: &str) -> String {
    format!("quota:{}:{}", subject_type, escape(subject))
}

/// Key of a distributed lock.
pub fn lock_key(resource: &str) -> String {
    format!("lock:{}", escape(resource))
}

/// Loggable form of a credential: at most its first four characters and
/// never more than half of it.
pub fn redact(secret: &str) -> String {
    let shown = (secret.chars().count() / 2).min(4);
    format!("{}***", secret.chars().take(shown).collect::<String>())
}

/// Loggable form of a window subject. API keys are redacted.
pub(crate) fn log_subject<'a>(scope: &Scope, subject: &'a str) -> Cow<'a, str> {
    match scope {
        Scope::Api => Cow::Owned(redact(subject)),
        _ => Cow::Borrowed(subject),
    }
}

/// Loggable form of a burst identity (`user/{id}` or `api/{key}`).
pub(crate) fn log_identity(identity: &str) -> Cow<'_, str> {
    match identity.strip_prefix("api/") {
        Some(key) => Cow::Owned(format!("api/{}", redact(key))),
        None => Cow::Borrowed(identity),
    }
}
