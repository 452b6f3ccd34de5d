//! Admission control: window counters, burst limiters and quotas.

mod bucket;
mod gateway;
pub mod key;
mod leaky_bucket;
mod pipeline;
mod quota;
mod token_bucket;
mod window;

pub use bucket::BucketDecision;
pub use gateway::ServiceGateway;
pub use key::Scope;
pub use leaky_bucket::{LeakyBucket, LeakyBucketRecord};
pub use pipeline::{
    AdmissionPipeline, Decision, Denial, Stage, Subject, WindowUsage, ANONYMOUS_USER, NO_API_KEY,
};
pub use quota::{Quota, QuotaConfig, QuotaResolver, SubjectType};
pub use token_bucket::{TokenBucket, TokenBucketRecord};
pub use window::{window_start, WindowCounter, WindowOutcome, WindowStrategy};
