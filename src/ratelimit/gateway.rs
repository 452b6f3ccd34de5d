//! Service-to-service admission.
//!
//! Calls between services are charged on their own window counters, keyed by
//! the calling service and the subject it acts for. The `svc/` scope keeps
//! these budgets apart from end-user budgets.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::key::Scope;
use super::pipeline::{stage_failure, window_decision, Decision, Stage, WindowUsage};
use super::quota::Quota;
use super::window::WindowCounter;
use crate::clock::Clock;
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::store::StateStore;

/// Window-counter admission for calls from other services.
pub struct ServiceGateway {
    counter: WindowCounter,
    default_budget: Quota,
    budgets: HashMap<String, Quota>,
}

impl ServiceGateway {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, config: &GatewayConfig) -> Self {
        Self {
            counter: WindowCounter::new(store, clock, config.window_strategy),
            default_budget: config.default_budget,
            budgets: config.services.clone(),
        }
    }

    /// Budget applied to calls from `service`.
    pub fn budget_for(&self, service: &str) -> Quota {
        self.budgets.get(service).copied().unwrap_or(self.default_budget)
    }

    /// Charge one call from `service` on behalf of `subject`.
    pub async fn check(&self, service: &str, subject: &str) -> Result<Decision> {
        let budget = self.budget_for(service);
        let outcome = self
            .counter
            .check_and_increment(&Scope::Service(service.to_string()), subject, budget)
            .await
            .map_err(|e| stage_failure(Stage::Service, e))?;

        if let Some(denial) = window_decision(Stage::Service, budget, &outcome) {
            debug!(service = %service, subject = %subject, "Service call denied");
            return Ok(Decision::Denied(denial));
        }

        Ok(Decision::Admitted {
            usage: vec![WindowUsage {
                stage: Stage::Service,
                limit: budget,
                remaining: outcome.remaining,
                reset_after_secs: outcome.reset_after_secs,
            }],
        })
    }
}
