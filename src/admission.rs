//! Request admission: identity resolution plus the failover limiter.
//!
//! This is the piece an HTTP middleware or provider wrapper calls. It never
//! fails; infrastructure problems are absorbed by the limiter.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::config::TurnstileConfig;
use crate::error::Result;
use crate::identity::{IdentityResolver, LimiterKey, RequestMetadata};
use crate::ratelimit::bucket::is_valid_cost;
use crate::ratelimit::FailoverLimiter;
use crate::store::{self, StoreHandle};

/// Status code for an admitted request.
pub const STATUS_OK: u16 = 200;
/// Status code for a throttled request.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// The request may proceed
    Admitted,
    /// The bucket for `key` is exhausted
    Throttled { key: LimiterKey },
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted)
    }

    /// HTTP-equivalent status for the decision.
    pub fn status_code(&self) -> u16 {
        match self {
            AdmissionDecision::Admitted => STATUS_OK,
            AdmissionDecision::Throttled { .. } => STATUS_TOO_MANY_REQUESTS,
        }
    }
}

/// Summary of a decision that is safe to log or print.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionReport {
    pub admitted: bool,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttled_key: Option<String>,
}

impl From<&AdmissionDecision> for AdmissionReport {
    fn from(decision: &AdmissionDecision) -> Self {
        Self {
            admitted: decision.is_admitted(),
            status: decision.status_code(),
            throttled_key: match decision {
                AdmissionDecision::Admitted => None,
                AdmissionDecision::Throttled { key } => Some(key.redacted()),
            },
        }
    }
}

/// Resolves who a request belongs to and charges their bucket(s).
pub struct AdmissionGate {
    limiter: Arc<FailoverLimiter>,
    resolver: IdentityResolver,
    enforce_peer_budget: bool,
}

impl AdmissionGate {
    pub fn new(limiter: Arc<FailoverLimiter>, resolver: IdentityResolver) -> Self {
        Self {
            limiter,
            resolver,
            enforce_peer_budget: true,
        }
    }

    /// Whether credentialed requests also draw on their address's budget.
    pub fn with_peer_budget(mut self, enforce: bool) -> Self {
        self.enforce_peer_budget = enforce;
        self
    }

    pub fn from_config(config: &TurnstileConfig) -> Result<Self> {
        config.validate()?;
        let handle = config
            .limiter
            .backend_url
            .as_deref()
            .map(store::connect)
            .transpose()?;
        Self::from_config_with_store(config, handle.as_ref())
    }

    /// Build over an already connected store, e.g. one shared with a
    /// [`CostLedger`](crate::ledger::CostLedger).
    pub fn from_config_with_store(
        config: &TurnstileConfig,
        handle: Option<&StoreHandle>,
    ) -> Result<Self> {
        config.validate()?;
        let limiter = FailoverLimiter::from_config_with_store(&config.limiter, handle)?;
        let resolver = IdentityResolver::from_config(&config.identity)?;
        Ok(Self::new(Arc::new(limiter), resolver)
            .with_peer_budget(config.identity.enforce_peer_budget))
    }

    pub fn limiter(&self) -> &Arc<FailoverLimiter> {
        &self.limiter
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// Admit a request costing one token.
    pub async fn check(&self, request: &RequestMetadata) -> AdmissionDecision {
        self.check_with_cost(request, 1.0).await
    }

    /// Admit a request costing `cost` tokens.
    ///
    /// Every key's balance is checked before any is charged, so a request
    /// throttled by one bucket spends nothing from the others. Only a race
    /// with a concurrent request between the check and the charge can leave
    /// an earlier key charged for a throttled request. A negative or
    /// non-finite cost is throttled outright.
    pub async fn check_with_cost(&self, request: &RequestMetadata, cost: f64) -> AdmissionDecision {
        let keys = if self.enforce_peer_budget {
            self.resolver.resolve_all(request)
        } else {
            vec![self.resolver.resolve(request)]
        };

        if !is_valid_cost(cost) {
            let key = self.resolver.resolve(request);
            debug!(key = %key.redacted(), cost = cost, "Rejecting invalid cost");
            return AdmissionDecision::Throttled { key };
        }

        for key in &keys {
            let balance = self.limiter.acquire(key.as_str(), 0.0).await;
            if balance.remaining < cost {
                return Self::throttled(key.clone(), cost);
            }
        }
        for key in keys {
            if !self.limiter.allow(key.as_str(), cost).await {
                return Self::throttled(key, cost);
            }
        }
        AdmissionDecision::Admitted
    }

    fn throttled(key: LimiterKey, cost: f64) -> AdmissionDecision {
        debug!(key = %key.redacted(), cost = cost, "Request throttled");
        AdmissionDecision::Throttled { key }
    }
}
