//! Cost accounting per client identity.
//!
//! The ledger is independent of admission: a request may be admitted and
//! still be charged a cost afterwards, for example the price of the tokens a
//! downstream model call consumed. Totals never expire; they only grow until
//! reset.

pub mod pricing;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{info, trace, warn};

use crate::config::LedgerConfig;
use crate::error::{Result, StoreError, TurnstileError};
use crate::identity::fingerprint;
use crate::ratelimit::BackendKind;
use crate::store::{self, CounterStore, StoreHandle};

pub use pricing::{compute_cost, token_count, ModelPricing, PricingTable, Usage};

/// Default bound on a single remote ledger call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(250);

/// In-process cost totals.
#[derive(Debug, Default)]
pub struct LocalLedger {
    totals: Mutex<HashMap<String, f64>>,
}

impl LocalLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: &str, amount: f64) -> f64 {
        let mut totals = self.totals.lock();
        let total = totals.entry(key.to_string()).or_insert(0.0);
        *total += amount;
        *total
    }

    pub fn get(&self, key: &str) -> f64 {
        self.totals.lock().get(key).copied().unwrap_or(0.0)
    }

    pub fn reset(&self, key: &str) {
        self.totals.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.totals.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
enum LedgerBackend {
    Distributed(Arc<dyn CounterStore>),
    Local(Arc<LocalLedger>),
}

impl LedgerBackend {
    fn kind(&self) -> BackendKind {
        match self {
            LedgerBackend::Distributed(_) => BackendKind::Distributed,
            LedgerBackend::Local(_) => BackendKind::Local,
        }
    }
}

/// Cost totals kept in the shared store, degrading to local totals once.
pub struct CostLedger {
    key_prefix: String,
    timeout: Duration,
    active: RwLock<LedgerBackend>,
    failovers: AtomicUsize,
}

impl CostLedger {
    /// A ledger that only ever keeps totals in this process.
    pub fn local(key_prefix: &str) -> Self {
        Self::with_backend(key_prefix, LedgerBackend::Local(Arc::new(LocalLedger::new())))
    }

    /// A ledger backed by the shared store.
    pub fn distributed(store: Arc<dyn CounterStore>, key_prefix: &str) -> Self {
        Self::with_backend(key_prefix, LedgerBackend::Distributed(store))
    }

    fn with_backend(key_prefix: &str, backend: LedgerBackend) -> Self {
        Self {
            key_prefix: key_prefix.to_string(),
            timeout: DEFAULT_TIMEOUT,
            active: RwLock::new(backend),
            failovers: AtomicUsize::new(0),
        }
    }

    /// Build from configuration, connecting to `backend_url` if one is set.
    pub fn from_config(
        config: &LedgerConfig,
        backend_url: Option<&str>,
        timeout: Duration,
    ) -> Result<Self> {
        let handle = backend_url.map(store::connect).transpose()?;
        Self::from_config_with_store(config, handle.as_ref(), timeout)
    }

    /// Build from configuration over an already connected store, so the
    /// ledger and the limiter can share one client.
    pub fn from_config_with_store(
        config: &LedgerConfig,
        handle: Option<&StoreHandle>,
        timeout: Duration,
    ) -> Result<Self> {
        if config.key_prefix.is_empty() {
            return Err(TurnstileError::Config(
                "ledger key_prefix must not be empty".to_string(),
            ));
        }
        let ledger = match handle {
            Some(handle) => {
                info!("Using distributed cost ledger");
                Self::distributed(handle.counters(), &config.key_prefix)
            }
            None => Self::local(&config.key_prefix),
        };
        Ok(ledger.with_timeout(timeout))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Record key for a ledger key.
    pub fn record_key(&self, key: &str) -> String {
        format!("{}:{}:total", self.key_prefix, key)
    }

    /// Add `amount` to the total for `key` and return the new total.
    ///
    /// Amounts must be finite and non-negative.
    pub async fn add_cost(&self, key: &str, amount: f64) -> Result<f64> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(TurnstileError::InvalidCost(amount));
        }
        let backend = self.active.read().clone();
        let total = match backend {
            LedgerBackend::Local(local) => local.add(key, amount),
            LedgerBackend::Distributed(store) => {
                let record_key = self.record_key(key);
                match self.bounded(store.incr_by_float(&record_key, amount)).await {
                    Ok(total) => total,
                    Err(err) => self.degrade(key, &err).add(key, amount),
                }
            }
        };
        trace!(key = %fingerprint(key), amount = amount, total = total, "Recorded cost");
        Ok(total)
    }

    /// Current total for `key`; zero if nothing was recorded.
    pub async fn get_cost(&self, key: &str) -> f64 {
        let backend = self.active.read().clone();
        match backend {
            LedgerBackend::Local(local) => local.get(key),
            LedgerBackend::Distributed(store) => {
                let record_key = self.record_key(key);
                match self.bounded(store.get_float(&record_key)).await {
                    Ok(total) => total.unwrap_or(0.0),
                    Err(err) => self.degrade(key, &err).get(key),
                }
            }
        }
    }

    /// Forget the total for `key`.
    pub async fn reset(&self, key: &str) {
        let backend = self.active.read().clone();
        match backend {
            LedgerBackend::Local(local) => local.reset(key),
            LedgerBackend::Distributed(store) => {
                let record_key = self.record_key(key);
                if let Err(err) = self.bounded(store.delete(&record_key)).await {
                    self.degrade(key, &err).reset(key);
                }
            }
        }
    }

    pub fn active_backend(&self) -> BackendKind {
        self.active.read().kind()
    }

    pub fn failover_count(&self) -> usize {
        self.failovers.load(Ordering::SeqCst)
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = std::result::Result<T, StoreError>>,
    ) -> std::result::Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    fn degrade(&self, key: &str, err: &StoreError) -> Arc<LocalLedger> {
        let mut active = self.active.write();
        match &*active {
            LedgerBackend::Local(local) => local.clone(),
            LedgerBackend::Distributed(_) => {
                let local = Arc::new(LocalLedger::new());
                *active = LedgerBackend::Local(local.clone());
                self.failovers.fetch_add(1, Ordering::SeqCst);
                warn!(
                    backend = %BackendKind::Distributed,
                    key_fingerprint = %fingerprint(key),
                    reason = %err,
                    "Cost ledger backend unavailable, switching to local totals until restart"
                );
                local
            }
        }
    }
}
