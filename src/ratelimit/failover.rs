//! One-way failover from the shared store to in-process accounting.
//!
//! The limiter starts on the distributed backend when one is configured. The
//! first time that backend cannot answer, a fresh [`LocalLimiter`] takes over
//! for the rest of the process lifetime. Budgets are not migrated: the local
//! limiter starts with full buckets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use super::backend::BackendKind;
use super::bucket::{is_valid_cost, BucketSettings, Decision};
use super::distributed::DistributedLimiter;
use super::local::{LocalLimiter, NO_REFILL_TTL};
use crate::clock::{Clock, MonotonicClock};
use crate::config::LimiterConfig;
use crate::error::{LimiterUnavailable, Result};
use crate::identity::fingerprint;
use crate::store::{self, StoreHandle};

#[derive(Clone)]
enum ActiveBackend {
    Distributed(Arc<DistributedLimiter>),
    Local(Arc<LocalLimiter>),
}

impl ActiveBackend {
    fn kind(&self) -> BackendKind {
        match self {
            ActiveBackend::Distributed(_) => BackendKind::Distributed,
            ActiveBackend::Local(_) => BackendKind::Local,
        }
    }
}

/// Admission limiter that degrades from distributed to local exactly once.
pub struct FailoverLimiter {
    settings: BucketSettings,
    local_clock: Arc<dyn Clock>,
    no_refill_ttl: Duration,
    active: RwLock<ActiveBackend>,
    failovers: AtomicUsize,
}

impl FailoverLimiter {
    /// Start directly on in-process accounting.
    pub fn local(settings: BucketSettings) -> Self {
        let local_clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let local = LocalLimiter::with_clock(settings, local_clock.clone());
        Self {
            settings,
            local_clock,
            no_refill_ttl: NO_REFILL_TTL,
            active: RwLock::new(ActiveBackend::Local(Arc::new(local))),
            failovers: AtomicUsize::new(0),
        }
    }

    /// Start on the shared store, falling back to local on first failure.
    pub fn distributed(limiter: DistributedLimiter) -> Self {
        Self {
            settings: limiter.settings(),
            local_clock: Arc::new(MonotonicClock::default()),
            no_refill_ttl: NO_REFILL_TTL,
            active: RwLock::new(ActiveBackend::Distributed(Arc::new(limiter))),
            failovers: AtomicUsize::new(0),
        }
    }

    /// Build from configuration, connecting to `backend_url` if one is set.
    pub fn from_config(config: &LimiterConfig) -> Result<Self> {
        config.validate()?;
        let handle = config
            .backend_url
            .as_deref()
            .map(store::connect)
            .transpose()?;
        Self::from_config_with_store(config, handle.as_ref())
    }

    /// Build from configuration over an already connected store.
    ///
    /// Without a store the limiter runs locally, whatever `backend_url` says.
    pub fn from_config_with_store(
        config: &LimiterConfig,
        handle: Option<&StoreHandle>,
    ) -> Result<Self> {
        config.validate()?;
        let settings = config.bucket_settings()?;
        let ttl = Duration::from_secs(config.no_refill_ttl_secs);

        let limiter = match handle {
            Some(handle) => {
                let remote = DistributedLimiter::new(
                    handle.scripts(),
                    settings,
                    &config.bucket_key_prefix,
                )
                .with_timeout(Duration::from_millis(config.backend_timeout_ms));
                info!(
                    capacity = settings.capacity(),
                    refill_rate = settings.refill_rate(),
                    "Using distributed rate limiter"
                );
                Self::distributed(remote)
            }
            None => {
                info!(
                    capacity = settings.capacity(),
                    refill_rate = settings.refill_rate(),
                    "No backend configured, using local rate limiter"
                );
                Self::local(settings)
            }
        };
        Ok(limiter.with_no_refill_ttl(ttl))
    }

    /// Clock used by any local limiter this controller creates.
    ///
    /// Resets the current limiter if it is already local.
    pub fn with_local_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.local_clock = clock;
        self.reset_local();
        self
    }

    pub fn with_no_refill_ttl(mut self, ttl: Duration) -> Self {
        self.no_refill_ttl = ttl;
        self.reset_local();
        self
    }

    fn reset_local(&mut self) {
        let fresh = self.new_local();
        let active = self.active.get_mut();
        if let ActiveBackend::Local(_) = active {
            *active = ActiveBackend::Local(Arc::new(fresh));
        }
    }

    fn new_local(&self) -> LocalLimiter {
        LocalLimiter::with_clock(self.settings, self.local_clock.clone())
            .with_no_refill_ttl(self.no_refill_ttl)
    }

    /// Decide whether a request costing `needed` tokens may proceed for `key`.
    ///
    /// Never fails: a backend outage triggers failover and the request is then
    /// decided by the local limiter. A negative or non-finite cost is refused
    /// without touching any bucket.
    pub async fn allow(&self, key: &str, needed: f64) -> bool {
        if !is_valid_cost(needed) {
            debug!(key = %fingerprint(key), needed = needed, "Rejecting invalid cost");
            return false;
        }
        self.acquire(key, needed).await.allowed
    }

    /// Like [`FailoverLimiter::allow`] but also reports the tokens left.
    ///
    /// A zero cost reads the refilled balance without spending anything.
    pub async fn acquire(&self, key: &str, needed: f64) -> Decision {
        let backend = self.active.read().clone();
        match backend {
            ActiveBackend::Local(local) => local.acquire(key, needed),
            ActiveBackend::Distributed(remote) => match remote.acquire(key, needed).await {
                Ok(decision) => decision,
                Err(err) => {
                    let local = self.degrade(key, &err);
                    let decision = local.acquire(key, needed);
                    trace!(
                        key = %fingerprint(key),
                        allowed = decision.allowed,
                        "Decided on local limiter after failure"
                    );
                    decision
                }
            },
        }
    }

    /// Swap to a local limiter if that has not happened yet.
    fn degrade(&self, key: &str, err: &LimiterUnavailable) -> Arc<LocalLimiter> {
        let mut active = self.active.write();
        match &*active {
            ActiveBackend::Local(local) => local.clone(),
            ActiveBackend::Distributed(_) => {
                let local = Arc::new(self.new_local());
                *active = ActiveBackend::Local(local.clone());
                self.failovers.fetch_add(1, Ordering::SeqCst);
                warn!(
                    backend = %err.backend,
                    key_fingerprint = %fingerprint(key),
                    reason = %err.reason,
                    "Rate limiter backend unavailable, switching to local limiter until restart"
                );
                local
            }
        }
    }

    /// The backend currently answering requests.
    pub fn active_backend(&self) -> BackendKind {
        self.active.read().kind()
    }

    /// How many times this controller has failed over (zero or one).
    pub fn failover_count(&self) -> usize {
        self.failovers.load(Ordering::SeqCst)
    }

    /// The local limiter, once one is active.
    pub fn local_limiter(&self) -> Option<Arc<LocalLimiter>> {
        match &*self.active.read() {
            ActiveBackend::Local(local) => Some(local.clone()),
            ActiveBackend::Distributed(_) => None,
        }
    }

    pub fn settings(&self) -> BucketSettings {
        self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::io::Write;

    fn settings(capacity: f64, refill_rate: f64) -> BucketSettings {
        BucketSettings::new(capacity, refill_rate).unwrap()
    }

    fn distributed(capacity: f64, refill_rate: f64) -> (FailoverLimiter, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let remote = DistributedLimiter::new(store.clone(), settings(capacity, refill_rate), "fo");
        (FailoverLimiter::distributed(remote), store)
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).to_string()
        }
    }

    #[tokio::test]
    async fn test_local_when_no_backend() {
        let limiter = FailoverLimiter::local(settings(2.0, 0.0));
        assert_eq!(limiter.active_backend(), BackendKind::Local);
        assert!(limiter.allow("k", 1.0).await);
        assert!(limiter.allow("k", 1.0).await);
        assert!(!limiter.allow("k", 1.0).await);
        assert_eq!(limiter.failover_count(), 0);
    }

    #[tokio::test]
    async fn test_distributed_when_healthy() {
        let (limiter, store) = distributed(1.0, 0.0);
        assert!(limiter.allow("k", 1.0).await);
        assert!(!limiter.allow("k", 1.0).await);
        assert_eq!(limiter.active_backend(), BackendKind::Distributed);
        assert_eq!(store.bucket_tokens("fo:k:state"), Some(0.0));
    }

    #[tokio::test]
    async fn test_outage_fails_over_and_keeps_limiting() {
        let (limiter, store) = distributed(1.0, 0.0);
        store.fail_all(true);

        // The failing call is admitted by the fresh local bucket.
        assert!(limiter.allow("k", 1.0).await);
        assert_eq!(limiter.active_backend(), BackendKind::Local);
        assert!(!limiter.allow("k", 1.0).await);
    }

    #[tokio::test]
    async fn test_failover_is_one_way() {
        let (limiter, store) = distributed(5.0, 0.0);
        store.fail_all(true);
        limiter.allow("k", 1.0).await;

        store.fail_all(false);
        limiter.allow("k", 1.0).await;
        assert_eq!(limiter.active_backend(), BackendKind::Local);
        assert_eq!(store.bucket_tokens("fo:k:state"), None);
    }

    #[tokio::test]
    async fn test_budgets_are_not_migrated() {
        let (limiter, store) = distributed(2.0, 0.0);
        assert!(limiter.allow("k", 1.0).await);
        assert!(limiter.allow("k", 1.0).await);
        assert!(!limiter.allow("k", 1.0).await);

        store.fail_all(true);
        assert!(limiter.allow("k", 1.0).await);
        assert!(limiter.allow("k", 1.0).await);
        assert!(!limiter.allow("k", 1.0).await);
    }

    #[tokio::test]
    async fn test_repeated_failures_swap_once() {
        let (limiter, store) = distributed(3.0, 0.0);
        store.fail_all(true);

        limiter.allow("a", 1.0).await;
        let first = limiter.local_limiter().unwrap();
        limiter.allow("b", 1.0).await;
        let second = limiter.local_limiter().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(limiter.failover_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_swap_once() {
        let (limiter, store) = distributed(100.0, 0.0);
        let limiter = Arc::new(limiter);
        store.fail_all(true);

        let calls = (0..32).map(|idx| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.allow(&format!("k{}", idx % 4), 1.0).await })
        });
        for result in futures::future::join_all(calls).await {
            assert!(result.unwrap());
        }

        assert_eq!(limiter.failover_count(), 1);
        assert_eq!(limiter.active_backend(), BackendKind::Local);
    }

    #[tokio::test]
    async fn test_failover_logs_once_with_fingerprint() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (limiter, store) = distributed(3.0, 0.0);
        store.fail_all(true);
        let secret = "key:super-secret-token";
        limiter.allow(secret, 1.0).await;
        limiter.allow(secret, 1.0).await;

        let output = logs.contents();
        assert_eq!(output.lines().count(), 1);
        assert!(output.contains("WARN"));
        assert!(output.contains("distributed"));
        assert!(output.contains(&fingerprint(secret)));
        assert!(!output.contains("super-secret-token"));
    }

    #[tokio::test]
    async fn test_local_clock_drives_refill_after_failover() {
        let clock = ManualClock::new(0.0);
        let (limiter, store) = distributed(1.0, 1.0);
        let limiter = limiter.with_local_clock(Arc::new(clock.clone()));
        store.fail_all(true);

        assert!(limiter.allow("k", 1.0).await);
        assert!(!limiter.allow("k", 1.0).await);
        clock.advance(1.0);
        assert!(limiter.allow("k", 1.0).await);
    }

    #[tokio::test]
    async fn test_from_config_without_backend_is_local() {
        let config = LimiterConfig {
            capacity: 2,
            refill_rate: 0.0,
            ..LimiterConfig::default()
        };
        let limiter = FailoverLimiter::from_config(&config).unwrap();
        assert_eq!(limiter.active_backend(), BackendKind::Local);
    }

    #[tokio::test]
    async fn test_from_config_memory_backend_is_distributed() {
        let config = LimiterConfig {
            backend_url: Some("memory://".to_string()),
            ..LimiterConfig::default()
        };
        let limiter = FailoverLimiter::from_config(&config).unwrap();
        assert_eq!(limiter.active_backend(), BackendKind::Distributed);
        assert!(limiter.allow("k", 1.0).await);
    }

    #[tokio::test]
    async fn test_from_config_unreachable_redis_fails_over() {
        let config = LimiterConfig {
            backend_url: Some("redis://127.0.0.1:1/".to_string()),
            capacity: 1,
            refill_rate: 0.0,
            ..LimiterConfig::default()
        };
        let limiter = FailoverLimiter::from_config(&config).unwrap();
        assert!(limiter.allow("k", 1.0).await);
        assert_eq!(limiter.active_backend(), BackendKind::Local);
        assert!(!limiter.allow("k", 1.0).await);
    }

    #[tokio::test]
    async fn test_invalid_cost_refused_on_every_backend() {
        let local = FailoverLimiter::local(settings(1.0, 0.0));
        assert!(local.allow("k", 1.0).await);
        assert!(!local.allow("k", -1.0).await);
        assert!(!local.allow("k", 1.0).await);

        let (remote, store) = distributed(2.0, 0.0);
        for needed in [-5.0, f64::NAN, f64::INFINITY] {
            assert!(!remote.allow("k", needed).await);
        }
        assert_eq!(store.bucket_tokens("fo:k:state"), None);
        assert_eq!(store.script_loads(), 0);
        assert_eq!(remote.active_backend(), BackendKind::Distributed);
    }

    #[tokio::test]
    async fn test_zero_cost_acquire_reports_balance() {
        let (limiter, _store) = distributed(3.0, 0.0);
        assert!(limiter.allow("k", 2.0).await);

        let balance = limiter.acquire("k", 0.0).await;
        assert!(balance.allowed);
        assert_eq!(balance.remaining, 1.0);
        assert!(limiter.allow("k", 1.0).await);
        assert!(!limiter.allow("k", 1.0).await);
    }

    #[tokio::test]
    async fn test_from_config_with_shared_store() {
        let handle = store::connect("memory://").unwrap();
        let config = LimiterConfig {
            capacity: 1,
            refill_rate: 0.0,
            ..LimiterConfig::default()
        };
        let first = FailoverLimiter::from_config_with_store(&config, Some(&handle)).unwrap();
        let second = FailoverLimiter::from_config_with_store(&config, Some(&handle)).unwrap();

        assert!(first.allow("k", 1.0).await);
        assert!(!second.allow("k", 1.0).await);

        let local = FailoverLimiter::from_config_with_store(&config, None).unwrap();
        assert_eq!(local.active_backend(), BackendKind::Local);
    }

    #[test]
    fn test_from_config_rejects_invalid_settings() {
        let config = LimiterConfig {
            capacity: 0,
            ..LimiterConfig::default()
        };
        assert!(FailoverLimiter::from_config(&config).is_err());
    }
}
