//! Distributed rate limiter backed by a shared script-capable store.
//!
//! Each decision is one atomic server-side script run, so any number of
//! processes can check the same key without double-spending tokens.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, trace};

use super::backend::{BackendKind, RateLimiterBackend};
use super::bucket::{is_valid_cost, BucketSettings, Decision};
use crate::clock::{Clock, SystemClock};
use crate::error::{LimiterUnavailable, StoreError};
use crate::identity::fingerprint;
use crate::store::{BucketArgs, ScriptReply, ScriptStore};

/// Default bound on a single remote decision.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(250);

/// Atomic token bucket step.
///
/// KEYS[1] is the bucket record; ARGV is capacity, refill rate, now (seconds)
/// and tokens needed. Returns `{allowed, tostring(tokens)}`. Tokens stay within
/// `[0, capacity]` and a negative or non-numeric cost is denied.
pub const BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_per_sec = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local needed = tonumber(ARGV[4])
local state = redis.call('HMGET', key, 'tokens', 'last_ts')
local tokens = tonumber(state[1]) or capacity
local last_ts = tonumber(state[2]) or now
local delta = now - last_ts
if delta < 0 then
  delta = 0
end
tokens = math.max(0, math.min(capacity, tokens + delta * refill_per_sec))
local allowed = 0
local valid = needed ~= nil and needed == needed and needed >= 0 and needed < math.huge
if valid and tokens >= needed then
  tokens = math.max(0, math.min(capacity, tokens - needed))
  allowed = 1
end
redis.call('HSET', key, 'tokens', tostring(tokens), 'last_ts', tostring(now))
redis.call('EXPIRE', key, 3600)
return {allowed, tostring(tokens)}
"#;

/// A stateless client for buckets held in the shared store.
pub struct DistributedLimiter {
    store: Arc<dyn ScriptStore>,
    settings: BucketSettings,
    key_prefix: String,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    script_sha: RwLock<Option<String>>,
}

impl DistributedLimiter {
    /// Create a limiter over `store`, namespacing records under `key_prefix`.
    pub fn new(store: Arc<dyn ScriptStore>, settings: BucketSettings, key_prefix: &str) -> Self {
        Self {
            store,
            settings,
            key_prefix: key_prefix.to_string(),
            timeout: DEFAULT_TIMEOUT,
            clock: Arc::new(SystemClock),
            script_sha: RwLock::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> BucketSettings {
        self.settings
    }

    /// Record key for a limiter key.
    pub fn record_key(&self, key: &str) -> String {
        format!("{}:{}:state", self.key_prefix, key)
    }

    /// Take `needed` tokens from the shared bucket for `key`.
    ///
    /// Any failure that survives the single script reload comes back as
    /// [`LimiterUnavailable`], never as a denial.
    pub async fn acquire(&self, key: &str, needed: f64) -> Result<Decision, LimiterUnavailable> {
        if !is_valid_cost(needed) {
            debug!(key = %fingerprint(key), needed = needed, "Rejecting invalid cost");
        }
        let record_key = self.record_key(key);
        let args = BucketArgs {
            capacity: self.settings.capacity(),
            refill_rate: self.settings.refill_rate(),
            now: self.clock.now_secs(),
            needed,
        };

        let reply = match tokio::time::timeout(self.timeout, self.run(&record_key, args)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
        .map_err(|e| LimiterUnavailable::new(BackendKind::Distributed, e.to_string()))?;

        let decision = parse_reply(&reply)
            .map_err(|e| LimiterUnavailable::new(BackendKind::Distributed, e.to_string()))?;

        trace!(
            key = %fingerprint(key),
            needed = needed,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Distributed rate limit decision"
        );
        Ok(decision)
    }

    async fn run(&self, record_key: &str, args: BucketArgs) -> Result<ScriptReply, StoreError> {
        let sha = self.script_sha().await?;
        match self.store.eval_sha(&sha, record_key, args).await {
            Err(StoreError::NoScript) => {
                debug!(sha = %sha, "Bucket script evicted from store, resending body");
                self.store.eval(BUCKET_SCRIPT, record_key, args).await
            }
            other => other,
        }
    }

    async fn script_sha(&self) -> Result<String, StoreError> {
        let cached = self.script_sha.read().clone();
        if let Some(sha) = cached {
            return Ok(sha);
        }
        let sha = self.store.load_script(BUCKET_SCRIPT).await?;
        debug!(sha = %sha, "Registered bucket script");
        *self.script_sha.write() = Some(sha.clone());
        Ok(sha)
    }
}

fn parse_reply(reply: &ScriptReply) -> Result<Decision, StoreError> {
    let remaining: f64 = reply.remaining.trim().parse().map_err(|_| {
        StoreError::Protocol(format!("non-numeric token count {:?}", reply.remaining))
    })?;
    match reply.allowed {
        1 => Ok(Decision::allowed(remaining)),
        0 => Ok(Decision::denied(remaining)),
        other => Err(StoreError::Protocol(format!("allowed flag {}", other))),
    }
}

#[async_trait]
impl RateLimiterBackend for DistributedLimiter {
    fn kind(&self) -> BackendKind {
        BackendKind::Distributed
    }

    async fn try_acquire(&self, key: &str, needed: f64) -> Result<Decision, LimiterUnavailable> {
        self.acquire(key, needed).await
    }
}
