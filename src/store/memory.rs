//! In-process stand-in for the shared store.
//!
//! Behaves like a single Redis node running the bucket script: hashes are
//! cached by content hash, records carry the same safety expiry, and every
//! operation is atomic. Faults can be injected to exercise failover paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::{BucketArgs, CounterStore, ScriptReply, ScriptStore};
use crate::error::StoreError;
use crate::ratelimit::bucket;

/// Seconds a bucket record survives without being touched.
const RECORD_TTL_SECS: f64 = 3600.0;

#[derive(Debug, Clone, Copy)]
struct BucketRecord {
    tokens: f64,
    last_ts: f64,
    expires_at: f64,
}

#[derive(Debug, Default)]
struct MemoryState {
    scripts: HashSet<String>,
    buckets: HashMap<String, BucketRecord>,
    counters: HashMap<String, f64>,
}

/// A shared store that lives inside the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    failing: AtomicBool,
    latency_ms: AtomicUsize,
    script_loads: AtomicUsize,
    full_evals: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn fail_all(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every call, e.g. to trip client-side timeouts.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as usize, Ordering::SeqCst);
    }

    /// Drop all cached scripts, as `SCRIPT FLUSH` would.
    pub fn flush_scripts(&self) {
        self.state.lock().scripts.clear();
    }

    /// Number of `load_script` calls served.
    pub fn script_loads(&self) -> usize {
        self.script_loads.load(Ordering::SeqCst)
    }

    /// Number of calls that shipped the full script body.
    pub fn full_evals(&self) -> usize {
        self.full_evals.load(Ordering::SeqCst)
    }

    /// Stored tokens for a bucket record, if present.
    pub fn bucket_tokens(&self, key: &str) -> Option<f64> {
        self.state.lock().buckets.get(key).map(|record| record.tokens)
    }

    fn script_hash(body: &str) -> String {
        let digest = Sha256::digest(body.as_bytes());
        hex::encode(&digest[..20])
    }

    async fn enter(&self) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency as u64)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("connection refused".to_string()));
        }
        Ok(())
    }

    fn run_bucket(&self, key: &str, args: BucketArgs) -> ScriptReply {
        let mut state = self.state.lock();
        let record = state
            .buckets
            .get(key)
            .filter(|record| record.expires_at > args.now)
            .copied();
        let (tokens, last_ts) = match record {
            Some(record) => (record.tokens, record.last_ts),
            None => (args.capacity, args.now),
        };

        let decision = bucket::step(
            tokens,
            last_ts,
            args.capacity,
            args.refill_rate,
            args.now,
            args.needed,
        );
        state.buckets.insert(
            key.to_string(),
            BucketRecord {
                tokens: decision.remaining,
                last_ts: args.now,
                expires_at: args.now + RECORD_TTL_SECS,
            },
        );

        ScriptReply {
            allowed: i64::from(decision.allowed),
            remaining: decision.remaining.to_string(),
        }
    }
}

#[async_trait]
impl ScriptStore for MemoryStore {
    async fn load_script(&self, body: &str) -> Result<String, StoreError> {
        self.enter().await?;
        self.script_loads.fetch_add(1, Ordering::SeqCst);
        let sha = Self::script_hash(body);
        self.state.lock().scripts.insert(sha.clone());
        Ok(sha)
    }

    async fn eval_sha(
        &self,
        sha: &str,
        key: &str,
        args: BucketArgs,
    ) -> Result<ScriptReply, StoreError> {
        self.enter().await?;
        if !self.state.lock().scripts.contains(sha) {
            return Err(StoreError::NoScript);
        }
        Ok(self.run_bucket(key, args))
    }

    async fn eval(&self, body: &str, key: &str, args: BucketArgs) -> Result<ScriptReply, StoreError> {
        self.enter().await?;
        self.full_evals.fetch_add(1, Ordering::SeqCst);
        self.state.lock().scripts.insert(Self::script_hash(body));
        Ok(self.run_bucket(key, args))
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn incr_by_float(&self, key: &str, amount: f64) -> Result<f64, StoreError> {
        self.enter().await?;
        let mut state = self.state.lock();
        let total = state.counters.entry(key.to_string()).or_insert(0.0);
        *total += amount;
        Ok(*total)
    }

    async fn get_float(&self, key: &str) -> Result<Option<f64>, StoreError> {
        self.enter().await?;
        Ok(self.state.lock().counters.get(key).copied())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.enter().await?;
        self.state.lock().counters.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(now: f64, needed: f64) -> BucketArgs {
        BucketArgs {
            capacity: 2.0,
            refill_rate: 0.0,
            now,
            needed,
        }
    }

    #[tokio::test]
    async fn test_eval_sha_requires_loaded_script() {
        let store = MemoryStore::new();
        let err = store.eval_sha("deadbeef", "k", args(0.0, 1.0)).await;
        assert_eq!(err, Err(StoreError::NoScript));

        let sha = store.load_script("return 1").await.unwrap();
        let reply = store.eval_sha(&sha, "k", args(0.0, 1.0)).await.unwrap();
        assert_eq!(reply.allowed, 1);
        assert_eq!(reply.remaining, "1");
    }

    #[tokio::test]
    async fn test_flush_drops_scripts() {
        let store = MemoryStore::new();
        let sha = store.load_script("return 1").await.unwrap();
        store.flush_scripts();
        assert_eq!(
            store.eval_sha(&sha, "k", args(0.0, 1.0)).await,
            Err(StoreError::NoScript)
        );
    }

    #[tokio::test]
    async fn test_record_expires_after_safety_window() {
        let store = MemoryStore::new();
        store.eval("body", "k", args(0.0, 2.0)).await.unwrap();
        let denied = store.eval("body", "k", args(1.0, 1.0)).await.unwrap();
        assert_eq!(denied.allowed, 0);

        let fresh = store
            .eval("body", "k", args(RECORD_TTL_SECS + 1.0, 1.0))
            .await
            .unwrap();
        assert_eq!(fresh.allowed, 1);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let store = MemoryStore::new();
        store.fail_all(true);
        assert!(matches!(
            store.incr_by_float("c", 1.0).await,
            Err(StoreError::Backend(_))
        ));

        store.fail_all(false);
        assert_eq!(store.incr_by_float("c", 1.5).await, Ok(1.5));
        assert_eq!(store.get_float("c").await, Ok(Some(1.5)));
        store.delete("c").await.unwrap();
        assert_eq!(store.get_float("c").await, Ok(None));
    }
}
