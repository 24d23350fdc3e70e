//! Shared store seam.
//!
//! The distributed limiter and the cost ledger only need a handful of remote
//! operations. They are expressed as traits so the Redis client can be swapped
//! for the in-process [`MemoryStore`] in tests and single-node setups.

mod memory;
mod redis_store;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Result, StoreError, TurnstileError};

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Arguments passed to the bucket script, in wire order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketArgs {
    pub capacity: f64,
    pub refill_rate: f64,
    pub now: f64,
    pub needed: f64,
}

/// Reply of the bucket script: `{allowed 0|1, tostring(tokens)}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptReply {
    pub allowed: i64,
    pub remaining: String,
}

/// Stores that can run a server-side script atomically.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// Cache `body` on the store and return its content hash.
    async fn load_script(&self, body: &str) -> std::result::Result<String, StoreError>;

    /// Run a cached script by hash against one key.
    ///
    /// Returns [`StoreError::NoScript`] when the store has dropped the script.
    async fn eval_sha(
        &self,
        sha: &str,
        key: &str,
        args: BucketArgs,
    ) -> std::result::Result<ScriptReply, StoreError>;

    /// Send the full script body and run it against one key.
    async fn eval(
        &self,
        body: &str,
        key: &str,
        args: BucketArgs,
    ) -> std::result::Result<ScriptReply, StoreError>;
}

/// Stores that keep floating-point counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `amount` to the counter at `key` and return the new total.
    async fn incr_by_float(&self, key: &str, amount: f64)
        -> std::result::Result<f64, StoreError>;

    /// Read the counter at `key`, if it exists.
    async fn get_float(&self, key: &str) -> std::result::Result<Option<f64>, StoreError>;

    /// Remove the counter at `key`.
    async fn delete(&self, key: &str) -> std::result::Result<(), StoreError>;
}

/// A connected store, usable through either half of the seam.
#[derive(Clone)]
pub enum StoreHandle {
    Redis(Arc<RedisStore>),
    Memory(Arc<MemoryStore>),
}

impl StoreHandle {
    pub fn scripts(&self) -> Arc<dyn ScriptStore> {
        match self {
            StoreHandle::Redis(store) => store.clone() as Arc<dyn ScriptStore>,
            StoreHandle::Memory(store) => store.clone() as Arc<dyn ScriptStore>,
        }
    }

    pub fn counters(&self) -> Arc<dyn CounterStore> {
        match self {
            StoreHandle::Redis(store) => store.clone() as Arc<dyn CounterStore>,
            StoreHandle::Memory(store) => store.clone() as Arc<dyn CounterStore>,
        }
    }
}

/// Open the store named by a backend URL.
///
/// `redis://` and `rediss://` connect lazily to Redis; `memory://` gives a
/// fresh in-process store.
pub fn connect(url: &str) -> Result<StoreHandle> {
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        Ok(StoreHandle::Redis(Arc::new(RedisStore::open(url)?)))
    } else if url.starts_with("memory://") {
        Ok(StoreHandle::Memory(Arc::new(MemoryStore::new())))
    } else {
        Err(TurnstileError::Config(format!(
            "unsupported backend url scheme: {}",
            url.split("://").next().unwrap_or(url)
        )))
    }
}
