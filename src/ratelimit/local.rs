//! In-process token bucket limiter.
//!
//! All buckets live in one map behind a single mutex. A min-heap of expiry
//! times lets every call forget buckets that have refilled to capacity, so
//! memory stays proportional to the number of recently active keys.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::backend::{BackendKind, RateLimiterBackend};
use super::bucket::{is_valid_cost, BucketSettings, Decision};
use crate::clock::{Clock, MonotonicClock};
use crate::error::LimiterUnavailable;
use crate::identity::fingerprint;

/// How long a drained bucket is kept when it never refills.
pub const NO_REFILL_TTL: Duration = Duration::from_secs(3600);

/// Stale heap entries tolerated per live bucket before the heap is rebuilt.
const HEAP_SLACK_FACTOR: usize = 4;
const HEAP_SLACK_MIN: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    last_refill: f64,
    expires_at: f64,
}

#[derive(Debug, Clone)]
struct Expiry {
    at: f64,
    key: String,
}

impl PartialEq for Expiry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Expiry {}

impl PartialOrd for Expiry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Expiry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at
            .total_cmp(&other.at)
            .then_with(|| self.key.cmp(&other.key))
    }
}

#[derive(Debug, Default)]
struct LocalState {
    buckets: HashMap<String, BucketState>,
    expirations: BinaryHeap<Reverse<Expiry>>,
}

impl LocalState {
    /// Drop every bucket whose recorded expiry has passed.
    ///
    /// A heap entry only removes its bucket if the bucket still carries the
    /// same expiry; later writes leave older entries behind as no-ops.
    fn prune(&mut self, now: f64) {
        while let Some(Reverse(next)) = self.expirations.peek() {
            if next.at > now {
                break;
            }
            let Some(Reverse(expired)) = self.expirations.pop() else {
                break;
            };
            let current = self
                .buckets
                .get(&expired.key)
                .map(|state| state.expires_at == expired.at)
                .unwrap_or(false);
            if current {
                trace!(key = %fingerprint(&expired.key), "Forgetting expired bucket");
                self.buckets.remove(&expired.key);
            }
        }
    }

    fn compact_if_needed(&mut self) {
        let limit = (self.buckets.len() * HEAP_SLACK_FACTOR).max(HEAP_SLACK_MIN);
        if self.expirations.len() <= limit {
            return;
        }
        debug!(
            heap_len = self.expirations.len(),
            buckets = self.buckets.len(),
            "Rebuilding bucket expiry heap"
        );
        self.expirations = self
            .buckets
            .iter()
            .map(|(key, state)| {
                Reverse(Expiry {
                    at: state.expires_at,
                    key: key.clone(),
                })
            })
            .collect();
    }
}

/// The in-process limiter.
///
/// This struct is thread-safe and can be shared across multiple tasks. It never
/// reports itself unavailable.
pub struct LocalLimiter {
    settings: BucketSettings,
    clock: Arc<dyn Clock>,
    no_refill_ttl: f64,
    state: Mutex<LocalState>,
}

impl LocalLimiter {
    /// Create a local limiter on a monotonic clock.
    pub fn new(settings: BucketSettings) -> Self {
        Self::with_clock(settings, Arc::new(MonotonicClock::default()))
    }

    /// Create a local limiter with an explicit clock.
    pub fn with_clock(settings: BucketSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            no_refill_ttl: NO_REFILL_TTL.as_secs_f64(),
            state: Mutex::new(LocalState::default()),
        }
    }

    /// Override how long drained buckets are kept when `refill_rate` is zero.
    pub fn with_no_refill_ttl(mut self, ttl: Duration) -> Self {
        self.no_refill_ttl = ttl.as_secs_f64();
        self
    }

    pub fn settings(&self) -> BucketSettings {
        self.settings
    }

    /// Take `needed` tokens from the bucket for `key` if it holds enough.
    ///
    /// A zero-cost call never changes the outcome of later calls; it only
    /// refills and prunes.
    pub fn allow(&self, key: &str, needed: f64) -> bool {
        self.acquire(key, needed).allowed
    }

    /// Like [`LocalLimiter::allow`] but also reports the remaining tokens.
    ///
    /// A negative or non-finite `needed` is denied and leaves the bucket as it
    /// was.
    pub fn acquire(&self, key: &str, needed: f64) -> Decision {
        if !is_valid_cost(needed) {
            debug!(key = %fingerprint(key), needed = needed, "Rejecting invalid cost");
        }
        let mut state = self.state.lock();
        let now = self.clock.now_secs();
        state.prune(now);

        let (tokens, last_refill) = match state.buckets.get(key) {
            Some(bucket) => (bucket.tokens, bucket.last_refill),
            None => (self.settings.capacity(), now),
        };
        let decision = self.settings.step(tokens, last_refill, now, needed);

        if decision.remaining >= self.settings.capacity() {
            // A full bucket is indistinguishable from an absent one.
            state.buckets.remove(key);
        } else {
            let expires_at = match self.settings.secs_until_full(decision.remaining) {
                Some(wait) => now + wait,
                None => now + self.no_refill_ttl,
            };
            let previous = state.buckets.insert(
                key.to_string(),
                BucketState {
                    tokens: decision.remaining,
                    last_refill: now.max(last_refill),
                    expires_at,
                },
            );
            if previous.is_none() {
                debug!(key = %fingerprint(key), capacity = self.settings.capacity(), "Tracking new bucket");
            }
            state.expirations.push(Reverse(Expiry {
                at: expires_at,
                key: key.to_string(),
            }));
            state.compact_if_needed();
        }

        trace!(
            key = %fingerprint(key),
            needed = needed,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Local rate limit decision"
        );
        decision
    }

    /// Number of buckets currently held.
    pub fn tracked_keys(&self) -> usize {
        self.state.lock().buckets.len()
    }

    /// Number of entries in the expiry heap, stale ones included.
    pub fn pending_expirations(&self) -> usize {
        self.state.lock().expirations.len()
    }

    /// Stored tokens for `key`, or `None` when the bucket is full or unknown.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        self.state.lock().buckets.get(key).map(|state| state.tokens)
    }

    /// Forget all buckets.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.buckets.clear();
        state.expirations.clear();
    }
}

#[async_trait]
impl RateLimiterBackend for LocalLimiter {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn try_acquire(&self, key: &str, needed: f64) -> Result<Decision, LimiterUnavailable> {
        Ok(self.acquire(key, needed))
    }
}
