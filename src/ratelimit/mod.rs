//! Token bucket rate limiting with a shared backend and local failover.

pub mod bucket;
mod backend;
mod distributed;
mod failover;
mod local;

pub use backend::{BackendKind, RateLimiterBackend};
pub use bucket::{is_valid_cost, step, BucketSettings, Decision};
pub use distributed::{DistributedLimiter, BUCKET_SCRIPT};
pub use failover::FailoverLimiter;
pub use local::{LocalLimiter, NO_REFILL_TTL};
