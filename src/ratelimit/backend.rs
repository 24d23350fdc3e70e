//! Rate limiter trait for abstracting local and distributed implementations.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use super::bucket::Decision;
use crate::error::LimiterUnavailable;

/// Which kind of backend is answering admission requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Shared store reachable over the network
    Distributed,
    /// Private in-process state
    Local,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Distributed => "distributed",
            BackendKind::Local => "local",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for rate limiter implementations.
///
/// This trait abstracts over both the `LocalLimiter` and the
/// `DistributedLimiter`. An `Err` means the backend could not decide at all,
/// which is distinct from a denial.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// The kind of backend.
    fn kind(&self) -> BackendKind;

    /// Try to take `needed` tokens from the bucket for `key`.
    async fn try_acquire(&self, key: &str, needed: f64) -> Result<Decision, LimiterUnavailable>;
}
