//! Token bucket arithmetic shared by every backend.

use crate::error::{Result, TurnstileError};

/// Capacity and refill rate for a family of buckets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSettings {
    capacity: f64,
    refill_rate: f64,
}

impl BucketSettings {
    /// Validate and build bucket settings.
    ///
    /// `capacity` must be positive and `refill_rate` (tokens per second) must
    /// be zero or positive; both must be finite.
    pub fn new(capacity: f64, refill_rate: f64) -> Result<Self> {
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(TurnstileError::Config(format!(
                "capacity must be a positive number, got {}",
                capacity
            )));
        }
        if !refill_rate.is_finite() || refill_rate < 0.0 {
            return Err(TurnstileError::Config(format!(
                "refill_rate must be zero or positive, got {}",
                refill_rate
            )));
        }
        Ok(Self {
            capacity,
            refill_rate,
        })
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Run one bucket step against these settings.
    pub fn step(&self, tokens: f64, last_refill: f64, now: f64, needed: f64) -> Decision {
        step(
            tokens,
            last_refill,
            self.capacity,
            self.refill_rate,
            now,
            needed,
        )
    }

    /// Seconds until a bucket holding `tokens` is full again, if it ever will be.
    pub fn secs_until_full(&self, tokens: f64) -> Option<f64> {
        if tokens >= self.capacity {
            return Some(0.0);
        }
        if self.refill_rate > 0.0 {
            Some((self.capacity - tokens) / self.refill_rate)
        } else {
            None
        }
    }
}

/// Outcome of a single bucket step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Tokens left in the bucket after the step
    pub remaining: f64,
}

impl Decision {
    pub fn allowed(remaining: f64) -> Self {
        Self {
            allowed: true,
            remaining,
        }
    }

    pub fn denied(remaining: f64) -> Self {
        Self {
            allowed: false,
            remaining,
        }
    }
}

/// Whether `needed` is a cost a bucket can be charged.
///
/// Negative costs would hand tokens back, so only finite, non-negative amounts
/// qualify.
pub fn is_valid_cost(needed: f64) -> bool {
    needed.is_finite() && needed >= 0.0
}

/// Refill a bucket up to `now` and try to take `needed` tokens from it.
///
/// Elapsed time is clamped at zero so a clock that steps backwards never
/// drains a bucket. A denied request does not consume tokens, and an invalid
/// cost is always denied. The result stays within `[0, capacity]`.
pub fn step(
    tokens: f64,
    last_refill: f64,
    capacity: f64,
    refill_rate: f64,
    now: f64,
    needed: f64,
) -> Decision {
    let elapsed = (now - last_refill).max(0.0);
    let refilled = (tokens + elapsed * refill_rate).min(capacity).max(0.0);

    if !is_valid_cost(needed) {
        return Decision::denied(refilled);
    }
    if refilled >= needed {
        Decision::allowed((refilled - needed).clamp(0.0, capacity))
    } else {
        Decision::denied(refilled)
    }
}
