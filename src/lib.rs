//! Turnstile - Token Bucket Admission Control
//!
//! This crate decides whether a client request may proceed. Buckets live in a
//! shared Redis store so every replica enforces the same budget; when the store
//! becomes unavailable the process switches, once and for good, to in-process
//! buckets. Requests are keyed by credential or by client address, and a
//! separate ledger accumulates per-client cost totals.

pub mod admission;
pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod ratelimit;
pub mod store;
