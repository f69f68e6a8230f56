#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Olly Shared
//!
//! Types and process-local primitives shared by the API server, the
//! entitlement services and the background worker.

pub mod db;
pub mod rate_limit;
pub mod retry;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use rate_limit::{RateLimitConfig, RateLimitResult, RateLimiter, DEFAULT_MAX_KEYS};
pub use retry::{with_backoff, RetryPolicy};
pub use types::*;
