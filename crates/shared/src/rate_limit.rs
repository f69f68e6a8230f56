//! In-memory fixed-window rate limiting
//!
//! State is process-local and lost on restart. Each key (usually a client IP)
//! gets its own window; the first request after a window closes opens the next.
//! The number of tracked keys is capped: once the map is full and expired
//! windows have been swept, requests from unseen keys are rejected until
//! space frees up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Default cap on tracked keys
pub const DEFAULT_MAX_KEYS: usize = 50_000;

/// Rate limit configuration
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Requests allowed per window
    pub max_requests: u32,
    /// Window length
    pub window: Duration,
    /// Distinct keys tracked at once
    pub max_keys: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window: Duration::from_secs(60),
            max_keys: DEFAULT_MAX_KEYS,
        }
    }
}

/// Outcome of a rate limit check
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    /// Seconds until the window resets (only set when rejected)
    pub retry_after_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: Instant,
    count: u32,
}

/// Fixed-window rate limiter keyed by an arbitrary string
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Arc<Mutex<HashMap<String, Window>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Limiter with the default 30 requests per minute
    pub fn new_in_memory() -> Self {
        Self::new(RateLimitConfig::default())
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Count a request against `key` and report whether it is allowed
    pub async fn check(&self, key: &str) -> RateLimitResult {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        if windows.len() >= self.config.max_keys && !windows.contains_key(key) {
            let window = self.config.window;
            windows.retain(|_, w| now.duration_since(w.started_at) < window);

            if windows.len() >= self.config.max_keys {
                let retry_after = windows
                    .values()
                    .map(|w| window.saturating_sub(now.duration_since(w.started_at)))
                    .min()
                    .unwrap_or(window)
                    .as_secs()
                    .max(1);
                tracing::warn!(
                    tracked_keys = windows.len(),
                    "Rate limiter full, rejecting unseen key"
                );
                return RateLimitResult {
                    allowed: false,
                    remaining: 0,
                    retry_after_seconds: Some(retry_after),
                };
            }
        }

        let entry = windows.entry(key.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });

        if now.duration_since(entry.started_at) >= self.config.window {
            *entry = Window {
                started_at: now,
                count: 0,
            };
        }

        if entry.count >= self.config.max_requests {
            let elapsed = now.duration_since(entry.started_at);
            let retry_after = self.config.window.saturating_sub(elapsed).as_secs().max(1);
            tracing::debug!(key = %key, count = entry.count, "Rate limit exceeded");
            return RateLimitResult {
                allowed: false,
                remaining: 0,
                retry_after_seconds: Some(retry_after),
            };
        }

        entry.count += 1;
        RateLimitResult {
            allowed: true,
            remaining: self.config.max_requests - entry.count,
            retry_after_seconds: None,
        }
    }

    /// Forget all windows
    pub async fn reset(&self) {
        self.windows.lock().await.clear();
    }
}
