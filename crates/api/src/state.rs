//! Application state

use std::{sync::Arc, time::Duration};

use olly_entitlements::EntitlementService;
use moka::future::Cache;
use olly_shared::{RateLimitConfig, RateLimiter};
use sqlx::PgPool;

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
    routes::admin::EntitlementStats,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub entitlements: Arc<EntitlementService>,
    /// Per-IP limiter for the public license endpoints
    pub rate_limiter: RateLimiter,
    /// Admin stats, dropped on every entitlement write
    pub stats_cache: Cache<&'static str, EntitlementStats>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);

        let entitlements = Arc::new(EntitlementService::from_env(pool.clone()));
        tracing::info!("Entitlement services initialized");

        let rate_limiter = RateLimiter::new(RateLimitConfig {
            max_requests: config.rate_limit_max,
            window: config.rate_limit_window,
            max_keys: config.rate_limit_max_keys,
        });
        tracing::info!(
            max_requests = config.rate_limit_max,
            window_secs = config.rate_limit_window.as_secs(),
            max_keys = config.rate_limit_max_keys,
            "Rate limiter initialized"
        );

        if config.appsumo_webhook_secret.is_none() {
            tracing::warn!("AppSumo webhooks disabled (missing APPSUMO_WEBHOOK_SECRET)");
        }
        if config.lemon_webhook_secret.is_none() {
            tracing::warn!("LemonSqueezy webhooks disabled (missing LEMON_WEBHOOK_SECRET)");
        }

        let stats_cache = stats_cache(config.stats_cache_ttl);

        Self {
            pool,
            config,
            jwt_manager,
            entitlements,
            rate_limiter,
            stats_cache,
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
            pool: self.pool.clone(),
        }
    }
}

/// One entry per stats key, expiring after `ttl`
pub fn stats_cache(ttl: Duration) -> Cache<&'static str, EntitlementStats> {
    Cache::builder().max_capacity(16).time_to_live(ttl).build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(total_users: i64) -> EntitlementStats {
        EntitlementStats {
            total_users,
            total_licenses: 0,
            active_licenses: 0,
            licenses_by_vendor: Default::default(),
            active_sub_licenses: 0,
            assigned_sub_licenses: 0,
            active_subscriptions: 0,
            credits_outstanding: 0,
            webhook_errors_24h: 0,
            computed_at: time::OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_stats_cache_hit_and_invalidate() {
        let cache = stats_cache(Duration::from_secs(60));
        cache.insert("stats", stats(3)).await;
        assert_eq!(cache.get(&"stats").await.map(|s| s.total_users), Some(3));

        cache.invalidate_all();
        assert!(cache.get(&"stats").await.is_none());
    }

    #[tokio::test]
    async fn test_stats_cache_expires() {
        let cache = stats_cache(Duration::from_millis(50));
        cache.insert("stats", stats(1)).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.get(&"stats").await.is_none());
    }
}
