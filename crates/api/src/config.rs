//! Server configuration loaded from environment variables

use std::time::Duration;

use olly_shared::DEFAULT_MAX_KEYS;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Direct (non-pooled) connection used for migrations
    pub database_direct_url: Option<String>,
    pub bind_address: String,
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    pub appsumo_webhook_secret: Option<String>,
    pub lemon_webhook_secret: Option<String>,
    /// Requests allowed per window on the public license endpoints
    pub rate_limit_max: u32,
    pub rate_limit_window: Duration,
    /// Client keys the limiter tracks before refusing unseen ones
    pub rate_limit_max_keys: usize,
    pub stats_cache_ttl: Duration,
    pub run_migrations: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; `from_env` passes the process environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            database_direct_url: get("DATABASE_DIRECT_URL"),
            bind_address: get("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            jwt_secret: required("JWT_SECRET")?,
            jwt_expiry_hours: parse_or(&get, "JWT_EXPIRY_HOURS", 24)?,
            appsumo_webhook_secret: get("APPSUMO_WEBHOOK_SECRET"),
            lemon_webhook_secret: get("LEMON_WEBHOOK_SECRET"),
            rate_limit_max: parse_or(&get, "RATE_LIMIT_MAX", 30)?,
            rate_limit_window: Duration::from_secs(parse_or(&get, "RATE_LIMIT_WINDOW_SECS", 60)?),
            rate_limit_max_keys: parse_or(&get, "RATE_LIMIT_MAX_KEYS", DEFAULT_MAX_KEYS)?,
            stats_cache_ttl: Duration::from_secs(parse_or(&get, "STATS_CACHE_TTL_SECS", 60)?),
            run_migrations: get("RUN_MIGRATIONS")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        })
    }
}

fn parse_or<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/olly"),
            ("JWT_SECRET", "secret"),
        ]))
        .unwrap();

        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.jwt_expiry_hours, 24);
        assert_eq!(config.rate_limit_max, 30);
        assert_eq!(config.rate_limit_window, Duration::from_secs(60));
        assert_eq!(config.rate_limit_max_keys, DEFAULT_MAX_KEYS);
        assert!(config.appsumo_webhook_secret.is_none());
        assert!(!config.run_migrations);
    }

    #[test]
    fn test_missing_required() {
        let err = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://x")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("JWT_SECRET")));

        // Blank counts as missing
        let err = Config::from_lookup(lookup(&[("DATABASE_URL", "  "), ("JWT_SECRET", "s")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn test_invalid_number() {
        let err = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"),
            ("JWT_SECRET", "s"),
            ("RATE_LIMIT_MAX", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "RATE_LIMIT_MAX", .. }));
    }

    #[test]
    fn test_run_migrations_flag() {
        for (value, expected) in [("true", true), ("1", true), ("YES", true), ("no", false)] {
            let config = Config::from_lookup(lookup(&[
                ("DATABASE_URL", "postgres://x"),
                ("JWT_SECRET", "s"),
                ("RUN_MIGRATIONS", value),
            ]))
            .unwrap();
            assert_eq!(config.run_migrations, expected, "RUN_MIGRATIONS={}", value);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_reads_process_environment() {
        std::env::set_var("DATABASE_URL", "postgres://env/olly");
        std::env::set_var("JWT_SECRET", "env-secret");
        std::env::set_var("LEMON_WEBHOOK_SECRET", "lemon");

        let config = Config::from_env().unwrap();
        assert_eq!(config.database_url, "postgres://env/olly");
        assert_eq!(config.lemon_webhook_secret.as_deref(), Some("lemon"));

        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("JWT_SECRET");
        std::env::remove_var("LEMON_WEBHOOK_SECRET");
    }
}
