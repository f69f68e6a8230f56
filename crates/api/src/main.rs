// API server clippy configuration
#![allow(clippy::needless_borrows_for_generic_args)]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Olly API Server
//!
//! Serves license validation and redemption, the credit ledger, admin
//! entitlement tooling and the AppSumo / LemonSqueezy webhooks.

use std::net::SocketAddr;

use axum::http::{header, HeaderName, Method};
use axum::middleware;
use olly_api::{routes::create_router, security::security_headers_middleware, AppState, Config};
use olly_shared::{create_migration_pool, create_pool, run_migrations};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,olly_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Olly API Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    // Migrations go over the direct URL; poolers may not support prepared statements
    if config.run_migrations {
        tracing::info!("Running database migrations...");
        let migration_url = config
            .database_direct_url
            .as_ref()
            .unwrap_or(&config.database_url);
        let migration_pool = create_migration_pool(migration_url).await?;
        run_migrations(&migration_pool).await?;
        migration_pool.close().await;
        tracing::info!("Database migrations applied");
    } else {
        tracing::info!("Database migrations skipped (RUN_MIGRATIONS not set)");
    }

    let addr: SocketAddr = config.bind_address.parse()?;
    let state = AppState::new(pool, config);

    let allowed_origins = std::env::var("ALLOWED_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string());
    let origins: Vec<_> = allowed_origins
        .split(',')
        .filter_map(|origin| origin.trim().parse().ok())
        .collect();
    tracing::info!(origins = %allowed_origins, "CORS configured");

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
            HeaderName::from_static("x-csrf-token"),
        ])
        .expose_headers([header::CONTENT_TYPE])
        .allow_credentials(true);

    let app = create_router(state)
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
