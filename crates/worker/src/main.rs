#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Olly Background Worker
//!
//! Scheduled jobs:
//! - Subscription and license expiry (every 6 hours)
//! - Entitlement invariant sweep (daily at 04:00 UTC)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use olly_entitlements::{EntitlementService, InvariantCheckSummary, ViolationSeverity};
use olly_shared::{create_pool, with_backoff, RetryPolicy};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Run the expiry pass: subscriptions first, then licenses
async fn run_expiry(service: &EntitlementService, retry: RetryPolicy) {
    match with_backoff(retry, "expire_subscriptions", || {
        service.plans.expire_subscriptions()
    })
    .await
    {
        Ok(count) => info!(expired = count, "Subscription expiry complete"),
        Err(e) => error!(error = %e, "Subscription expiry failed"),
    }

    match with_backoff(retry, "expire_licenses", || service.plans.expire_licenses()).await {
        Ok(count) => info!(expired = count, "License expiry complete"),
        Err(e) => error!(error = %e, "License expiry failed"),
    }
}

/// Log each violation at a level matching its severity
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    info!(
        checks_run = summary.checks_run,
        checks_passed = summary.checks_passed,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        healthy = summary.healthy,
        "Invariant sweep complete"
    );

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                users = ?violation.user_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium => warn!(
                invariant = %violation.invariant,
                users = ?violation.user_ids,
                "{}",
                violation.description
            ),
            ViolationSeverity::Low => info!(
                invariant = %violation.invariant,
                users = ?violation.user_ids,
                "{}",
                violation.description
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Olly Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let service = Arc::new(EntitlementService::from_env(pool));
    let retry = RetryPolicy::default();

    let scheduler = JobScheduler::new().await?;

    // Job 1: Expire subscriptions and licenses
    // Cron: At minute 0 past every 6th hour (0:00, 6:00, 12:00, 18:00 UTC)
    let expiry_service = service.clone();
    scheduler
        .add(Job::new_async("0 0 */6 * * *", move |_uuid, _l| {
            let service = expiry_service.clone();
            Box::pin(async move {
                info!("Running scheduled expiry pass");
                run_expiry(&service, retry).await;
            })
        })?)
        .await?;
    info!("Scheduled: Subscription and license expiry (every 6 hours)");

    // Job 2: Invariant sweep
    let invariant_service = service.clone();
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let service = invariant_service.clone();
            Box::pin(async move {
                info!("Running entitlement invariant sweep");
                match with_backoff(retry, "invariant_sweep", || {
                    service.invariants.run_all_checks()
                })
                .await
                {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Invariant sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Invariant sweep (daily at 04:00 UTC)");

    // Job 3: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;

    scheduler.start().await?;
    info!("Worker scheduler started");

    // Catch up on anything that expired while the worker was down
    run_expiry(&service, retry).await;

    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
