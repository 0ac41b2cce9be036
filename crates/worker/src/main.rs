//! GigMatch Background Worker
//!
//! Handles scheduled billing jobs:
//! - Payment retry (dunning) queue drain (every minute)
//! - Period-end cancellation sweep (every 15 minutes)
//! - Processed-webhook ledger pruning (daily at 3:00 AM UTC)

use std::sync::Arc;
use std::time::Duration;

use gigmatch_billing::BillingService;
use gigmatch_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Webhook ledger retention; the processor stops redelivering well before
/// this window closes.
const WEBHOOK_RETENTION_DAYS: i32 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting GigMatch Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Without Stripe configuration there is nothing to reconcile
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Drain due payment retry checks every minute
    let dunning_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = dunning_billing.clone();
            Box::pin(async move {
                match billing.dunning.run_due_checks().await {
                    Ok(0) => {}
                    Ok(processed) => {
                        info!(processed = processed, "Processed due payment retry checks");
                    }
                    Err(e) => {
                        error!(error = %e, "Payment retry drain failed");
                    }
                }
            })
        })?)
        .await?;
    info!("Scheduled: payment retry drain (every minute)");

    // Job 2: Sweep lapsed period-end cancellations every 15 minutes
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                match billing
                    .subscriptions
                    .sweep_expired_period_end_cancellations()
                    .await
                {
                    Ok(0) => {}
                    Ok(swept) => {
                        info!(swept = swept, "Swept expired period-end cancellations");
                    }
                    Err(e) => {
                        error!(error = %e, "Period-end cancellation sweep failed");
                    }
                }
            })
        })?)
        .await?;
    info!("Scheduled: period-end cancellation sweep (every 15 minutes)");

    // Job 3: Prune the processed-webhook ledger daily at 3:00 AM UTC
    let prune_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = prune_billing.clone();
            Box::pin(async move {
                match billing
                    .webhooks
                    .prune_processed_events(WEBHOOK_RETENTION_DAYS)
                    .await
                {
                    Ok(pruned) if pruned > 0 => {
                        info!(
                            pruned = pruned,
                            retention_days = WEBHOOK_RETENTION_DAYS,
                            "Pruned processed webhook events"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "Webhook ledger pruning failed");
                    }
                }
            })
        })?)
        .await?;
    info!("Scheduled: webhook ledger pruning (daily at 3:00 UTC)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("GigMatch Worker started successfully with 3 scheduled jobs");

    // Keep the main task running; the scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
