//! GigMatch API Server
//!
//! Serves the billing endpoints and the inbound Stripe webhook.

use std::net::SocketAddr;

use gigmatch_api::{config::Config, create_router, state::AppState};
use gigmatch_billing::BillingService;
use gigmatch_shared::{create_pool, run_migrations};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gigmatch_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting GigMatch API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    run_migrations(&pool).await?;
    tracing::info!("Migrations applied");

    let billing = BillingService::from_env(pool.clone())
        .map_err(|e| anyhow::anyhow!("Failed to create billing service: {}", e))?;

    let state = AppState::new(pool, config.clone(), billing);
    let app = create_router(state);

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!(addr = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
