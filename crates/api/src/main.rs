//! Reelgate API server entry point

use anyhow::Context;
use reelgate_api::{routes::create_router, AppState, BillingState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reelgate_api=info,reelgate_billing=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    let pool = reelgate_shared::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;

    reelgate_shared::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let billing = BillingState::from_env(pool.clone())
        .context("Failed to initialize billing services")?;

    let state = AppState::new(pool, config.clone(), billing);
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;

    tracing::info!(address = %config.bind_address, "Reelgate API listening");

    axum::serve(listener, router)
        .await
        .context("Server error")?;

    Ok(())
}
