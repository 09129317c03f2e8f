#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! GitShop API Server
//!
//! HTTP surface of the order engine: verified webhook receivers for GitHub
//! and Stripe, plus the admin fulfilment endpoints.

mod config;
mod routes;
mod signature;
mod state;

use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{config::Config, routes::create_router, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gitshop_api=debug,gitshop_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting GitShop API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = gitshop_core::db::create_pool(&config.database_url).await?;
    gitshop_core::db::run_migrations(&pool).await?;

    let bind_address = config.bind_address.clone();
    let state = AppState::new(config, pool).await?;
    let app = create_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %bind_address, "GitShop API listening");
    axum::serve(listener, app).await?;
    Ok(())
}
