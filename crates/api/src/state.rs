//! Application state wiring.

use std::sync::Arc;

use sqlx::PgPool;

use gitshop_core::{
    catalog::DEFAULT_CATALOG_PATH, CatalogService, CodeHostClient, GithubCatalogLoader,
    GithubClient, GithubRouter, IdempotencyGate, LogEmailSender, MemoryGate, OrderEngine,
    PgOrderStore, PgShopStore, RedisGate, ShopStore, StripeGateway, StripeRouter,
};

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Arc<OrderEngine>,
    pub github_router: Arc<GithubRouter>,
    pub stripe_router: Arc<StripeRouter>,
}

impl AppState {
    pub async fn new(config: Config, pool: PgPool) -> anyhow::Result<Self> {
        let orders = Arc::new(PgOrderStore::new(pool.clone()));
        let shops: Arc<dyn ShopStore> = Arc::new(PgShopStore::new(pool));

        let gate: Arc<dyn IdempotencyGate> = match &config.redis_url {
            Some(url) => {
                let client = redis::Client::open(url.as_str())?;
                let manager = redis::aio::ConnectionManager::new(client).await?;
                tracing::info!("Redis dedupe gate connected");
                Arc::new(RedisGate::new(manager))
            }
            None => {
                tracing::warn!(
                    "REDIS_URL not set, using in-memory dedupe gate (single instance only)"
                );
                Arc::new(MemoryGate::new())
            }
        };

        let code_host: Arc<dyn CodeHostClient> = Arc::new(match &config.github_api_url {
            Some(url) => GithubClient::with_base_url(config.github_token.clone(), url.clone()),
            None => GithubClient::new(config.github_token.clone()),
        });

        let catalog_path = config
            .catalog_path
            .clone()
            .unwrap_or_else(|| DEFAULT_CATALOG_PATH.to_string());
        let catalog: Arc<dyn CatalogService> = Arc::new(GithubCatalogLoader::new(
            code_host.clone(),
            catalog_path,
        ));

        let gateway = Arc::new(StripeGateway::new(&config.stripe_secret_key));
        let email = Arc::new(LogEmailSender);

        let engine = Arc::new(OrderEngine::new(
            orders,
            shops.clone(),
            catalog,
            gateway,
            code_host,
            email,
        ));

        let github_router = Arc::new(GithubRouter::new(
            gate.clone(),
            shops,
            engine.clone(),
            config.catalog_path.clone(),
        ));
        let stripe_router = Arc::new(StripeRouter::new(gate, engine.clone()));

        Ok(Self {
            config: Arc::new(config),
            engine,
            github_router,
            stripe_router,
        })
    }
}
