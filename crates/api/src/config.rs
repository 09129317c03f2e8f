//! Environment-driven configuration.

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: String,
    /// When unset, the in-memory dedupe gate is used (single instance only).
    pub redis_url: Option<String>,
    pub github_webhook_secret: String,
    pub github_token: String,
    /// Override for GitHub Enterprise; defaults to api.github.com.
    pub github_api_url: Option<String>,
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    /// Catalog file path inside shop repositories.
    pub catalog_path: Option<String>,
    /// Bearer token for the admin fulfilment endpoints.
    pub admin_token: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            bind_address: std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            database_url: required("DATABASE_URL")?,
            redis_url: std::env::var("REDIS_URL").ok(),
            github_webhook_secret: required("GITHUB_WEBHOOK_SECRET")?,
            github_token: required("GITHUB_TOKEN")?,
            github_api_url: std::env::var("GITHUB_API_URL").ok(),
            stripe_secret_key: required("STRIPE_SECRET_KEY")?,
            stripe_webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            catalog_path: std::env::var("GITSHOP_CATALOG_PATH").ok(),
            admin_token: required("GITSHOP_ADMIN_TOKEN")?,
        })
    }
}

fn required(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("{name} must be set"))
}
