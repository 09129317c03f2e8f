//! Catalog service.
//!
//! The catalog itself is an external concern: this module only defines the
//! contract (a validated, priced product list per repository) and a thin
//! loader that fetches the catalog file from the repository and parses it.
//! Pricing ignores unknown or invalid option values rather than failing the
//! whole order; an unknown SKU is fatal.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ShopError, ShopResult};
use crate::github::CodeHostClient;

/// Default catalog filename at the repository root.
pub const DEFAULT_CATALOG_PATH: &str = "gitshop.json";

#[derive(Debug, Clone, Deserialize)]
pub struct Product {
    pub sku: String,
    pub name: String,
    pub price_cents: i64,
    /// Catalog-defined custom options, opaque to the engine.
    #[serde(default)]
    pub options: HashMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Catalog {
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Flat shipping cost applied to every order.
    #[serde(default)]
    pub shipping_cents: i64,
    pub products: Vec<Product>,
}

fn default_currency() -> String {
    "usd".to_string()
}

/// Priced totals for one order line. Tax collection is delegated to the
/// payment platform, so `tax_cents` is zero at intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderPricing {
    pub subtotal_cents: i64,
    pub shipping_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
}

impl Catalog {
    pub fn product(&self, sku: &str) -> Option<&Product> {
        self.products.iter().find(|p| p.sku == sku)
    }

    /// Price `quantity` units of `sku` plus flat shipping.
    pub fn price(&self, sku: &str, quantity: i64) -> ShopResult<OrderPricing> {
        let product = self
            .product(sku)
            .ok_or_else(|| ShopError::UnknownSku(sku.to_string()))?;
        let subtotal_cents = product.price_cents * quantity;
        Ok(OrderPricing {
            subtotal_cents,
            shipping_cents: self.shipping_cents,
            tax_cents: 0,
            total_cents: subtotal_cents + self.shipping_cents,
        })
    }
}

#[async_trait]
pub trait CatalogService: Send + Sync {
    /// Load the validated catalog for a repository.
    async fn load(&self, repo_full_name: &str) -> ShopResult<Catalog>;
}

/// Loads the catalog file from the shop repository via the code host.
pub struct GithubCatalogLoader {
    code_host: Arc<dyn CodeHostClient>,
    catalog_path: String,
}

impl GithubCatalogLoader {
    pub fn new(code_host: Arc<dyn CodeHostClient>, catalog_path: impl Into<String>) -> Self {
        Self {
            code_host,
            catalog_path: catalog_path.into(),
        }
    }
}

#[async_trait]
impl CatalogService for GithubCatalogLoader {
    async fn load(&self, repo_full_name: &str) -> ShopResult<Catalog> {
        let bytes = self
            .code_host
            .get_file(repo_full_name, &self.catalog_path)
            .await
            .map_err(|e| ShopError::Catalog(format!("{}: {e}", self.catalog_path)))?;

        let catalog: Catalog = serde_json::from_slice(&bytes)
            .map_err(|e| ShopError::Catalog(format!("{} is not valid: {e}", self.catalog_path)))?;

        if catalog.products.is_empty() {
            return Err(ShopError::Catalog(format!(
                "{} lists no products",
                self.catalog_path
            )));
        }

        tracing::debug!(
            repo = repo_full_name,
            products = catalog.products.len(),
            "Catalog loaded"
        );
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        serde_json::from_value(serde_json::json!({
            "currency": "usd",
            "shipping_cents": 500,
            "products": [
                {"sku": "COFFEE_V1", "name": "Coffee", "price_cents": 1800},
                {"sku": "MUG_V2", "name": "Mug", "price_cents": 1200,
                 "options": {"color": ["black", "white"]}}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn prices_quantity_times_unit_plus_flat_shipping() {
        let pricing = catalog().price("COFFEE_V1", 3).unwrap();
        assert_eq!(pricing.subtotal_cents, 5400);
        assert_eq!(pricing.shipping_cents, 500);
        assert_eq!(pricing.total_cents, 5900);
    }

    #[test]
    fn unknown_sku_is_fatal() {
        let err = catalog().price("NOPE", 1).unwrap_err();
        assert!(matches!(err, ShopError::UnknownSku(sku) if sku == "NOPE"));
    }

    #[test]
    fn missing_shipping_defaults_to_zero() {
        let catalog: Catalog = serde_json::from_value(serde_json::json!({
            "products": [{"sku": "A", "name": "a", "price_cents": 100}]
        }))
        .unwrap();
        assert_eq!(catalog.shipping_cents, 0);
        assert_eq!(catalog.currency, "usd");
    }
}
