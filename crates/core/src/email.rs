//! Outbound email contract.
//!
//! Rendering and delivery live outside this core; senders are best-effort
//! collaborators whose failures are escalated, never fatal to a webhook.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ShopResult;
use crate::order::Order;
use crate::shop::Shop;

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_order_confirmation(
        &self,
        shop: &Shop,
        order: &Order,
        overrides: Option<&Value>,
    ) -> ShopResult<()>;

    async fn send_order_shipped(
        &self,
        shop: &Shop,
        order: &Order,
        overrides: Option<&Value>,
    ) -> ShopResult<()>;

    async fn send_order_delivered(
        &self,
        shop: &Shop,
        order: &Order,
        overrides: Option<&Value>,
    ) -> ShopResult<()>;
}

/// Default sender when no delivery backend is configured: logs and succeeds.
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send_order_confirmation(
        &self,
        shop: &Shop,
        order: &Order,
        _overrides: Option<&Value>,
    ) -> ShopResult<()> {
        tracing::info!(
            shop = %shop.repo_full_name,
            order_id = %order.id,
            to = ?order.customer_email,
            "Order confirmation email (no sender configured, logged only)"
        );
        Ok(())
    }

    async fn send_order_shipped(
        &self,
        shop: &Shop,
        order: &Order,
        _overrides: Option<&Value>,
    ) -> ShopResult<()> {
        tracing::info!(
            shop = %shop.repo_full_name,
            order_id = %order.id,
            tracking = ?order.tracking_number,
            "Order shipped email (no sender configured, logged only)"
        );
        Ok(())
    }

    async fn send_order_delivered(
        &self,
        shop: &Shop,
        order: &Order,
        _overrides: Option<&Value>,
    ) -> ShopResult<()> {
        tracing::info!(
            shop = %shop.repo_full_name,
            order_id = %order.id,
            "Order delivered email (no sender configured, logged only)"
        );
        Ok(())
    }
}
