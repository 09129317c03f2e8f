//! Error types for the gitshop core.
//!
//! The variants follow the webhook error taxonomy: malformed input is
//! rejected outright, business precondition failures are communicated back
//! to the buyer as an issue comment, invalid transitions are treated as
//! already-handled, and infrastructure failures are retryable via source
//! redelivery.

use uuid::Uuid;

use crate::order::OrderStatus;

pub type ShopResult<T> = Result<T, ShopError>;

#[derive(Debug, thiserror::Error)]
pub enum ShopError {
    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("malformed event payload: {0}")]
    MalformedEvent(String),

    #[error("checkout metadata missing or malformed: {0}")]
    MissingMetadata(String),

    #[error("invalid status transition for order {order_id}: expected one of {from_any_of:?}, target {to}")]
    InvalidStatusTransition {
        order_id: Uuid,
        from_any_of: Vec<OrderStatus>,
        to: OrderStatus,
    },

    #[error("order already exists for shop {shop_id} issue #{issue_number}")]
    OrderAlreadyExists { shop_id: Uuid, issue_number: i64 },

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("shop not found: {0}")]
    ShopNotFound(String),

    #[error("shop is disconnected: {0}")]
    ShopDisconnected(String),

    #[error("shop has no connected payment account")]
    PaymentAccountMissing,

    #[error("connected payment account is not ready to accept charges")]
    PaymentAccountNotReady,

    #[error("no SKU found in issue body")]
    MissingSku,

    #[error("unknown SKU: {0}")]
    UnknownSku(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("permission denied for {0}")]
    PermissionDenied(String),

    #[error("payment retry not available while order is {0}")]
    RetryNotAvailable(OrderStatus),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("stripe error: {0}")]
    Stripe(#[from] stripe::StripeError),

    #[error("code host error: {0}")]
    CodeHost(String),

    #[error("email error: {0}")]
    Email(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ShopError {
    /// Whether the webhook should be answered with a retryable (5xx) status
    /// so the source redelivers the event.
    ///
    /// Only infrastructure failures qualify; everything else is either a
    /// client error or a domain-level outcome that redelivery cannot fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ShopError::Database(_)
                | ShopError::Redis(_)
                | ShopError::Stripe(_)
                | ShopError::CodeHost(_)
        )
    }

    /// Buyer-facing explanation for business precondition failures, posted
    /// as an issue comment. `None` means the error is not something the
    /// buyer can act on.
    pub fn user_message(&self) -> Option<String> {
        match self {
            ShopError::ShopDisconnected(repo) => Some(format!(
                "This shop (`{repo}`) is currently disconnected and not accepting new orders."
            )),
            ShopError::PaymentAccountMissing => Some(
                "This shop has no connected payment account yet, so orders cannot be taken. \
                 The shop owner needs to finish payment onboarding first."
                    .to_string(),
            ),
            ShopError::PaymentAccountNotReady => Some(
                "This shop's payment account is still being set up and cannot accept charges \
                 yet. Please try again once the shop owner has completed onboarding."
                    .to_string(),
            ),
            ShopError::MissingSku => Some(
                "We could not find a product SKU in this issue. Please include a line like \
                 `SKU: COFFEE_V1` or fill in the SKU field of the order form."
                    .to_string(),
            ),
            ShopError::UnknownSku(sku) => Some(format!(
                "The SKU `{sku}` is not in this shop's catalog. Please check the product \
                 listing and open a new order."
            )),
            ShopError::Catalog(reason) => Some(format!(
                "This shop's catalog file could not be loaded ({reason}), so the order \
                 cannot be priced. The shop owner has to fix the catalog first."
            )),
            ShopError::PermissionDenied(login) => Some(format!(
                "Sorry @{login}, only the original orderer or a repository collaborator \
                 with write access can retry payment for this order."
            )),
            ShopError::RetryNotAvailable(status) => Some(format!(
                "Payment retry is only available for failed payments; this order is \
                 currently `{status}`."
            )),
            ShopError::OrderNotFound(_) => {
                Some("No order is associated with this issue.".to_string())
            }
            ShopError::ShopNotFound(repo) => Some(format!(
                "`{repo}` is not set up as a gitshop shop, so there is nothing to retry."
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_covers_infrastructure_only() {
        assert!(ShopError::CodeHost("503".into()).is_retryable());
        assert!(ShopError::Database(sqlx::Error::PoolClosed).is_retryable());
        assert!(!ShopError::WebhookSignatureInvalid.is_retryable());
        assert!(!ShopError::MissingSku.is_retryable());
        assert!(!ShopError::InvalidStatusTransition {
            order_id: Uuid::new_v4(),
            from_any_of: vec![OrderStatus::Paid],
            to: OrderStatus::Shipped,
        }
        .is_retryable());
    }

    #[test]
    fn user_messages_exist_for_business_preconditions() {
        assert!(ShopError::ShopDisconnected("a/b".into()).user_message().is_some());
        assert!(ShopError::UnknownSku("X".into()).user_message().is_some());
        assert!(ShopError::PermissionDenied("alice".into()).user_message().is_some());
        assert!(ShopError::MalformedEvent("x".into()).user_message().is_none());
        assert!(ShopError::WebhookSignatureInvalid.user_message().is_none());
    }
}
