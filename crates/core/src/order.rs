//! Order data model.
//!
//! One order per `(shop, issue_number)` pair; `order_number` always equals
//! the issue number. Money fields are integer minor-currency units. Options
//! and the shipping address are loosely-typed JSON documents so that
//! catalog-defined custom options survive without a fixed schema.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// Failure reason recorded when checkout-session creation fails after the
/// order row was already created.
pub const REASON_CHECKOUT_FAILED: &str = "stripe_checkout_failed";

/// Failure reason recorded when Stripe reports a failed payment intent.
pub const REASON_PAYMENT_INTENT_FAILED: &str = "payment_intent_failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingPayment,
    Paid,
    PaymentFailed,
    Expired,
    Shipped,
    Delivered,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "pending_payment",
            OrderStatus::Paid => "paid",
            OrderStatus::PaymentFailed => "payment_failed",
            OrderStatus::Expired => "expired",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_payment" => Some(OrderStatus::PendingPayment),
            "paid" => Some(OrderStatus::Paid),
            "payment_failed" => Some(OrderStatus::PaymentFailed),
            "expired" => Some(OrderStatus::Expired),
            "shipped" => Some(OrderStatus::Shipped),
            "delivered" => Some(OrderStatus::Delivered),
            "refunded" => Some(OrderStatus::Refunded),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Refunded | OrderStatus::Expired
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted order record.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: Uuid,
    pub shop_id: Uuid,
    pub repo_full_name: String,
    pub issue_number: i64,
    /// Always equal to `issue_number`; kept as its own column so the pair
    /// `(shop_id, order_number)` carries its own uniqueness constraint.
    pub order_number: i64,
    pub sku: String,
    pub quantity: i32,
    pub options: Value,
    pub subtotal_cents: i64,
    pub shipping_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub currency: String,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub shipping_address: Option<Value>,
    pub checkout_session_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub tracking_number: Option<String>,
    pub tracking_url: Option<String>,
    pub carrier: Option<String>,
    pub status: OrderStatus,
    /// Only meaningful alongside `payment_failed`.
    pub failure_reason: Option<String>,
    pub created_at: OffsetDateTime,
    pub paid_at: Option<OffsetDateTime>,
    pub shipped_at: Option<OffsetDateTime>,
    pub delivered_at: Option<OffsetDateTime>,
}

/// Fields required to create an order at intake. The row starts in
/// `pending_payment` with no checkout session attached yet.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub shop_id: Uuid,
    pub repo_full_name: String,
    pub issue_number: i64,
    pub sku: String,
    pub quantity: i32,
    pub options: Value,
    pub subtotal_cents: i64,
    pub shipping_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub currency: String,
    pub customer_email: Option<String>,
}

impl NewOrder {
    /// Invariant: `total = subtotal + shipping + tax`.
    pub fn totals_consistent(&self) -> bool {
        self.total_cents == self.subtotal_cents + self.shipping_cents + self.tax_cents
    }
}

/// Customer details extracted from a completed checkout session.
#[derive(Debug, Clone, Default)]
pub struct PaymentDetails {
    pub payment_intent_id: Option<String>,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub shipping_address: Option<Value>,
}

/// Tracking details recorded by the admin-triggered shipment transition.
#[derive(Debug, Clone)]
pub struct Tracking {
    pub tracking_number: String,
    pub tracking_url: Option<String>,
    pub carrier: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            OrderStatus::PendingPayment,
            OrderStatus::Paid,
            OrderStatus::PaymentFailed,
            OrderStatus::Expired,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
            OrderStatus::Refunded,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::parse("cancelled"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(OrderStatus::Delivered.is_terminal());
        assert!(OrderStatus::Refunded.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::Paid.is_terminal());
        assert!(!OrderStatus::PaymentFailed.is_terminal());
    }

    #[test]
    fn totals_invariant() {
        let order = NewOrder {
            shop_id: Uuid::new_v4(),
            repo_full_name: "octocat/shop".into(),
            issue_number: 7,
            sku: "COFFEE_V1".into(),
            quantity: 3,
            options: serde_json::json!({}),
            subtotal_cents: 5400,
            shipping_cents: 500,
            tax_cents: 0,
            total_cents: 5900,
            currency: "usd".into(),
            customer_email: None,
        };
        assert!(order.totals_consistent());
    }
}
