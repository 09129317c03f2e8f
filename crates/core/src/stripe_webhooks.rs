//! Stripe event router.
//!
//! Classifies a payment-platform event by its declared type and dispatches
//! to the lifecycle engine. Handlers receive the raw `data.object` payload
//! because its shape varies by event type. Everything unrecognized is
//! logged and acknowledged as a no-op.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::engine::OrderEngine;
use crate::error::{ShopError, ShopResult};
use crate::idempotency::{EventSource, IdempotencyGate};

pub const EVENT_CHECKOUT_COMPLETED: &str = "checkout.session.completed";
pub const EVENT_CHECKOUT_EXPIRED: &str = "checkout.session.expired";
pub const EVENT_PAYMENT_FAILED: &str = "payment_intent.payment_failed";

/// `data.object` of a checkout.session.* event, reduced to the fields the
/// engine needs.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionPayload {
    pub id: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,
    #[serde(default)]
    pub payment_intent: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomerDetails {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<Value>,
}

impl CheckoutSessionPayload {
    /// The payment intent arrives either as a bare id or an expanded object.
    pub fn payment_intent_id(&self) -> Option<String> {
        match &self.payment_intent {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Object(obj)) => obj
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        }
    }
}

/// `data.object` of a payment_intent.payment_failed event.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentPayload {
    pub id: String,
    #[serde(default)]
    pub metadata: Value,
}

pub struct StripeRouter {
    gate: Arc<dyn IdempotencyGate>,
    engine: Arc<OrderEngine>,
}

impl StripeRouter {
    pub fn new(gate: Arc<dyn IdempotencyGate>, engine: Arc<OrderEngine>) -> Self {
        Self { gate, engine }
    }

    /// Handle one verified Stripe event payload.
    pub async fn handle(&self, payload: &[u8]) -> ShopResult<()> {
        let event: Value = serde_json::from_slice(payload)
            .map_err(|e| ShopError::MalformedEvent(format!("stripe event: {e}")))?;

        let event_id = event
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ShopError::MalformedEvent("stripe event has no id".to_string()))?;
        let event_type = event
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ShopError::MalformedEvent("stripe event has no type".to_string()))?;

        if self.gate.seen(EventSource::Stripe, event_id).await? {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "Duplicate Stripe event, already processed"
            );
            return Ok(());
        }

        // `data.object` is only required for event types we dispatch on;
        // anything else is acknowledged whatever its shape.
        match event_type {
            EVENT_CHECKOUT_COMPLETED => {
                self.engine.checkout_completed(Self::object(&event)?).await?
            }
            EVENT_CHECKOUT_EXPIRED => self.engine.checkout_expired(Self::object(&event)?).await?,
            EVENT_PAYMENT_FAILED => self.engine.payment_failed(Self::object(&event)?).await?,
            other => {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %other,
                    "Received unhandled Stripe event type - no handler configured"
                );
            }
        }

        self.gate.mark_processed(EventSource::Stripe, event_id).await?;
        Ok(())
    }

    fn object(event: &Value) -> ShopResult<&Value> {
        event
            .pointer("/data/object")
            .ok_or_else(|| ShopError::MalformedEvent("stripe event has no data.object".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payment_intent_id_handles_both_shapes() {
        let bare: CheckoutSessionPayload = serde_json::from_value(json!({
            "id": "cs_1", "payment_intent": "pi_1"
        }))
        .unwrap();
        assert_eq!(bare.payment_intent_id().as_deref(), Some("pi_1"));

        let expanded: CheckoutSessionPayload = serde_json::from_value(json!({
            "id": "cs_1", "payment_intent": {"id": "pi_2", "status": "succeeded"}
        }))
        .unwrap();
        assert_eq!(expanded.payment_intent_id().as_deref(), Some("pi_2"));

        let absent: CheckoutSessionPayload =
            serde_json::from_value(json!({"id": "cs_1"})).unwrap();
        assert_eq!(absent.payment_intent_id(), None);
    }

    #[test]
    fn session_payload_tolerates_missing_optional_fields() {
        let payload: CheckoutSessionPayload = serde_json::from_value(json!({
            "id": "cs_1",
            "customer_details": {"email": "b@example.com"}
        }))
        .unwrap();
        let details = payload.customer_details.unwrap();
        assert_eq!(details.email.as_deref(), Some("b@example.com"));
        assert_eq!(details.name, None);
    }
}
