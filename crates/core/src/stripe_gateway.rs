//! Payment gateway client.
//!
//! The engine depends on the [`PaymentGateway`] trait; [`StripeGateway`] is
//! the concrete implementation over async-stripe. Checkout sessions are
//! created directly on the shop's connected account, and the correlation
//! metadata is attached to both the session and its payment intent so every
//! payment-platform event can be attributed back to an order.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ShopError, ShopResult};

const META_ORDER_ID: &str = "gitshop_order_id";
const META_SHOP_ID: &str = "gitshop_shop_id";
const META_ISSUE_NUMBER: &str = "gitshop_issue_number";
const META_REPO: &str = "gitshop_repo";

/// Correlation metadata attached to every checkout session. This is the
/// only mechanism joining a payment event back to an order; it must
/// round-trip exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutMetadata {
    pub order_id: Uuid,
    pub shop_id: Uuid,
    pub issue_number: i64,
    pub repo_full_name: String,
}

impl CheckoutMetadata {
    pub fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([
            (META_ORDER_ID.to_string(), self.order_id.to_string()),
            (META_SHOP_ID.to_string(), self.shop_id.to_string()),
            (META_ISSUE_NUMBER.to_string(), self.issue_number.to_string()),
            (META_REPO.to_string(), self.repo_full_name.clone()),
        ])
    }

    /// Parse metadata out of an event object. Missing or malformed metadata
    /// is a hard failure: the event cannot be attributed to an order.
    pub fn from_value(metadata: &Value) -> ShopResult<Self> {
        let field = |key: &str| -> ShopResult<&str> {
            metadata
                .get(key)
                .and_then(Value::as_str)
                .ok_or_else(|| ShopError::MissingMetadata(key.to_string()))
        };

        Ok(Self {
            order_id: field(META_ORDER_ID)?
                .parse()
                .map_err(|_| ShopError::MissingMetadata(META_ORDER_ID.to_string()))?,
            shop_id: field(META_SHOP_ID)?
                .parse()
                .map_err(|_| ShopError::MissingMetadata(META_SHOP_ID.to_string()))?,
            issue_number: field(META_ISSUE_NUMBER)?
                .parse()
                .map_err(|_| ShopError::MissingMetadata(META_ISSUE_NUMBER.to_string()))?,
            repo_full_name: field(META_REPO)?.to_string(),
        })
    }
}

/// Readiness snapshot of a connected account.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccountStatus {
    pub details_submitted: bool,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
}

impl AccountStatus {
    /// Charges are required to take orders; payouts are not.
    pub fn ready(&self) -> bool {
        self.details_submitted && self.charges_enabled
    }
}

/// Everything needed to create a hosted checkout session for one order.
#[derive(Debug, Clone)]
pub struct CheckoutParams {
    pub metadata: CheckoutMetadata,
    pub product_name: String,
    pub unit_amount_cents: i64,
    pub quantity: i64,
    pub shipping_cents: i64,
    pub currency: String,
    pub customer_email: Option<String>,
    pub connected_account: String,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone)]
pub struct CheckoutSessionRef {
    pub id: String,
    pub url: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout_session(&self, params: CheckoutParams)
        -> ShopResult<CheckoutSessionRef>;

    async fn get_account(&self, account_id: &str) -> ShopResult<AccountStatus>;
}

/// Stripe implementation of [`PaymentGateway`].
#[derive(Clone)]
pub struct StripeGateway {
    client: stripe::Client,
}

impl StripeGateway {
    pub fn new(secret_key: &str) -> Self {
        Self {
            client: stripe::Client::new(secret_key),
        }
    }

    /// A currency Stripe does not recognize must not silently become a
    /// different one; the catalog is wrong and the shop owner has to fix it.
    fn parse_currency(currency: &str) -> ShopResult<stripe::Currency> {
        serde_json::from_value(Value::String(currency.to_lowercase()))
            .map_err(|_| ShopError::Catalog(format!("unsupported currency: {currency}")))
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_checkout_session(
        &self,
        params: CheckoutParams,
    ) -> ShopResult<CheckoutSessionRef> {
        let account: stripe::AccountId = params
            .connected_account
            .parse()
            .map_err(|e| ShopError::Internal(format!("invalid connected account id: {e}")))?;
        let client = self.client.clone().with_stripe_account(account);

        let currency = Self::parse_currency(&params.currency)?;
        let metadata = params.metadata.to_map();

        let mut line_items = vec![stripe::CreateCheckoutSessionLineItems {
            quantity: Some(params.quantity.max(1) as u64),
            price_data: Some(stripe::CreateCheckoutSessionLineItemsPriceData {
                currency,
                unit_amount: Some(params.unit_amount_cents),
                product_data: Some(
                    stripe::CreateCheckoutSessionLineItemsPriceDataProductData {
                        name: params.product_name.clone(),
                        ..Default::default()
                    },
                ),
                ..Default::default()
            }),
            ..Default::default()
        }];
        if params.shipping_cents > 0 {
            line_items.push(stripe::CreateCheckoutSessionLineItems {
                quantity: Some(1),
                price_data: Some(stripe::CreateCheckoutSessionLineItemsPriceData {
                    currency,
                    unit_amount: Some(params.shipping_cents),
                    product_data: Some(
                        stripe::CreateCheckoutSessionLineItemsPriceDataProductData {
                            name: "Shipping".to_string(),
                            ..Default::default()
                        },
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        let mut create = stripe::CreateCheckoutSession::new();
        create.mode = Some(stripe::CheckoutSessionMode::Payment);
        create.success_url = Some(&params.success_url);
        create.cancel_url = Some(&params.cancel_url);
        create.customer_email = params.customer_email.as_deref();
        create.line_items = Some(line_items);
        create.metadata = Some(metadata.clone());
        // Mirror the metadata onto the payment intent so payment_intent.*
        // events can be attributed without a session lookup.
        create.payment_intent_data = Some(stripe::CreateCheckoutSessionPaymentIntentData {
            metadata: Some(metadata),
            ..Default::default()
        });

        let session = stripe::CheckoutSession::create(&client, create).await?;

        let url = session.url.ok_or_else(|| {
            ShopError::Internal("checkout session created without a hosted url".to_string())
        })?;

        tracing::info!(
            session_id = %session.id,
            order_id = %params.metadata.order_id,
            repo = %params.metadata.repo_full_name,
            "Checkout session created"
        );

        Ok(CheckoutSessionRef {
            id: session.id.to_string(),
            url,
        })
    }

    async fn get_account(&self, account_id: &str) -> ShopResult<AccountStatus> {
        let id: stripe::AccountId = account_id
            .parse()
            .map_err(|e| ShopError::Internal(format!("invalid account id: {e}")))?;
        let account = stripe::Account::retrieve(&self.client, &id, &[]).await?;
        Ok(AccountStatus {
            details_submitted: account.details_submitted.unwrap_or(false),
            charges_enabled: account.charges_enabled.unwrap_or(false),
            payouts_enabled: account.payouts_enabled.unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_round_trips_exactly() {
        let metadata = CheckoutMetadata {
            order_id: Uuid::new_v4(),
            shop_id: Uuid::new_v4(),
            issue_number: 7,
            repo_full_name: "octocat/shop".into(),
        };
        let map = metadata.to_map();
        let value = serde_json::to_value(&map).unwrap();
        let parsed = CheckoutMetadata::from_value(&value).unwrap();
        assert_eq!(parsed, metadata);
    }

    #[test]
    fn missing_metadata_field_is_hard_failure() {
        let value = json!({
            "gitshop_order_id": Uuid::new_v4().to_string(),
            "gitshop_shop_id": Uuid::new_v4().to_string(),
            // issue number and repo missing
        });
        let err = CheckoutMetadata::from_value(&value).unwrap_err();
        assert!(matches!(err, ShopError::MissingMetadata(_)));
    }

    #[test]
    fn malformed_uuid_is_hard_failure() {
        let value = json!({
            "gitshop_order_id": "not-a-uuid",
            "gitshop_shop_id": Uuid::new_v4().to_string(),
            "gitshop_issue_number": "7",
            "gitshop_repo": "octocat/shop",
        });
        let err = CheckoutMetadata::from_value(&value).unwrap_err();
        assert!(matches!(err, ShopError::MissingMetadata(field) if field == "gitshop_order_id"));
    }

    #[test]
    fn unknown_currency_is_rejected_not_defaulted() {
        assert!(StripeGateway::parse_currency("usd").is_ok());
        assert!(StripeGateway::parse_currency("EUR").is_ok());

        let err = StripeGateway::parse_currency("doubloons").unwrap_err();
        assert!(matches!(err, ShopError::Catalog(_)));
    }

    #[test]
    fn account_readiness_requires_charges_not_payouts() {
        let ready = AccountStatus {
            details_submitted: true,
            charges_enabled: true,
            payouts_enabled: false,
        };
        assert!(ready.ready());
        assert!(!AccountStatus::default().ready());
    }
}
