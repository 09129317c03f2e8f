//! Order lifecycle engine.
//!
//! All state changes funnel through the guarded store transitions; the
//! engine sequences them and performs the surrounding side effects (issue
//! comments, labels, emails, checkout sessions). Side effects run after the
//! transition commits, so a crash between the two is repaired by source
//! redelivery: the transition re-runs as an accepted no-op and the side
//! effects are retried.
//!
//! Business precondition failures (disconnected shop, unknown SKU, account
//! not ready, ...) are not errors to the webhook source: the buyer gets an
//! explanatory issue comment and the event is acknowledged.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::catalog::{CatalogService, Product};
use crate::email::EmailSender;
use crate::error::{ShopError, ShopResult};
use crate::github::CodeHostClient;
use crate::github_events::{IssueComment, IssueOpened, ORDER_ISSUE_LABEL};
use crate::issue_form::parse_issue_body;
use crate::order::{
    NewOrder, Order, OrderStatus, PaymentDetails, Tracking, REASON_CHECKOUT_FAILED,
    REASON_PAYMENT_INTENT_FAILED,
};
use crate::shop::Shop;
use crate::store::{OrderStore, ShopStore};
use crate::stripe_gateway::{CheckoutMetadata, CheckoutParams, PaymentGateway};
use crate::stripe_webhooks::{CheckoutSessionPayload, PaymentIntentPayload};

pub const LABEL_PENDING_PAYMENT: &str = "pending-payment";
pub const LABEL_PAID: &str = "paid";
pub const LABEL_PAYMENT_FAILED: &str = "payment-failed";
pub const LABEL_EXPIRED: &str = "expired";
pub const LABEL_SHIPPED: &str = "shipped";
pub const LABEL_DELIVERED: &str = "delivered";

/// Marker embedded in every checkout comment so stale payment links can be
/// found and removed on retry.
pub const CHECKOUT_COMMENT_MARKER: &str = "<!-- gitshop:checkout -->";

pub struct OrderEngine {
    orders: Arc<dyn OrderStore>,
    shops: Arc<dyn ShopStore>,
    catalog: Arc<dyn CatalogService>,
    gateway: Arc<dyn PaymentGateway>,
    code_host: Arc<dyn CodeHostClient>,
    email: Arc<dyn EmailSender>,
}

impl OrderEngine {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        shops: Arc<dyn ShopStore>,
        catalog: Arc<dyn CatalogService>,
        gateway: Arc<dyn PaymentGateway>,
        code_host: Arc<dyn CodeHostClient>,
        email: Arc<dyn EmailSender>,
    ) -> Self {
        Self {
            orders,
            shops,
            catalog,
            gateway,
            code_host,
            email,
        }
    }

    // -----------------------------------------------------------------
    // Intake
    // -----------------------------------------------------------------

    /// Handle a newly opened order issue.
    pub async fn intake(&self, event: &IssueOpened) -> ShopResult<()> {
        match self.intake_inner(event).await {
            Ok(()) => Ok(()),
            Err(ShopError::OrderAlreadyExists { issue_number, .. }) => {
                // Redelivered issue event; the order is already on file.
                tracing::info!(
                    repo = %event.repo_full_name,
                    issue = issue_number,
                    "Order already exists for issue, skipping intake"
                );
                Ok(())
            }
            Err(err) => {
                self.reply_or_propagate(&event.repo_full_name, event.issue_number, err)
                    .await
            }
        }
    }

    async fn intake_inner(&self, event: &IssueOpened) -> ShopResult<()> {
        let shop = match self.shops.find_by_repo(&event.repo_full_name).await? {
            Some(shop) if !shop.is_connected() => {
                return Err(ShopError::ShopDisconnected(shop.repo_full_name));
            }
            Some(shop) => shop,
            // No row yet: heals a missed installation event.
            None => {
                self.shops
                    .connect_repo(
                        event.installation_id,
                        &event.repo_full_name,
                        &event.owner_login,
                    )
                    .await?
            }
        };
        let account = self.ensure_account_ready(&shop).await?;

        let request = parse_issue_body(&event.issue_body);
        let sku = request.sku.ok_or(ShopError::MissingSku)?;

        let catalog = self.catalog.load(&shop.repo_full_name).await?;
        let product = catalog
            .product(&sku)
            .ok_or_else(|| ShopError::UnknownSku(sku.clone()))?
            .clone();
        let pricing = catalog.price(&sku, request.quantity)?;

        let order = self
            .orders
            .create(NewOrder {
                shop_id: shop.id,
                repo_full_name: shop.repo_full_name.clone(),
                issue_number: event.issue_number,
                sku: sku.clone(),
                quantity: request.quantity as i32,
                options: serde_json::to_value(&request.options)
                    .unwrap_or(Value::Object(Default::default())),
                subtotal_cents: pricing.subtotal_cents,
                shipping_cents: pricing.shipping_cents,
                tax_cents: pricing.tax_cents,
                total_cents: pricing.total_cents,
                currency: catalog.currency.clone(),
                customer_email: request.email.clone(),
            })
            .await?;

        tracing::info!(
            order_id = %order.id,
            repo = %shop.repo_full_name,
            issue = order.issue_number,
            sku = %order.sku,
            total_cents = order.total_cents,
            "Order created"
        );

        // The order row exists now; any failure between here and a posted
        // payment link is recorded as payment_failed so the buyer can
        // retry, rather than asking the source to redeliver an event that
        // would only hit the duplicate-order guard.
        if let Err(err) = self.publish_checkout(&order, &product, &account).await {
            tracing::warn!(
                order_id = %order.id,
                error = %err,
                "Checkout setup failed after order creation"
            );
            let order = self
                .orders
                .mark_failed(order.id, REASON_CHECKOUT_FAILED)
                .await?;
            self.finish_transition(&order, LABEL_PAYMENT_FAILED, &checkout_failed_comment(&order))
                .await;
        }
        Ok(())
    }

    /// Everything between the order row and a live payment link: session
    /// creation, session attachment, labels, checkout comment.
    async fn publish_checkout(
        &self,
        order: &Order,
        product: &Product,
        account: &str,
    ) -> ShopResult<()> {
        let session = self
            .gateway
            .create_checkout_session(CheckoutParams {
                metadata: self.metadata_for(order),
                product_name: product.name.clone(),
                unit_amount_cents: product.price_cents,
                quantity: i64::from(order.quantity),
                shipping_cents: order.shipping_cents,
                currency: order.currency.clone(),
                customer_email: order.customer_email.clone(),
                connected_account: account.to_string(),
                success_url: issue_url(&order.repo_full_name, order.issue_number),
                cancel_url: issue_url(&order.repo_full_name, order.issue_number),
            })
            .await?;

        self.orders.set_checkout_session(order.id, &session.id).await?;
        self.set_status_labels(order, LABEL_PENDING_PAYMENT).await?;
        self.code_host
            .create_comment(
                &order.repo_full_name,
                order.issue_number,
                &checkout_comment(order, &product.name, &session.url),
            )
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Payment retry
    // -----------------------------------------------------------------

    /// Handle a `.gitshop retry` command comment.
    pub async fn retry_payment(&self, event: &IssueComment) -> ShopResult<()> {
        match self.retry_inner(event).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.reply_or_propagate(&event.repo_full_name, event.issue_number, err)
                    .await
            }
        }
    }

    async fn retry_inner(&self, event: &IssueComment) -> ShopResult<()> {
        let shop = self
            .shops
            .find_by_repo(&event.repo_full_name)
            .await?
            .ok_or_else(|| ShopError::ShopNotFound(event.repo_full_name.clone()))?;
        if !shop.is_connected() {
            return Err(ShopError::ShopDisconnected(shop.repo_full_name.clone()));
        }

        let order = self
            .orders
            .find_by_issue(shop.id, event.issue_number)
            .await?
            .ok_or_else(|| ShopError::OrderNotFound(format!("issue #{}", event.issue_number)))?;

        // Only the orderer or a collaborator with push access may retry.
        if event.commenter_login != event.issue_author_login {
            let permission = self
                .code_host
                .check_permission(&event.repo_full_name, &event.commenter_login)
                .await?;
            if !permission.can_push() {
                return Err(ShopError::PermissionDenied(event.commenter_login.clone()));
            }
        }

        if order.status != OrderStatus::PaymentFailed {
            return Err(ShopError::RetryNotAvailable(order.status));
        }

        let account = self.ensure_account_ready(&shop).await?;

        // Reprice from the stored order, not the catalog: the price the
        // buyer saw at intake is the price they pay. The catalog is only
        // consulted for the display name.
        let product_name = match self.catalog.load(&shop.repo_full_name).await {
            Ok(catalog) => catalog
                .product(&order.sku)
                .map(|p| p.name.clone())
                .unwrap_or_else(|| order.sku.clone()),
            Err(_) => order.sku.clone(),
        };
        let unit_amount = if order.quantity > 0 {
            order.subtotal_cents / i64::from(order.quantity)
        } else {
            order.subtotal_cents
        };

        let session = self
            .gateway
            .create_checkout_session(CheckoutParams {
                metadata: self.metadata_for(&order),
                product_name,
                unit_amount_cents: unit_amount,
                quantity: i64::from(order.quantity),
                shipping_cents: order.shipping_cents,
                currency: order.currency.clone(),
                customer_email: order.customer_email.clone(),
                connected_account: account,
                success_url: issue_url(&order.repo_full_name, order.issue_number),
                cancel_url: issue_url(&order.repo_full_name, order.issue_number),
            })
            .await?;

        let order = self
            .orders
            .mark_pending_payment(order.id, &session.id)
            .await?;

        tracing::info!(
            order_id = %order.id,
            session_id = %session.id,
            "Payment retry: new checkout session issued"
        );

        self.remove_stale_checkout_comments(&order).await;
        self.set_status_labels(&order, LABEL_PENDING_PAYMENT).await?;
        self.code_host
            .create_comment(
                &order.repo_full_name,
                order.issue_number,
                &retry_comment(&order, &session.url),
            )
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Stripe events
    // -----------------------------------------------------------------

    /// `checkout.session.completed`: the buyer paid.
    pub async fn checkout_completed(&self, object: &Value) -> ShopResult<()> {
        let payload: CheckoutSessionPayload = serde_json::from_value(object.clone())
            .map_err(|e| ShopError::MalformedEvent(format!("checkout session: {e}")))?;
        let metadata = CheckoutMetadata::from_value(&payload.metadata)?;

        let details = PaymentDetails {
            payment_intent_id: payload.payment_intent_id(),
            customer_email: payload
                .customer_details
                .as_ref()
                .and_then(|d| d.email.clone()),
            customer_name: payload
                .customer_details
                .as_ref()
                .and_then(|d| d.name.clone()),
            shipping_address: payload
                .customer_details
                .as_ref()
                .and_then(|d| d.address.clone()),
        };

        // Metadata is the attribution check; the session id is the join key.
        // A session that was replaced by a retry resolves to no order.
        let order = match self.orders.find_by_checkout_session(&payload.id).await? {
            Some(order) => order,
            None => {
                tracing::warn!(
                    session_id = %payload.id,
                    order_id = %metadata.order_id,
                    "Completed checkout session is not the current session of any order"
                );
                return Ok(());
            }
        };

        let order = match self.orders.mark_paid(order.id, details).await {
            Ok(order) => order,
            Err(err @ ShopError::InvalidStatusTransition { .. }) => {
                // Late completion after expiry or fulfilment; already handled.
                tracing::info!(
                    order_id = %metadata.order_id,
                    session_id = %payload.id,
                    outcome = %err,
                    "Checkout completion ignored, order already past payment"
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        tracing::info!(
            order_id = %order.id,
            repo = %order.repo_full_name,
            issue = order.issue_number,
            total_cents = order.total_cents,
            "Order paid"
        );

        self.remove_stale_checkout_comments(&order).await;
        self.finish_transition(&order, LABEL_PAID, &paid_comment(&order))
            .await;

        if let Some(shop) = self.shops.find(order.shop_id).await? {
            if let Err(err) = self
                .email
                .send_order_confirmation(&shop, &order, None)
                .await
            {
                self.escalate_email_failure(&shop, &order, &err).await;
            }
        }
        Ok(())
    }

    /// `checkout.session.expired`: the payment window lapsed unpaid.
    pub async fn checkout_expired(&self, object: &Value) -> ShopResult<()> {
        let payload: CheckoutSessionPayload = serde_json::from_value(object.clone())
            .map_err(|e| ShopError::MalformedEvent(format!("checkout session: {e}")))?;
        let metadata = CheckoutMetadata::from_value(&payload.metadata)?;

        // Only the order's current session may expire it; a session replaced
        // by a retry expires without touching the order.
        let order = match self.orders.find_by_checkout_session(&payload.id).await? {
            Some(order) => order,
            None => {
                tracing::info!(
                    session_id = %payload.id,
                    order_id = %metadata.order_id,
                    "Expired checkout session is not the current session of any order"
                );
                return Ok(());
            }
        };

        let order = match self.orders.mark_expired(order.id).await {
            Ok(order) => order,
            Err(err @ ShopError::InvalidStatusTransition { .. }) => {
                // The session expired but the order moved on (paid, or a
                // retry already replaced the session).
                tracing::info!(
                    order_id = %metadata.order_id,
                    session_id = %payload.id,
                    outcome = %err,
                    "Checkout expiry ignored, order no longer pending"
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        tracing::info!(order_id = %order.id, "Order expired unpaid");

        self.remove_stale_checkout_comments(&order).await;
        self.finish_transition(&order, LABEL_EXPIRED, &expired_comment(&order))
            .await;
        Ok(())
    }

    /// `payment_intent.payment_failed`: a payment attempt was declined.
    pub async fn payment_failed(&self, object: &Value) -> ShopResult<()> {
        let payload: PaymentIntentPayload = serde_json::from_value(object.clone())
            .map_err(|e| ShopError::MalformedEvent(format!("payment intent: {e}")))?;
        // Attribution via the metadata mirrored onto the intent; payment
        // intent events carry no session id.
        let metadata = CheckoutMetadata::from_value(&payload.metadata)?;

        let order = match self
            .orders
            .mark_failed(metadata.order_id, REASON_PAYMENT_INTENT_FAILED)
            .await
        {
            Ok(order) => order,
            Err(err @ ShopError::InvalidStatusTransition { .. }) => {
                // A later attempt on the same session already succeeded.
                tracing::info!(
                    order_id = %metadata.order_id,
                    payment_intent = %payload.id,
                    outcome = %err,
                    "Payment failure ignored, order not awaiting payment"
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        tracing::info!(
            order_id = %order.id,
            payment_intent = %payload.id,
            "Payment attempt failed"
        );

        self.finish_transition(&order, LABEL_PAYMENT_FAILED, &payment_failed_comment(&order))
            .await;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Fulfilment (admin-triggered)
    // -----------------------------------------------------------------

    pub async fn ship(&self, order_id: Uuid, tracking: Tracking) -> ShopResult<Order> {
        let order = self.orders.mark_shipped(order_id, tracking).await?;
        tracing::info!(
            order_id = %order.id,
            tracking = ?order.tracking_number,
            "Order shipped"
        );

        self.finish_transition(&order, LABEL_SHIPPED, &shipped_comment(&order))
            .await;

        if let Some(shop) = self.shops.find(order.shop_id).await? {
            if let Err(err) = self.email.send_order_shipped(&shop, &order, None).await {
                tracing::warn!(order_id = %order.id, error = %err, "Shipped email failed");
            }
        }
        Ok(order)
    }

    pub async fn deliver(&self, order_id: Uuid) -> ShopResult<Order> {
        let order = self.orders.mark_delivered(order_id).await?;
        tracing::info!(order_id = %order.id, "Order delivered");

        self.finish_transition(&order, LABEL_DELIVERED, &delivered_comment(&order))
            .await;

        if let Some(shop) = self.shops.find(order.shop_id).await? {
            if let Err(err) = self.email.send_order_delivered(&shop, &order, None).await {
                tracing::warn!(order_id = %order.id, error = %err, "Delivered email failed");
            }
        }
        Ok(order)
    }

    // -----------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------

    /// Business errors become a buyer-facing comment and an acknowledged
    /// event; everything else propagates to the webhook response.
    async fn reply_or_propagate(
        &self,
        repo: &str,
        issue: i64,
        err: ShopError,
    ) -> ShopResult<()> {
        match err.user_message() {
            Some(message) => {
                tracing::info!(
                    repo = repo,
                    issue = issue,
                    reason = %err,
                    "Order rejected, replying on issue"
                );
                self.code_host.create_comment(repo, issue, &message).await?;
                Ok(())
            }
            None => Err(err),
        }
    }

    /// Refresh and cache the connected account's readiness; returns the
    /// account id once it can take charges.
    async fn ensure_account_ready(&self, shop: &Shop) -> ShopResult<String> {
        if !shop.is_connected() {
            return Err(ShopError::ShopDisconnected(shop.repo_full_name.clone()));
        }
        let account_id = shop
            .stripe_account_id
            .clone()
            .ok_or(ShopError::PaymentAccountMissing)?;
        let status = self.gateway.get_account(&account_id).await?;
        self.shops.cache_account_status(shop.id, status).await?;
        if !status.ready() {
            return Err(ShopError::PaymentAccountNotReady);
        }
        Ok(account_id)
    }

    fn metadata_for(&self, order: &Order) -> CheckoutMetadata {
        CheckoutMetadata {
            order_id: order.id,
            shop_id: order.shop_id,
            issue_number: order.issue_number,
            repo_full_name: order.repo_full_name.clone(),
        }
    }

    /// Post-transition issue updates. The state change is already durable,
    /// so a code-host failure here is logged and the event stays
    /// acknowledged; failing the webhook would only redeliver a handled
    /// event.
    async fn finish_transition(&self, order: &Order, label: &str, comment: &str) {
        if let Err(err) = self.set_status_labels(order, label).await {
            tracing::warn!(
                order_id = %order.id,
                label = label,
                error = %err,
                "Status labels not updated"
            );
        }
        if let Err(err) = self
            .code_host
            .create_comment(&order.repo_full_name, order.issue_number, comment)
            .await
        {
            tracing::warn!(order_id = %order.id, error = %err, "Status comment not posted");
        }
    }

    /// Replace every status label with the current one, keeping `order`.
    async fn set_status_labels(&self, order: &Order, current: &str) -> ShopResult<()> {
        for label in [
            LABEL_PENDING_PAYMENT,
            LABEL_PAID,
            LABEL_PAYMENT_FAILED,
            LABEL_EXPIRED,
            LABEL_SHIPPED,
            LABEL_DELIVERED,
        ] {
            if label != current {
                self.code_host
                    .remove_label(&order.repo_full_name, order.issue_number, label)
                    .await?;
            }
        }
        self.code_host
            .add_labels(
                &order.repo_full_name,
                order.issue_number,
                &[ORDER_ISSUE_LABEL, current],
            )
            .await?;
        Ok(())
    }

    /// Delete earlier checkout comments so only the live payment link shows.
    /// Best-effort; a leftover stale link is harmless because the session
    /// behind it is dead.
    async fn remove_stale_checkout_comments(&self, order: &Order) {
        let comments = match self
            .code_host
            .list_comments(&order.repo_full_name, order.issue_number)
            .await
        {
            Ok(comments) => comments,
            Err(err) => {
                tracing::warn!(order_id = %order.id, error = %err, "Could not list comments");
                return;
            }
        };
        for comment in comments
            .iter()
            .filter(|c| c.body.contains(CHECKOUT_COMMENT_MARKER))
        {
            if let Err(err) = self
                .code_host
                .delete_comment(&order.repo_full_name, comment.id)
                .await
            {
                tracing::warn!(
                    order_id = %order.id,
                    comment_id = comment.id,
                    error = %err,
                    "Could not delete stale checkout comment"
                );
            }
        }
    }

    async fn escalate_email_failure(&self, shop: &Shop, order: &Order, err: &ShopError) {
        tracing::error!(
            order_id = %order.id,
            error = %err,
            "Confirmation email failed, opening escalation issue"
        );
        let assignee = shop
            .manager_login
            .as_deref()
            .unwrap_or(shop.owner_login.as_str());
        let title = format!(
            "Order #{}: confirmation email could not be sent",
            order.order_number
        );
        let body = format!(
            "The confirmation email for order #{} (issue #{}) failed to send:\n\n```\n{}\n```\n\n\
             The order itself is paid and unaffected. Please contact the buyer directly.",
            order.order_number, order.issue_number, err
        );
        if let Err(err) = self
            .code_host
            .create_issue(&order.repo_full_name, &title, &body, &[assignee])
            .await
        {
            tracing::error!(order_id = %order.id, error = %err, "Escalation issue failed too");
        }
    }
}

fn issue_url(repo: &str, issue: i64) -> String {
    format!("https://github.com/{repo}/issues/{issue}")
}

fn format_amount(cents: i64, currency: &str) -> String {
    format!("{}.{:02} {}", cents / 100, cents % 100, currency.to_uppercase())
}

fn checkout_comment(order: &Order, product_name: &str, checkout_url: &str) -> String {
    format!(
        "{marker}\n\
         ## Order #{number}\n\n\
         | Item | Qty | Amount |\n\
         |------|-----|--------|\n\
         | {product} | {qty} | {subtotal} |\n\
         | Shipping | | {shipping} |\n\
         | **Total** | | **{total}** |\n\n\
         **[Complete your payment here]({url})**\n\n\
         The payment link expires after 24 hours. If it does, comment \
         `.gitshop retry` to get a fresh one.",
        marker = CHECKOUT_COMMENT_MARKER,
        number = order.order_number,
        product = product_name,
        qty = order.quantity,
        subtotal = format_amount(order.subtotal_cents, &order.currency),
        shipping = format_amount(order.shipping_cents, &order.currency),
        total = format_amount(order.total_cents, &order.currency),
        url = checkout_url,
    )
}

fn retry_comment(order: &Order, checkout_url: &str) -> String {
    format!(
        "{marker}\n\
         Here is a fresh payment link for order #{number} \
         ({total} total):\n\n\
         **[Complete your payment here]({url})**",
        marker = CHECKOUT_COMMENT_MARKER,
        number = order.order_number,
        total = format_amount(order.total_cents, &order.currency),
        url = checkout_url,
    )
}

fn checkout_failed_comment(order: &Order) -> String {
    format!(
        "Your order #{} was recorded, but a payment link could not be created \
         right now. Comment `.gitshop retry` to try again.",
        order.order_number
    )
}

fn paid_comment(order: &Order) -> String {
    format!(
        ":tada: Payment received for order #{} ({}). The shop will ship your \
         order and post tracking details here.",
        order.order_number,
        format_amount(order.total_cents, &order.currency)
    )
}

fn expired_comment(order: &Order) -> String {
    format!(
        "The payment link for order #{} expired before payment was completed, \
         so the order has been closed. Open a new order issue if you still \
         want it.",
        order.order_number
    )
}

fn payment_failed_comment(order: &Order) -> String {
    format!(
        "The payment attempt for order #{} did not go through. Comment \
         `.gitshop retry` to get a new payment link.",
        order.order_number
    )
}

fn shipped_comment(order: &Order) -> String {
    let mut comment = format!(":package: Order #{} has shipped!", order.order_number);
    if let Some(tracking) = &order.tracking_number {
        match (&order.tracking_url, &order.carrier) {
            (Some(url), Some(carrier)) => {
                comment.push_str(&format!("\n\nTracking ({carrier}): [{tracking}]({url})"));
            }
            (Some(url), None) => {
                comment.push_str(&format!("\n\nTracking: [{tracking}]({url})"));
            }
            (None, Some(carrier)) => {
                comment.push_str(&format!("\n\nTracking ({carrier}): {tracking}"));
            }
            (None, None) => {
                comment.push_str(&format!("\n\nTracking: {tracking}"));
            }
        }
    }
    comment
}

fn delivered_comment(order: &Order) -> String {
    format!(
        ":white_check_mark: Order #{} was delivered. Thanks for shopping!",
        order.order_number
    )
}
