//! Order and shop persistence.
//!
//! Every order mutation is a named guarded transition: an atomic
//! "update where current status matches" at the storage layer. Zero rows
//! affected is an [`ShopError::InvalidStatusTransition`], never a silent
//! success, which makes each transition naturally idempotent against
//! redelivery and concurrent handling. No in-process lock protects an
//! order; the conditional row update is the compare-and-swap primitive.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ShopError, ShopResult};
use crate::order::{NewOrder, Order, OrderStatus, PaymentDetails, Tracking};
use crate::shop::Shop;
use crate::stripe_gateway::AccountStatus;

/// Allowed source states per transition.
pub const PAID_FROM: &[OrderStatus] = &[
    OrderStatus::PendingPayment,
    OrderStatus::PaymentFailed,
    // Re-entering paid is allowed so a late duplicate "completed" event is
    // accepted rather than rejected.
    OrderStatus::Paid,
];
pub const FAILED_FROM: &[OrderStatus] = &[OrderStatus::PendingPayment, OrderStatus::PaymentFailed];
pub const EXPIRED_FROM: &[OrderStatus] = &[OrderStatus::PendingPayment];
pub const RETRY_FROM: &[OrderStatus] = &[OrderStatus::PaymentFailed];
/// `shipped -> shipped` lets an admin correct tracking details; it is the
/// one transition that is a no-op status update rather than a status change.
pub const SHIPPED_FROM: &[OrderStatus] = &[OrderStatus::Paid, OrderStatus::Shipped];
pub const DELIVERED_FROM: &[OrderStatus] = &[OrderStatus::Shipped];

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn create(&self, order: NewOrder) -> ShopResult<Order>;
    async fn find(&self, order_id: Uuid) -> ShopResult<Option<Order>>;
    async fn find_by_issue(&self, shop_id: Uuid, issue_number: i64) -> ShopResult<Option<Order>>;
    async fn find_by_checkout_session(&self, session_id: &str) -> ShopResult<Option<Order>>;

    /// Attach the current checkout session. Not status-guarded; used by
    /// intake right after session creation.
    async fn set_checkout_session(&self, order_id: Uuid, session_id: &str) -> ShopResult<()>;

    /// Retry path: `payment_failed -> pending_payment`, replacing the
    /// session id and clearing the failure reason.
    async fn mark_pending_payment(&self, order_id: Uuid, session_id: &str) -> ShopResult<Order>;

    /// `{pending_payment, payment_failed, paid} -> paid`. `paid_at` is set
    /// only on first entry.
    async fn mark_paid(&self, order_id: Uuid, details: PaymentDetails) -> ShopResult<Order>;

    /// `{pending_payment, payment_failed} -> payment_failed`.
    async fn mark_failed(&self, order_id: Uuid, reason: &str) -> ShopResult<Order>;

    /// `pending_payment -> expired`.
    async fn mark_expired(&self, order_id: Uuid) -> ShopResult<Order>;

    /// `{paid, shipped} -> shipped`. `shipped_at` is set only on first entry;
    /// tracking fields are replaced every time.
    async fn mark_shipped(&self, order_id: Uuid, tracking: Tracking) -> ShopResult<Order>;

    /// `shipped -> delivered`.
    async fn mark_delivered(&self, order_id: Uuid) -> ShopResult<Order>;
}

#[async_trait]
pub trait ShopStore: Send + Sync {
    async fn find(&self, shop_id: Uuid) -> ShopResult<Option<Shop>>;
    async fn find_by_repo(&self, repo_full_name: &str) -> ShopResult<Option<Shop>>;

    /// Create the shop on first contact, or reconnect it if it was
    /// previously disconnected.
    async fn connect_repo(
        &self,
        installation_id: i64,
        repo_full_name: &str,
        owner_login: &str,
    ) -> ShopResult<Shop>;

    async fn disconnect_repo(&self, installation_id: i64, repo_full_name: &str) -> ShopResult<()>;

    /// Disconnect every shop of an installation; returns how many.
    async fn disconnect_installation(&self, installation_id: i64) -> ShopResult<u64>;

    async fn set_stripe_account(&self, shop_id: Uuid, account_id: &str) -> ShopResult<()>;

    /// Cache the gateway's readiness snapshot on the shop row.
    async fn cache_account_status(&self, shop_id: Uuid, status: AccountStatus) -> ShopResult<()>;
}

fn guard_failed(order_id: Uuid, from: &[OrderStatus], to: OrderStatus) -> ShopError {
    ShopError::InvalidStatusTransition {
        order_id,
        from_any_of: from.to_vec(),
        to,
    }
}

fn status_strings(statuses: &[OrderStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

/// Raw row; `status` is decoded from TEXT after fetch.
#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    shop_id: Uuid,
    repo_full_name: String,
    issue_number: i64,
    order_number: i64,
    sku: String,
    quantity: i32,
    options: Value,
    subtotal_cents: i64,
    shipping_cents: i64,
    tax_cents: i64,
    total_cents: i64,
    currency: String,
    customer_email: Option<String>,
    customer_name: Option<String>,
    shipping_address: Option<Value>,
    checkout_session_id: Option<String>,
    payment_intent_id: Option<String>,
    tracking_number: Option<String>,
    tracking_url: Option<String>,
    carrier: Option<String>,
    status: String,
    failure_reason: Option<String>,
    created_at: OffsetDateTime,
    paid_at: Option<OffsetDateTime>,
    shipped_at: Option<OffsetDateTime>,
    delivered_at: Option<OffsetDateTime>,
}

impl TryFrom<OrderRow> for Order {
    type Error = ShopError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let status = OrderStatus::parse(&row.status)
            .ok_or_else(|| ShopError::Internal(format!("unknown order status {}", row.status)))?;
        Ok(Order {
            id: row.id,
            shop_id: row.shop_id,
            repo_full_name: row.repo_full_name,
            issue_number: row.issue_number,
            order_number: row.order_number,
            sku: row.sku,
            quantity: row.quantity,
            options: row.options,
            subtotal_cents: row.subtotal_cents,
            shipping_cents: row.shipping_cents,
            tax_cents: row.tax_cents,
            total_cents: row.total_cents,
            currency: row.currency,
            customer_email: row.customer_email,
            customer_name: row.customer_name,
            shipping_address: row.shipping_address,
            checkout_session_id: row.checkout_session_id,
            payment_intent_id: row.payment_intent_id,
            tracking_number: row.tracking_number,
            tracking_url: row.tracking_url,
            carrier: row.carrier,
            status,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            paid_at: row.paid_at,
            shipped_at: row.shipped_at,
            delivered_at: row.delivered_at,
        })
    }
}

pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn create(&self, order: NewOrder) -> ShopResult<Order> {
        let row: OrderRow = sqlx::query_as(
            r#"
            INSERT INTO orders (
                id, shop_id, repo_full_name, issue_number, order_number,
                sku, quantity, options,
                subtotal_cents, shipping_cents, tax_cents, total_cents, currency,
                customer_email, status, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $4,
                $5, $6, $7,
                $8, $9, $10, $11, $12,
                $13, 'pending_payment', NOW(), NOW()
            )
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(order.shop_id)
        .bind(&order.repo_full_name)
        .bind(order.issue_number)
        .bind(&order.sku)
        .bind(order.quantity)
        .bind(&order.options)
        .bind(order.subtotal_cents)
        .bind(order.shipping_cents)
        .bind(order.tax_cents)
        .bind(order.total_cents)
        .bind(&order.currency)
        .bind(&order.customer_email)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if e.as_database_error()
                .is_some_and(|db| db.is_unique_violation())
            {
                ShopError::OrderAlreadyExists {
                    shop_id: order.shop_id,
                    issue_number: order.issue_number,
                }
            } else {
                ShopError::Database(e)
            }
        })?;
        row.try_into()
    }

    async fn find(&self, order_id: Uuid) -> ShopResult<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as("SELECT * FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Order::try_from).transpose()
    }

    async fn find_by_issue(&self, shop_id: Uuid, issue_number: i64) -> ShopResult<Option<Order>> {
        let row: Option<OrderRow> =
            sqlx::query_as("SELECT * FROM orders WHERE shop_id = $1 AND issue_number = $2")
                .bind(shop_id)
                .bind(issue_number)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Order::try_from).transpose()
    }

    async fn find_by_checkout_session(&self, session_id: &str) -> ShopResult<Option<Order>> {
        let row: Option<OrderRow> =
            sqlx::query_as("SELECT * FROM orders WHERE checkout_session_id = $1")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Order::try_from).transpose()
    }

    async fn set_checkout_session(&self, order_id: Uuid, session_id: &str) -> ShopResult<()> {
        let result = sqlx::query(
            "UPDATE orders SET checkout_session_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(order_id)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ShopError::OrderNotFound(order_id.to_string()));
        }
        Ok(())
    }

    async fn mark_pending_payment(&self, order_id: Uuid, session_id: &str) -> ShopResult<Order> {
        let row: Option<OrderRow> = sqlx::query_as(
            r#"
            UPDATE orders
            SET status = 'pending_payment',
                checkout_session_id = $2,
                failure_reason = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($3)
            RETURNING *
            "#,
        )
        .bind(order_id)
        .bind(session_id)
        .bind(status_strings(RETRY_FROM))
        .fetch_optional(&self.pool)
        .await?;
        row.map(Order::try_from)
            .transpose()?
            .ok_or_else(|| guard_failed(order_id, RETRY_FROM, OrderStatus::PendingPayment))
    }

    async fn mark_paid(&self, order_id: Uuid, details: PaymentDetails) -> ShopResult<Order> {
        let row: Option<OrderRow> = sqlx::query_as(
            r#"
            UPDATE orders
            SET status = 'paid',
                customer_email = COALESCE($2, customer_email),
                customer_name = COALESCE($3, customer_name),
                shipping_address = COALESCE($4, shipping_address),
                payment_intent_id = COALESCE($5, payment_intent_id),
                paid_at = COALESCE(paid_at, NOW()),
                failure_reason = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($6)
            RETURNING *
            "#,
        )
        .bind(order_id)
        .bind(&details.customer_email)
        .bind(&details.customer_name)
        .bind(&details.shipping_address)
        .bind(&details.payment_intent_id)
        .bind(status_strings(PAID_FROM))
        .fetch_optional(&self.pool)
        .await?;
        row.map(Order::try_from)
            .transpose()?
            .ok_or_else(|| guard_failed(order_id, PAID_FROM, OrderStatus::Paid))
    }

    async fn mark_failed(&self, order_id: Uuid, reason: &str) -> ShopResult<Order> {
        let row: Option<OrderRow> = sqlx::query_as(
            r#"
            UPDATE orders
            SET status = 'payment_failed', failure_reason = $2, updated_at = NOW()
            WHERE id = $1 AND status = ANY($3)
            RETURNING *
            "#,
        )
        .bind(order_id)
        .bind(reason)
        .bind(status_strings(FAILED_FROM))
        .fetch_optional(&self.pool)
        .await?;
        row.map(Order::try_from)
            .transpose()?
            .ok_or_else(|| guard_failed(order_id, FAILED_FROM, OrderStatus::PaymentFailed))
    }

    async fn mark_expired(&self, order_id: Uuid) -> ShopResult<Order> {
        let row: Option<OrderRow> = sqlx::query_as(
            r#"
            UPDATE orders
            SET status = 'expired', updated_at = NOW()
            WHERE id = $1 AND status = ANY($2)
            RETURNING *
            "#,
        )
        .bind(order_id)
        .bind(status_strings(EXPIRED_FROM))
        .fetch_optional(&self.pool)
        .await?;
        row.map(Order::try_from)
            .transpose()?
            .ok_or_else(|| guard_failed(order_id, EXPIRED_FROM, OrderStatus::Expired))
    }

    async fn mark_shipped(&self, order_id: Uuid, tracking: Tracking) -> ShopResult<Order> {
        let row: Option<OrderRow> = sqlx::query_as(
            r#"
            UPDATE orders
            SET status = 'shipped',
                tracking_number = $2,
                tracking_url = $3,
                carrier = $4,
                shipped_at = COALESCE(shipped_at, NOW()),
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($5)
            RETURNING *
            "#,
        )
        .bind(order_id)
        .bind(&tracking.tracking_number)
        .bind(&tracking.tracking_url)
        .bind(&tracking.carrier)
        .bind(status_strings(SHIPPED_FROM))
        .fetch_optional(&self.pool)
        .await?;
        row.map(Order::try_from)
            .transpose()?
            .ok_or_else(|| guard_failed(order_id, SHIPPED_FROM, OrderStatus::Shipped))
    }

    async fn mark_delivered(&self, order_id: Uuid) -> ShopResult<Order> {
        let row: Option<OrderRow> = sqlx::query_as(
            r#"
            UPDATE orders
            SET status = 'delivered', delivered_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = ANY($2)
            RETURNING *
            "#,
        )
        .bind(order_id)
        .bind(status_strings(DELIVERED_FROM))
        .fetch_optional(&self.pool)
        .await?;
        row.map(Order::try_from)
            .transpose()?
            .ok_or_else(|| guard_failed(order_id, DELIVERED_FROM, OrderStatus::Delivered))
    }
}

pub struct PgShopStore {
    pool: PgPool,
}

impl PgShopStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ShopStore for PgShopStore {
    async fn find(&self, shop_id: Uuid) -> ShopResult<Option<Shop>> {
        Ok(sqlx::query_as("SELECT * FROM shops WHERE id = $1")
            .bind(shop_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_by_repo(&self, repo_full_name: &str) -> ShopResult<Option<Shop>> {
        Ok(sqlx::query_as("SELECT * FROM shops WHERE repo_full_name = $1")
            .bind(repo_full_name)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn connect_repo(
        &self,
        installation_id: i64,
        repo_full_name: &str,
        owner_login: &str,
    ) -> ShopResult<Shop> {
        let shop: Shop = sqlx::query_as(
            r#"
            INSERT INTO shops (id, installation_id, repo_full_name, owner_login, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            ON CONFLICT (repo_full_name) DO UPDATE SET
                installation_id = EXCLUDED.installation_id,
                disconnected_at = NULL,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(installation_id)
        .bind(repo_full_name)
        .bind(owner_login)
        .fetch_one(&self.pool)
        .await?;
        Ok(shop)
    }

    async fn disconnect_repo(&self, installation_id: i64, repo_full_name: &str) -> ShopResult<()> {
        sqlx::query(
            r#"
            UPDATE shops SET disconnected_at = NOW(), updated_at = NOW()
            WHERE installation_id = $1 AND repo_full_name = $2 AND disconnected_at IS NULL
            "#,
        )
        .bind(installation_id)
        .bind(repo_full_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn disconnect_installation(&self, installation_id: i64) -> ShopResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE shops SET disconnected_at = NOW(), updated_at = NOW()
            WHERE installation_id = $1 AND disconnected_at IS NULL
            "#,
        )
        .bind(installation_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn set_stripe_account(&self, shop_id: Uuid, account_id: &str) -> ShopResult<()> {
        sqlx::query("UPDATE shops SET stripe_account_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(shop_id)
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cache_account_status(&self, shop_id: Uuid, status: AccountStatus) -> ShopResult<()> {
        sqlx::query(
            r#"
            UPDATE shops
            SET details_submitted = $2, charges_enabled = $3, payouts_enabled = $4,
                account_checked_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(shop_id)
        .bind(status.details_submitted)
        .bind(status.charges_enabled)
        .bind(status.payouts_enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory (single-instance dev and tests)
// ---------------------------------------------------------------------------

/// In-memory [`OrderStore`] with the same guarded-transition semantics as
/// the Postgres store.
#[derive(Default)]
pub struct MemoryOrderStore {
    orders: Mutex<HashMap<Uuid, Order>>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn transition<F>(
        &self,
        order_id: Uuid,
        from: &[OrderStatus],
        to: OrderStatus,
        mutate: F,
    ) -> ShopResult<Order>
    where
        F: FnOnce(&mut Order),
    {
        let mut orders = self
            .orders
            .lock()
            .map_err(|_| ShopError::Internal("order store lock poisoned".to_string()))?;
        let order = orders
            .get_mut(&order_id)
            .filter(|o| from.contains(&o.status))
            .ok_or_else(|| guard_failed(order_id, from, to))?;
        order.status = to;
        mutate(order);
        Ok(order.clone())
    }

    fn lock(&self) -> ShopResult<std::sync::MutexGuard<'_, HashMap<Uuid, Order>>> {
        self.orders
            .lock()
            .map_err(|_| ShopError::Internal("order store lock poisoned".to_string()))
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn create(&self, order: NewOrder) -> ShopResult<Order> {
        let mut orders = self.lock()?;
        if orders
            .values()
            .any(|o| o.shop_id == order.shop_id && o.issue_number == order.issue_number)
        {
            return Err(ShopError::OrderAlreadyExists {
                shop_id: order.shop_id,
                issue_number: order.issue_number,
            });
        }
        let created = Order {
            id: Uuid::new_v4(),
            shop_id: order.shop_id,
            repo_full_name: order.repo_full_name,
            issue_number: order.issue_number,
            order_number: order.issue_number,
            sku: order.sku,
            quantity: order.quantity,
            options: order.options,
            subtotal_cents: order.subtotal_cents,
            shipping_cents: order.shipping_cents,
            tax_cents: order.tax_cents,
            total_cents: order.total_cents,
            currency: order.currency,
            customer_email: order.customer_email,
            customer_name: None,
            shipping_address: None,
            checkout_session_id: None,
            payment_intent_id: None,
            tracking_number: None,
            tracking_url: None,
            carrier: None,
            status: OrderStatus::PendingPayment,
            failure_reason: None,
            created_at: OffsetDateTime::now_utc(),
            paid_at: None,
            shipped_at: None,
            delivered_at: None,
        };
        orders.insert(created.id, created.clone());
        Ok(created)
    }

    async fn find(&self, order_id: Uuid) -> ShopResult<Option<Order>> {
        Ok(self.lock()?.get(&order_id).cloned())
    }

    async fn find_by_issue(&self, shop_id: Uuid, issue_number: i64) -> ShopResult<Option<Order>> {
        Ok(self
            .lock()?
            .values()
            .find(|o| o.shop_id == shop_id && o.issue_number == issue_number)
            .cloned())
    }

    async fn find_by_checkout_session(&self, session_id: &str) -> ShopResult<Option<Order>> {
        Ok(self
            .lock()?
            .values()
            .find(|o| o.checkout_session_id.as_deref() == Some(session_id))
            .cloned())
    }

    async fn set_checkout_session(&self, order_id: Uuid, session_id: &str) -> ShopResult<()> {
        let mut orders = self.lock()?;
        let order = orders
            .get_mut(&order_id)
            .ok_or_else(|| ShopError::OrderNotFound(order_id.to_string()))?;
        order.checkout_session_id = Some(session_id.to_string());
        Ok(())
    }

    async fn mark_pending_payment(&self, order_id: Uuid, session_id: &str) -> ShopResult<Order> {
        self.transition(order_id, RETRY_FROM, OrderStatus::PendingPayment, |order| {
            order.checkout_session_id = Some(session_id.to_string());
            order.failure_reason = None;
        })
    }

    async fn mark_paid(&self, order_id: Uuid, details: PaymentDetails) -> ShopResult<Order> {
        self.transition(order_id, PAID_FROM, OrderStatus::Paid, |order| {
            if details.customer_email.is_some() {
                order.customer_email = details.customer_email;
            }
            if details.customer_name.is_some() {
                order.customer_name = details.customer_name;
            }
            if details.shipping_address.is_some() {
                order.shipping_address = details.shipping_address;
            }
            if details.payment_intent_id.is_some() {
                order.payment_intent_id = details.payment_intent_id;
            }
            if order.paid_at.is_none() {
                order.paid_at = Some(OffsetDateTime::now_utc());
            }
            order.failure_reason = None;
        })
    }

    async fn mark_failed(&self, order_id: Uuid, reason: &str) -> ShopResult<Order> {
        self.transition(order_id, FAILED_FROM, OrderStatus::PaymentFailed, |order| {
            order.failure_reason = Some(reason.to_string());
        })
    }

    async fn mark_expired(&self, order_id: Uuid) -> ShopResult<Order> {
        self.transition(order_id, EXPIRED_FROM, OrderStatus::Expired, |_| {})
    }

    async fn mark_shipped(&self, order_id: Uuid, tracking: Tracking) -> ShopResult<Order> {
        self.transition(order_id, SHIPPED_FROM, OrderStatus::Shipped, |order| {
            order.tracking_number = Some(tracking.tracking_number);
            order.tracking_url = tracking.tracking_url;
            order.carrier = tracking.carrier;
            if order.shipped_at.is_none() {
                order.shipped_at = Some(OffsetDateTime::now_utc());
            }
        })
    }

    async fn mark_delivered(&self, order_id: Uuid) -> ShopResult<Order> {
        self.transition(order_id, DELIVERED_FROM, OrderStatus::Delivered, |order| {
            order.delivered_at = Some(OffsetDateTime::now_utc());
        })
    }
}

/// In-memory [`ShopStore`].
#[derive(Default)]
pub struct MemoryShopStore {
    shops: Mutex<HashMap<Uuid, Shop>>,
}

impl MemoryShopStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> ShopResult<std::sync::MutexGuard<'_, HashMap<Uuid, Shop>>> {
        self.shops
            .lock()
            .map_err(|_| ShopError::Internal("shop store lock poisoned".to_string()))
    }

    /// Test helper: set the designated manager.
    pub fn set_manager_login(&self, shop_id: Uuid, login: Option<&str>) -> ShopResult<()> {
        let mut shops = self.lock()?;
        if let Some(shop) = shops.get_mut(&shop_id) {
            shop.manager_login = login.map(str::to_string);
        }
        Ok(())
    }
}

#[async_trait]
impl ShopStore for MemoryShopStore {
    async fn find(&self, shop_id: Uuid) -> ShopResult<Option<Shop>> {
        Ok(self.lock()?.get(&shop_id).cloned())
    }

    async fn find_by_repo(&self, repo_full_name: &str) -> ShopResult<Option<Shop>> {
        Ok(self
            .lock()?
            .values()
            .find(|s| s.repo_full_name == repo_full_name)
            .cloned())
    }

    async fn connect_repo(
        &self,
        installation_id: i64,
        repo_full_name: &str,
        owner_login: &str,
    ) -> ShopResult<Shop> {
        let mut shops = self.lock()?;
        if let Some(shop) = shops
            .values_mut()
            .find(|s| s.repo_full_name == repo_full_name)
        {
            shop.installation_id = installation_id;
            shop.disconnected_at = None;
            return Ok(shop.clone());
        }
        let shop = Shop {
            id: Uuid::new_v4(),
            installation_id,
            repo_full_name: repo_full_name.to_string(),
            owner_login: owner_login.to_string(),
            manager_login: None,
            stripe_account_id: None,
            details_submitted: false,
            charges_enabled: false,
            payouts_enabled: false,
            account_checked_at: None,
            disconnected_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        shops.insert(shop.id, shop.clone());
        Ok(shop)
    }

    async fn disconnect_repo(&self, installation_id: i64, repo_full_name: &str) -> ShopResult<()> {
        let mut shops = self.lock()?;
        if let Some(shop) = shops.values_mut().find(|s| {
            s.installation_id == installation_id && s.repo_full_name == repo_full_name
        }) {
            shop.disconnected_at.get_or_insert(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn disconnect_installation(&self, installation_id: i64) -> ShopResult<u64> {
        let mut shops = self.lock()?;
        let mut count = 0;
        for shop in shops
            .values_mut()
            .filter(|s| s.installation_id == installation_id && s.disconnected_at.is_none())
        {
            shop.disconnected_at = Some(OffsetDateTime::now_utc());
            count += 1;
        }
        Ok(count)
    }

    async fn set_stripe_account(&self, shop_id: Uuid, account_id: &str) -> ShopResult<()> {
        let mut shops = self.lock()?;
        if let Some(shop) = shops.get_mut(&shop_id) {
            shop.stripe_account_id = Some(account_id.to_string());
        }
        Ok(())
    }

    async fn cache_account_status(&self, shop_id: Uuid, status: AccountStatus) -> ShopResult<()> {
        let mut shops = self.lock()?;
        if let Some(shop) = shops.get_mut(&shop_id) {
            shop.details_submitted = status.details_submitted;
            shop.charges_enabled = status.charges_enabled;
            shop.payouts_enabled = status.payouts_enabled;
            shop.account_checked_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_order(shop_id: Uuid, issue: i64) -> NewOrder {
        NewOrder {
            shop_id,
            repo_full_name: "octocat/shop".into(),
            issue_number: issue,
            sku: "COFFEE_V1".into(),
            quantity: 3,
            options: json!({}),
            subtotal_cents: 5400,
            shipping_cents: 500,
            tax_cents: 0,
            total_cents: 5900,
            currency: "usd".into(),
            customer_email: None,
        }
    }

    #[tokio::test]
    async fn create_sets_order_number_to_issue_number() {
        let store = MemoryOrderStore::new();
        let order = store.create(new_order(Uuid::new_v4(), 7)).await.unwrap();
        assert_eq!(order.order_number, 7);
        assert_eq!(order.status, OrderStatus::PendingPayment);
        assert!(order.paid_at.is_none());
    }

    #[tokio::test]
    async fn duplicate_issue_order_is_rejected() {
        let store = MemoryOrderStore::new();
        let shop_id = Uuid::new_v4();
        store.create(new_order(shop_id, 7)).await.unwrap();
        let err = store.create(new_order(shop_id, 7)).await.unwrap_err();
        assert!(matches!(err, ShopError::OrderAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn find_by_checkout_session_after_attach() {
        let store = MemoryOrderStore::new();
        let order = store.create(new_order(Uuid::new_v4(), 1)).await.unwrap();
        assert!(store
            .find_by_checkout_session("cs_1")
            .await
            .unwrap()
            .is_none());

        store.set_checkout_session(order.id, "cs_1").await.unwrap();
        let found = store.find_by_checkout_session("cs_1").await.unwrap().unwrap();
        assert_eq!(found.id, order.id);

        let missing = Uuid::new_v4();
        let err = store.set_checkout_session(missing, "cs_2").await.unwrap_err();
        assert!(matches!(err, ShopError::OrderNotFound(_)));
    }

    #[tokio::test]
    async fn mark_paid_is_guarded_and_idempotent() {
        let store = MemoryOrderStore::new();
        let order = store.create(new_order(Uuid::new_v4(), 1)).await.unwrap();

        let paid = store
            .mark_paid(
                order.id,
                PaymentDetails {
                    customer_email: Some("b@example.com".into()),
                    ..PaymentDetails::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(paid.status, OrderStatus::Paid);
        let first_paid_at = paid.paid_at.unwrap();

        // Redelivery: paid -> paid is allowed, paid_at untouched.
        let again = store
            .mark_paid(order.id, PaymentDetails::default())
            .await
            .unwrap();
        assert_eq!(again.paid_at.unwrap(), first_paid_at);
        assert_eq!(again.customer_email.as_deref(), Some("b@example.com"));
    }

    #[tokio::test]
    async fn mark_paid_rejected_from_shipped() {
        let store = MemoryOrderStore::new();
        let order = store.create(new_order(Uuid::new_v4(), 1)).await.unwrap();
        store.mark_paid(order.id, PaymentDetails::default()).await.unwrap();
        store
            .mark_shipped(
                order.id,
                Tracking {
                    tracking_number: "TN1".into(),
                    tracking_url: None,
                    carrier: None,
                },
            )
            .await
            .unwrap();

        let err = store
            .mark_paid(order.id, PaymentDetails::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ShopError::InvalidStatusTransition { .. }));
        // Row unchanged.
        let current = store.find(order.id).await.unwrap().unwrap();
        assert_eq!(current.status, OrderStatus::Shipped);
    }

    #[tokio::test]
    async fn mark_failed_rejected_once_paid() {
        let store = MemoryOrderStore::new();
        let order = store.create(new_order(Uuid::new_v4(), 1)).await.unwrap();
        store.mark_paid(order.id, PaymentDetails::default()).await.unwrap();
        let err = store.mark_failed(order.id, "payment_intent_failed").await.unwrap_err();
        assert!(matches!(err, ShopError::InvalidStatusTransition { .. }));
    }

    #[tokio::test]
    async fn expired_only_from_pending() {
        let store = MemoryOrderStore::new();
        let order = store.create(new_order(Uuid::new_v4(), 1)).await.unwrap();
        store.mark_failed(order.id, "x").await.unwrap();
        let err = store.mark_expired(order.id).await.unwrap_err();
        assert!(matches!(err, ShopError::InvalidStatusTransition { .. }));
    }

    #[tokio::test]
    async fn retry_replaces_session_and_clears_reason() {
        let store = MemoryOrderStore::new();
        let order = store.create(new_order(Uuid::new_v4(), 1)).await.unwrap();
        store.set_checkout_session(order.id, "cs_old").await.unwrap();
        store.mark_failed(order.id, "stripe_checkout_failed").await.unwrap();

        let retried = store.mark_pending_payment(order.id, "cs_new").await.unwrap();
        assert_eq!(retried.status, OrderStatus::PendingPayment);
        assert_eq!(retried.checkout_session_id.as_deref(), Some("cs_new"));
        assert!(retried.failure_reason.is_none());
    }

    #[tokio::test]
    async fn reship_updates_tracking_without_new_timestamp() {
        let store = MemoryOrderStore::new();
        let order = store.create(new_order(Uuid::new_v4(), 1)).await.unwrap();
        store.mark_paid(order.id, PaymentDetails::default()).await.unwrap();

        let shipped = store
            .mark_shipped(
                order.id,
                Tracking {
                    tracking_number: "TN1".into(),
                    tracking_url: None,
                    carrier: Some("usps".into()),
                },
            )
            .await
            .unwrap();
        let first_shipped_at = shipped.shipped_at.unwrap();

        // Admin corrects the tracking number; status stays shipped.
        let reshipped = store
            .mark_shipped(
                order.id,
                Tracking {
                    tracking_number: "TN2".into(),
                    tracking_url: Some("https://t.example/TN2".into()),
                    carrier: Some("usps".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(reshipped.status, OrderStatus::Shipped);
        assert_eq!(reshipped.tracking_number.as_deref(), Some("TN2"));
        assert_eq!(reshipped.shipped_at.unwrap(), first_shipped_at);

        // But shipping an unpaid order is rejected.
        let other = store.create(new_order(Uuid::new_v4(), 2)).await.unwrap();
        let err = store
            .mark_shipped(
                other.id,
                Tracking {
                    tracking_number: "TN3".into(),
                    tracking_url: None,
                    carrier: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ShopError::InvalidStatusTransition { .. }));
    }

    #[tokio::test]
    async fn delivered_only_from_shipped() {
        let store = MemoryOrderStore::new();
        let order = store.create(new_order(Uuid::new_v4(), 1)).await.unwrap();
        store.mark_paid(order.id, PaymentDetails::default()).await.unwrap();
        assert!(store.mark_delivered(order.id).await.is_err());
        store
            .mark_shipped(
                order.id,
                Tracking {
                    tracking_number: "TN1".into(),
                    tracking_url: None,
                    carrier: None,
                },
            )
            .await
            .unwrap();
        let delivered = store.mark_delivered(order.id).await.unwrap();
        assert_eq!(delivered.status, OrderStatus::Delivered);
        assert!(delivered.delivered_at.is_some());
    }

    #[tokio::test]
    async fn shop_connect_disconnect_reconnect() {
        let store = MemoryShopStore::new();
        let shop = store.connect_repo(42, "octocat/shop", "octocat").await.unwrap();
        assert!(shop.is_connected());

        store.disconnect_repo(42, "octocat/shop").await.unwrap();
        let disconnected = store.find_by_repo("octocat/shop").await.unwrap().unwrap();
        assert!(!disconnected.is_connected());

        // Re-adding the repo reconnects the same shop row.
        let reconnected = store.connect_repo(42, "octocat/shop", "octocat").await.unwrap();
        assert_eq!(reconnected.id, shop.id);
        assert!(reconnected.is_connected());
    }

    #[tokio::test]
    async fn uninstall_disconnects_all_shops() {
        let store = MemoryShopStore::new();
        store.connect_repo(42, "octocat/shop", "octocat").await.unwrap();
        store.connect_repo(42, "octocat/other", "octocat").await.unwrap();
        store.connect_repo(99, "someone/else", "someone").await.unwrap();

        let count = store.disconnect_installation(42).await.unwrap();
        assert_eq!(count, 2);
        assert!(store
            .find_by_repo("someone/else")
            .await
            .unwrap()
            .unwrap()
            .is_connected());
    }
}
