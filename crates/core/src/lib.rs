// Core crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Order construction carries many commercial fields
#![allow(clippy::result_large_err)] // ShopError carries transition context for diagnostics
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! GitShop Core
//!
//! Turns inbound GitHub and Stripe webhook events into exactly-once-effect
//! transitions of persisted order records, and drives the Stripe Checkout
//! flow in response.
//!
//! ## Components
//!
//! - **Idempotency gate**: TTL dedupe cache consulted before routing any event
//! - **Order / shop stores**: status-guarded conditional updates as the
//!   per-order compare-and-swap primitive
//! - **Event routers**: GitHub event router (issues, comments, push,
//!   installation lifecycle) and Stripe event router (checkout completed /
//!   expired, payment failed)
//! - **Order lifecycle engine**: intake, checkout-session creation,
//!   retry-on-comment, payment completion, expiry, failure handling, shipment

pub mod catalog;
pub mod db;
pub mod email;
pub mod engine;
pub mod error;
pub mod github;
pub mod github_events;
pub mod github_webhooks;
pub mod idempotency;
pub mod issue_form;
pub mod order;
pub mod shop;
pub mod store;
pub mod stripe_gateway;
pub mod stripe_webhooks;


// Catalog
pub use catalog::{Catalog, CatalogService, GithubCatalogLoader, OrderPricing, Product};

// Email
pub use email::{EmailSender, LogEmailSender};

// Engine
pub use engine::OrderEngine;

// Error
pub use error::{ShopError, ShopResult};

// GitHub
pub use github::{CodeHostClient, GithubClient, IssueCommentRecord, Permission};
pub use github_events::{
    GithubEvent, InstallationEvent, InstallationRepositoriesEvent, IssueComment, IssueOpened,
    PushEvent, ORDER_ISSUE_LABEL, ORDER_ISSUE_MARKER,
};
pub use github_webhooks::GithubRouter;

// Idempotency
pub use idempotency::{EventSource, IdempotencyGate, MemoryGate, RedisGate, DEDUPE_TTL};

// Model
pub use order::{
    NewOrder, Order, OrderStatus, PaymentDetails, Tracking, REASON_CHECKOUT_FAILED,
    REASON_PAYMENT_INTENT_FAILED,
};
pub use shop::Shop;

// Stores
pub use store::{
    MemoryOrderStore, MemoryShopStore, OrderStore, PgOrderStore, PgShopStore, ShopStore,
};

// Stripe
pub use stripe_gateway::{
    AccountStatus, CheckoutMetadata, CheckoutParams, CheckoutSessionRef, PaymentGateway,
    StripeGateway,
};
pub use stripe_webhooks::{
    StripeRouter, EVENT_CHECKOUT_COMPLETED, EVENT_CHECKOUT_EXPIRED, EVENT_PAYMENT_FAILED,
};
