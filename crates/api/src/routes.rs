//! HTTP routes.
//!
//! Webhook receivers verify the raw-body signature before anything is
//! parsed, then hand the bytes to the matching router. Response codes follow
//! the redelivery contract: 2xx acknowledges (including handled business
//! failures), 4xx tells the source the delivery itself is bad, 5xx asks for
//! redelivery.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use gitshop_core::{Order, ShopError, Tracking};

use crate::signature::{token_matches, verify_github_signature, verify_stripe_signature};
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/github", post(github_webhook))
        .route("/webhooks/stripe", post(stripe_webhook))
        .route("/admin/orders/{order_id}/ship", post(ship_order))
        .route("/admin/orders/{order_id}/deliver", post(deliver_order))
        .with_state(state)
}

struct ApiError(ShopError);

impl From<ShopError> for ApiError {
    fn from(err: ShopError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ShopError::WebhookSignatureInvalid => StatusCode::UNAUTHORIZED,
            ShopError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ShopError::MalformedEvent(_) | ShopError::MissingMetadata(_) => {
                StatusCode::BAD_REQUEST
            }
            ShopError::OrderNotFound(_) | ShopError::ShopNotFound(_) => StatusCode::NOT_FOUND,
            ShopError::InvalidStatusTransition { .. } | ShopError::OrderAlreadyExists { .. } => {
                StatusCode::CONFLICT
            }
            err if err.is_retryable() => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed, source should redeliver");
        } else {
            tracing::warn!(error = %self.0, status = %status, "Request rejected");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let signature =
        header(&headers, "x-hub-signature-256").ok_or(ShopError::WebhookSignatureInvalid)?;
    verify_github_signature(&state.config.github_webhook_secret, &body, signature)?;

    let event_name = header(&headers, "x-github-event")
        .ok_or_else(|| ShopError::MalformedEvent("missing X-GitHub-Event header".to_string()))?;
    let delivery_id = header(&headers, "x-github-delivery")
        .ok_or_else(|| ShopError::MalformedEvent("missing X-GitHub-Delivery header".to_string()))?;

    state
        .github_router
        .handle(event_name, delivery_id, &body)
        .await?;
    Ok(StatusCode::OK)
}

async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let signature =
        header(&headers, "stripe-signature").ok_or(ShopError::WebhookSignatureInvalid)?;
    verify_stripe_signature(&state.config.stripe_webhook_secret, &body, signature)?;

    state.stripe_router.handle(&body).await?;
    Ok(StatusCode::OK)
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let token = header(headers, "x-admin-token").unwrap_or_default();
    if token_matches(token, &state.config.admin_token) {
        Ok(())
    } else {
        Err(ApiError(ShopError::PermissionDenied("admin".to_string())))
    }
}

#[derive(Debug, Deserialize)]
struct ShipRequest {
    tracking_number: String,
    #[serde(default)]
    tracking_url: Option<String>,
    #[serde(default)]
    carrier: Option<String>,
}

async fn ship_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<ShipRequest>,
) -> Result<Json<Order>, ApiError> {
    require_admin(&state, &headers)?;
    let order = state
        .engine
        .ship(
            order_id,
            Tracking {
                tracking_number: request.tracking_number,
                tracking_url: request.tracking_url,
                carrier: request.carrier,
            },
        )
        .await?;
    Ok(Json(order))
}

async fn deliver_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Order>, ApiError> {
    require_admin(&state, &headers)?;
    let order = state.engine.deliver(order_id).await?;
    Ok(Json(order))
}
