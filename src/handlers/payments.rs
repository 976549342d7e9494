use crate::handlers::common::{success_response, RequestClaimant};
use crate::{
    entities::order::{self, OrderStatus, PaymentStatus},
    errors::ServiceError,
    services::payment_reconciliation::ReconciledOrder,
    AppState,
};
use axum::{extract::State, response::IntoResponse, routing::post, Json, Router};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/payments/check-status", post(check_status))
        .route(
            "/payments/webhook",
            post(crate::handlers::payment_webhooks::payment_webhook),
        )
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CheckStatusRequest {
    #[validate(length(min = 1, max = 64))]
    pub gateway_order_id: String,
    pub session_id: Uuid,
}

/// Order as reported back to the shopper. Identity and address columns stay server-side.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSummary {
    pub order_number: String,
    pub session_id: Uuid,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub item_count: i32,
    pub subtotal: Decimal,
    pub discount_total: Decimal,
    pub shipping_discount: Decimal,
    pub total_amount: Decimal,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

impl From<order::Model> for OrderSummary {
    fn from(order: order::Model) -> Self {
        Self {
            item_count: order.items.0.iter().map(|item| item.qty).sum(),
            order_number: order.order_number,
            session_id: order.session_id,
            status: order.status,
            payment_status: order.payment_status,
            subtotal: order.subtotal,
            discount_total: order.discount_total,
            shipping_discount: order.shipping_discount,
            total_amount: order.total_amount,
            currency: order.currency,
            created_at: order.created_at,
        }
    }
}

/// Outcome of a recovery poll. Reconciliation failures are reported in `status`
/// rather than as an HTTP error so the client can branch on them.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckStatusResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderSummary>,
    pub message: String,
    pub retryable: bool,
}

impl CheckStatusResponse {
    fn completed(reconciled: ReconciledOrder) -> Self {
        Self {
            status: "completed",
            message: format!("Order {} confirmed", reconciled.order.order_number),
            order: Some(reconciled.order.into()),
            retryable: false,
        }
    }
}

/// Recovery poll: converts a confirmed payment into an order if nobody has yet
async fn check_status(
    State(state): State<AppState>,
    RequestClaimant(claimant): RequestClaimant,
    Json(payload): Json<CheckStatusRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    payload.validate()?;

    let result = state
        .services
        .reconciler
        .check_status(&payload.gateway_order_id, payload.session_id, &claimant)
        .await;

    let response = match result {
        Ok(reconciled) => CheckStatusResponse::completed(reconciled),
        Err(ServiceError::Reconciliation(err)) => CheckStatusResponse {
            status: err.status(),
            order: None,
            message: err.to_string(),
            retryable: err.is_retryable(),
        },
        Err(other) => return Err(other),
    };
    Ok(success_response(response))
}
