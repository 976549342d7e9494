use crate::handlers::common::{created_response, success_response, RequestClaimant};
use crate::{
    entities::commerce::checkout_session::ShippingAddress,
    errors::ServiceError,
    services::commerce::checkout_service::{CreateSessionInput, SessionView},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Creates the router for checkout session endpoints
pub fn checkout_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_session))
        .route("/:session_id", get(get_session))
        .route(
            "/:session_id/coupon",
            post(apply_coupon).delete(remove_coupon),
        )
        .route("/:session_id/validate", post(validate_for_payment))
        .route("/:session_id/payment", post(open_payment_window))
        .route("/:session_id/cancel", post(cancel_session))
}

/// Start a buy-now or cart checkout
async fn create_session(
    State(state): State<AppState>,
    RequestClaimant(claimant): RequestClaimant,
    Json(payload): Json<CreateSessionInput>,
) -> Result<impl IntoResponse, ServiceError> {
    let checkout = &state.services.checkout;
    let session = checkout.create_session(&claimant, payload).await?;

    Ok(created_response(CreateSessionResponse {
        session_id: session.id,
        session: SessionView::new(&session, &checkout.config().currency),
    }))
}

async fn get_session(
    State(state): State<AppState>,
    RequestClaimant(claimant): RequestClaimant,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let checkout = &state.services.checkout;
    let session = checkout.get_session(&claimant, session_id).await?;
    Ok(success_response(SessionView::new(
        &session,
        &checkout.config().currency,
    )))
}

async fn apply_coupon(
    State(state): State<AppState>,
    RequestClaimant(claimant): RequestClaimant,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<ApplyCouponRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let outcome = state
        .services
        .checkout
        .apply_coupon(&claimant, session_id, &payload.coupon_code)
        .await?;
    Ok(success_response(outcome))
}

async fn remove_coupon(
    State(state): State<AppState>,
    RequestClaimant(claimant): RequestClaimant,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let outcome = state
        .services
        .checkout
        .remove_coupon(&claimant, session_id)
        .await?;
    Ok(success_response(outcome))
}

/// Re-prices the session and checks the address before payment
async fn validate_for_payment(
    State(state): State<AppState>,
    RequestClaimant(claimant): RequestClaimant,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<ValidateForPaymentRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let validation = state
        .services
        .checkout
        .validate_for_payment(&claimant, session_id, payload.shipping_address)
        .await?;
    Ok(success_response(validation))
}

/// Locks totals and returns the gateway order to pay against
async fn open_payment_window(
    State(state): State<AppState>,
    RequestClaimant(claimant): RequestClaimant,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let window = state
        .services
        .checkout
        .open_payment_window(&claimant, session_id)
        .await?;
    Ok(success_response(window))
}

async fn cancel_session(
    State(state): State<AppState>,
    RequestClaimant(claimant): RequestClaimant,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let checkout = &state.services.checkout;
    let session = checkout.cancel_session(&claimant, session_id).await?;
    Ok(success_response(SessionView::new(
        &session,
        &checkout.config().currency,
    )))
}

// Request/Response DTOs

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
    pub session: SessionView,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyCouponRequest {
    pub coupon_code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateForPaymentRequest {
    pub shipping_address: ShippingAddress,
}
