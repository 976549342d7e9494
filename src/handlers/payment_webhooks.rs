use crate::integrations::razorpay::{verify_webhook_signature, WebhookEvent, SIGNATURE_HEADER};
use crate::{errors::ServiceError, AppState};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use metrics::counter;
use serde_json::json;
use tracing::{error, info, warn};

// POST /api/v1/payments/webhook
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    if let Some(secret) = state.config.razorpay.webhook_secret.as_deref() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !verify_webhook_signature(secret, &body, signature) {
            counter!("checkout_webhooks.rejected", 1, "reason" => "signature");
            warn!("Payment webhook signature verification failed");
            return Err(ServiceError::Unauthorized(
                "invalid webhook signature".to_string(),
            ));
        }
    }

    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::InvalidInput(format!("invalid webhook payload: {}", e)))?;
    counter!("checkout_webhooks.received", 1);

    match state.services.reconciler.handle_webhook(&event).await {
        Ok(Some(reconciled)) => {
            info!(
                event = %event.event,
                order_number = %reconciled.order.order_number,
                created = reconciled.created,
                "Webhook reconciled"
            );
            Ok((StatusCode::OK, Json(json!({ "status": "completed" }))))
        }
        Ok(None) => Ok((StatusCode::OK, Json(json!({ "status": "ignored" })))),
        // Terminal outcomes are acknowledged so the gateway stops redelivering.
        Err(ServiceError::Reconciliation(err)) if !err.warrants_redelivery() => {
            error!(event = %event.event, status = err.status(), error = %err, "Webhook could not be reconciled");
            Ok((StatusCode::OK, Json(json!({ "status": err.status() }))))
        }
        Err(err) => Err(err),
    }
}
