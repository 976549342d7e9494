use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

fn current_request_id() -> Option<String> {
    crate::middleware_helpers::request_id::current_request_id().map(|rid| rid.0)
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// HTTP status category (e.g. "Not Found", "Conflict")
    pub error: String,
    /// Machine-readable code for client branching (e.g. `OUT_OF_STOCK`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human-readable error description
    pub message: String,
    /// Structured payload (insufficient lines, coupon thresholds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Unique request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// RFC 3339 timestamp when the error occurred
    pub timestamp: String,
}

/// One cart line that could not be reserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsufficientStockLine {
    pub product_id: Uuid,
    pub size: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub requested: i32,
    pub available: i32,
}

impl InsufficientStockLine {
    pub fn message(&self) -> String {
        let label = self.name.as_deref().unwrap_or("item");
        if self.available <= 0 {
            format!("{} (size {}) is out of stock", label, self.size)
        } else {
            format!(
                "Only {} of {} (size {}) available",
                self.available, label, self.size
            )
        }
    }
}

/// Reasons a coupon cannot be applied to a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CouponRejection {
    #[error("Coupon code is not valid")]
    InvalidCoupon,
    #[error("Coupon is no longer active")]
    CouponInactive,
    #[error("Coupon is not valid yet")]
    CouponNotStarted,
    #[error("Coupon has expired")]
    CouponExpired,
    #[error("Minimum order value of {min_order_value} not met")]
    MinOrderNotMet {
        min_order_value: Decimal,
        cart_subtotal: Decimal,
    },
    #[error("No items in the cart are eligible for this coupon")]
    NoEligibleItems,
    #[error("Coupon usage limit has been reached")]
    UsageLimitExceeded,
    #[error("You have already used this coupon the maximum number of times")]
    UserUsageLimitExceeded,
}

impl CouponRejection {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCoupon => "INVALID_COUPON",
            Self::CouponInactive => "COUPON_INACTIVE",
            Self::CouponNotStarted => "COUPON_NOT_STARTED",
            Self::CouponExpired => "COUPON_EXPIRED",
            Self::MinOrderNotMet { .. } => "MIN_ORDER_NOT_MET",
            Self::NoEligibleItems => "NO_ELIGIBLE_ITEMS",
            Self::UsageLimitExceeded => "USAGE_LIMIT_EXCEEDED",
            Self::UserUsageLimitExceeded => "USER_USAGE_LIMIT_EXCEEDED",
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::MinOrderNotMet {
                min_order_value,
                cart_subtotal,
            } => Some(json!({
                "minOrderValue": min_order_value,
                "cartSubtotal": cart_subtotal,
            })),
            _ => None,
        }
    }
}

/// Session lookups and transitions that the current session state forbids.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionStateError {
    #[error("Checkout session not found")]
    NotFound(Uuid),
    #[error("Checkout session has expired")]
    Expired(Uuid),
    #[error("Checkout session is {status}; cannot {action}")]
    InvalidState {
        session_id: Uuid,
        status: String,
        action: &'static str,
    },
}

impl SessionStateError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "SESSION_NOT_FOUND",
            Self::Expired(_) => "SESSION_EXPIRED",
            Self::InvalidState { .. } => "INVALID_SESSION_STATE",
        }
    }

    pub fn session_id(&self) -> Uuid {
        match self {
            Self::NotFound(id) | Self::Expired(id) => *id,
            Self::InvalidState { session_id, .. } => *session_id,
        }
    }
}

/// Failures of the payment-to-order conversion. These are reported through the
/// check-status contract rather than as HTTP errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconciliationError {
    #[error("Payment has not been completed yet")]
    PaymentNotCompleted,
    #[error("No checkout session matches this payment")]
    SessionNotFound,
    #[error("Captured amount {captured_minor} does not match expected amount {expected_minor}")]
    AmountMismatch {
        expected_minor: i64,
        captured_minor: i64,
    },
    #[error("Payment is being processed elsewhere and no order was found")]
    RecoveryFailed,
    #[error("Payment gateway error: {0}")]
    Gateway(String),
    #[error("Payment succeeded but the order could not be created; support will resolve it")]
    OrderCreationFailed,
}

impl ReconciliationError {
    /// Status string exposed by the check-status endpoint.
    pub fn status(&self) -> &'static str {
        match self {
            Self::PaymentNotCompleted => "payment_not_completed",
            Self::SessionNotFound => "session_not_found",
            Self::AmountMismatch { .. } => "amount_mismatch",
            Self::RecoveryFailed => "recovery_failed",
            Self::Gateway(_) => "razorpay_error",
            Self::OrderCreationFailed => "order_creation_failed",
        }
    }

    /// Whether the shopper may usefully try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PaymentNotCompleted | Self::Gateway(_))
    }

    /// Whether a gateway webhook should be answered with an error so it is delivered
    /// again. A failed order insert leaves the session claimable, so it qualifies.
    pub fn warrants_redelivery(&self) -> bool {
        self.is_retryable() || matches!(self, Self::OrderCreationFailed)
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::PaymentNotCompleted => "PAYMENT_NOT_COMPLETED",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::AmountMismatch { .. } => "AMOUNT_MISMATCH",
            Self::RecoveryFailed => "RECOVERY_FAILED",
            Self::Gateway(_) => "RAZORPAY_ERROR",
            Self::OrderCreationFailed => "ORDER_CREATION_FAILED",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::SessionNotFound => StatusCode::NOT_FOUND,
            Self::PaymentNotCompleted | Self::RecoveryFailed => StatusCode::CONFLICT,
            Self::AmountMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Gateway(_) => StatusCode::BAD_GATEWAY,
            Self::OrderCreationFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::AmountMismatch {
                expected_minor,
                captured_minor,
            } => Some(json!({
                "expectedAmount": expected_minor,
                "capturedAmount": captured_minor,
            })),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient stock for {} item(s)", .0.len())]
    StockValidation(Vec<InsufficientStockLine>),

    #[error("{0}")]
    CouponRejected(CouponRejection),

    #[error("{0}")]
    SessionState(SessionStateError),

    #[error("{0}")]
    Reconciliation(ReconciliationError),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<CouponRejection> for ServiceError {
    fn from(err: CouponRejection) -> Self {
        ServiceError::CouponRejected(err)
    }
}

impl From<SessionStateError> for ServiceError {
    fn from(err: SessionStateError) -> Self {
        ServiceError::SessionState(err)
    }
}

impl From<ReconciliationError> for ServiceError {
    fn from(err: ReconciliationError) -> Self {
        ServiceError::Reconciliation(err)
    }
}

impl ServiceError {
    /// Wraps string-based database errors.
    pub fn db_error(message: impl Into<String>) -> Self {
        ServiceError::DatabaseError(DbErr::Custom(message.into()))
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ValidationError(_) | Self::InvalidInput(_) | Self::InvalidOperation(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) | Self::ConcurrentModification(_) => StatusCode::CONFLICT,
            Self::StockValidation(_) | Self::CouponRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::SessionState(err) => match err {
                SessionStateError::NotFound(_) => StatusCode::NOT_FOUND,
                SessionStateError::Expired(_) => StatusCode::GONE,
                SessionStateError::InvalidState { .. } => StatusCode::CONFLICT,
            },
            Self::Reconciliation(err) => err.status_code(),
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code, when the error has one.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::StockValidation(_) => Some("OUT_OF_STOCK"),
            Self::CouponRejected(r) => Some(r.code()),
            Self::SessionState(s) => Some(s.code()),
            Self::Reconciliation(r) => Some(r.code()),
            Self::ConcurrentModification(_) => Some("CONCURRENT_MODIFICATION"),
            Self::Unauthorized(_) => Some("UNAUTHORIZED"),
            Self::ValidationError(_) | Self::InvalidInput(_) => Some("VALIDATION_ERROR"),
            _ => None,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) => "Internal server error".to_string(),
            Self::ExternalServiceError(_) => "Upstream service error".to_string(),
            Self::ConcurrentModification(_) => {
                "The checkout session was modified concurrently; please retry".to_string()
            }
            Self::StockValidation(lines) => lines
                .iter()
                .map(InsufficientStockLine::message)
                .collect::<Vec<_>>()
                .join("; "),
            Self::CouponRejected(r) => r.to_string(),
            Self::SessionState(s) => s.to_string(),
            Self::Reconciliation(r) => r.to_string(),
            _ => self.to_string(),
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::StockValidation(lines) => serde_json::to_value(lines).ok(),
            Self::CouponRejected(r) => r.details(),
            Self::Reconciliation(r) => r.details(),
            _ => None,
        }
    }

    pub fn is_concurrent_modification(&self) -> bool {
        matches!(self, Self::ConcurrentModification(_))
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: self.code().map(str::to_string),
            message: self.response_message(),
            details: self.details(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware_helpers::request_id::{scope_request_id, RequestId};
    use axum::body::to_bytes;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn error_response_includes_request_id_and_code() {
        let response = scope_request_id(RequestId::new("req-123"), async {
            ServiceError::SessionState(SessionStateError::NotFound(Uuid::new_v4()))
                .into_response()
        })
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.request_id.as_deref(), Some("req-123"));
        assert_eq!(payload.code.as_deref(), Some("SESSION_NOT_FOUND"));
    }

    #[tokio::test]
    async fn stock_error_lists_every_line() {
        let lines = vec![
            InsufficientStockLine {
                product_id: Uuid::nil(),
                size: "M".into(),
                name: Some("Tee".into()),
                requested: 3,
                available: 1,
            },
            InsufficientStockLine {
                product_id: Uuid::nil(),
                size: "L".into(),
                name: None,
                requested: 1,
                available: 0,
            },
        ];
        let response = ServiceError::StockValidation(lines).into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.code.as_deref(), Some("OUT_OF_STOCK"));
        assert_eq!(payload.details.unwrap().as_array().unwrap().len(), 2);
        assert!(payload.message.contains("Only 1 of Tee (size M) available"));
        assert!(payload.message.contains("item (size L) is out of stock"));
    }

    #[test]
    fn coupon_rejection_codes() {
        let err = ServiceError::from(CouponRejection::MinOrderNotMet {
            min_order_value: dec!(500),
            cart_subtotal: dec!(400),
        });
        assert_eq!(err.code(), Some("MIN_ORDER_NOT_MET"));
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        let details = err.details().unwrap();
        assert_eq!(details["minOrderValue"], json!("500"));
    }

    #[test]
    fn response_message_hides_internal_details() {
        assert_eq!(
            ServiceError::db_error("relation missing").response_message(),
            "Database error"
        );
        assert_eq!(
            ServiceError::InternalError("ledger offline".into()).response_message(),
            "Internal server error"
        );
        assert_eq!(
            ServiceError::InvalidInput("qty must be positive".into()).response_message(),
            "Invalid input: qty must be positive"
        );
    }

    #[test]
    fn reconciliation_statuses() {
        assert_eq!(
            ReconciliationError::AmountMismatch {
                expected_minor: 50_000,
                captured_minor: 49_900
            }
            .status(),
            "amount_mismatch"
        );
        assert_eq!(
            ReconciliationError::Gateway("timeout".into()).status(),
            "razorpay_error"
        );
        assert!(ReconciliationError::PaymentNotCompleted.is_retryable());
        assert!(!ReconciliationError::RecoveryFailed.is_retryable());
        assert!(!ReconciliationError::OrderCreationFailed.is_retryable());
        assert!(ReconciliationError::OrderCreationFailed.warrants_redelivery());
        assert!(!ReconciliationError::AmountMismatch {
            expected_minor: 1,
            captured_minor: 2
        }
        .warrants_redelivery());
    }
}
