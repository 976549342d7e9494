use crate::common::Claimant;
use crate::errors::ServiceError;
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

pub const CUSTOMER_ID_HEADER: &str = "x-customer-id";
pub const GUEST_TRACKING_HEADER: &str = "x-guest-tracking-id";

const MAX_GUEST_TRACKING_LEN: usize = 128;

/// Standard success response
pub fn success_response<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(data)).into_response()
}

/// Standard created response
pub fn created_response<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(data)).into_response()
}

/// Claimant of the current request, resolved from the identity headers set upstream.
///
/// A customer id wins over a guest tracking id when both are present.
#[derive(Debug, Clone)]
pub struct RequestClaimant(pub Claimant);

#[async_trait]
impl<S> FromRequestParts<S> for RequestClaimant
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        claimant_from_parts(parts).map(RequestClaimant)
    }
}

fn claimant_from_parts(parts: &Parts) -> Result<Claimant, ServiceError> {
    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(raw) = header(CUSTOMER_ID_HEADER) {
        return Uuid::parse_str(raw)
            .map(Claimant::Identified)
            .map_err(|_| ServiceError::Unauthorized("Malformed customer id".to_string()));
    }

    match header(GUEST_TRACKING_HEADER) {
        Some(tracking) if tracking.len() <= MAX_GUEST_TRACKING_LEN => {
            Ok(Claimant::Guest(tracking.to_string()))
        }
        Some(_) => Err(ServiceError::Unauthorized(
            "Malformed guest tracking id".to_string(),
        )),
        None => Err(ServiceError::Unauthorized(
            "Customer or guest identity required".to_string(),
        )),
    }
}
