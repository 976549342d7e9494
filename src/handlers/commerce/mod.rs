pub mod checkout;

use crate::AppState;
use axum::Router;

/// Storefront checkout routes, nested under `/checkout/sessions`
pub fn commerce_routes() -> Router<AppState> {
    Router::new().nest("/checkout/sessions", checkout::checkout_routes())
}
