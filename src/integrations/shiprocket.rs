//! Shiprocket client. Only shipment creation is consumed; the login token is cached
//! in a [`TokenCache`] and refreshed on expiry or on a 401.

use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::cache::TokenCache;
use crate::config::ShiprocketConfig;
use crate::entities::order;
use crate::errors::ServiceError;

#[derive(Debug, thiserror::Error)]
pub enum CarrierError {
    #[error("carrier request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("carrier login failed: {0}")]
    Login(String),
    #[error("carrier returned {status}: {message}")]
    Api { status: u16, message: String },
}

impl From<CarrierError> for ServiceError {
    fn from(err: CarrierError) -> Self {
        ServiceError::ExternalServiceError(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShipmentItem {
    pub name: String,
    pub sku: String,
    pub units: i32,
    pub selling_price: Decimal,
}

/// Payload for an ad-hoc Shiprocket order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShipmentRequest {
    #[serde(rename = "order_id")]
    pub order_number: String,
    pub order_date: String,
    pub billing_customer_name: String,
    pub billing_address: String,
    pub billing_city: String,
    pub billing_state: String,
    pub billing_pincode: String,
    pub billing_country: String,
    pub billing_phone: String,
    pub billing_email: Option<String>,
    pub shipping_is_billing: bool,
    pub order_items: Vec<ShipmentItem>,
    pub payment_method: String,
    pub sub_total: Decimal,
}

impl ShipmentRequest {
    /// Builds the carrier payload from a confirmed order. Orders without an address
    /// cannot be shipped.
    pub fn from_order(order: &order::Model) -> Option<Self> {
        let address = order.shipping_address.as_ref()?;
        let street = match &address.line2 {
            Some(line2) if !line2.is_empty() => format!("{}, {}", address.line1, line2),
            _ => address.line1.clone(),
        };

        Some(Self {
            order_number: order.order_number.clone(),
            order_date: order.created_at.format("%Y-%m-%d %H:%M").to_string(),
            billing_customer_name: address.name.clone(),
            billing_address: street,
            billing_city: address.city.clone(),
            billing_state: address.state.clone(),
            billing_pincode: address.postal_code.clone(),
            billing_country: address.country.clone(),
            billing_phone: address.phone.clone(),
            billing_email: address.email.clone(),
            shipping_is_billing: true,
            order_items: order
                .items
                .0
                .iter()
                .map(|item| ShipmentItem {
                    name: item.name.clone(),
                    sku: format!("{}-{}", item.slug, item.size),
                    units: item.qty,
                    selling_price: item.price,
                })
                .collect(),
            payment_method: "Prepaid".into(),
            sub_total: order.total_amount,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ShipmentReceipt {
    #[serde(rename = "order_id")]
    pub carrier_order_id: i64,
    pub shipment_id: i64,
    #[serde(default)]
    pub status: Option<String>,
}

#[async_trait]
pub trait ShippingCarrier: Send + Sync {
    async fn create_shipment(&self, request: &ShipmentRequest)
        -> Result<ShipmentReceipt, CarrierError>;
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

pub struct ShiprocketClient {
    client: reqwest::Client,
    base_url: String,
    email: String,
    password: String,
    tokens: Arc<TokenCache>,
}

impl ShiprocketClient {
    pub fn new(config: &ShiprocketConfig, tokens: Arc<TokenCache>) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            email: config.email.clone(),
            password: config.password.clone(),
            tokens,
        })
    }

    async fn login(&self) -> Result<String, CarrierError> {
        let response = self
            .client
            .post(format!("{}/auth/login", self.base_url))
            .json(&LoginRequest {
                email: &self.email,
                password: &self.password,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CarrierError::Login(format!("status {}", response.status())));
        }
        let body: LoginResponse = response.json().await?;
        info!("Obtained Shiprocket token");
        Ok(body.token)
    }

    async fn token(&self) -> Result<String, CarrierError> {
        self.tokens.get_or_refresh(|| self.login()).await
    }

    async fn post_shipment(
        &self,
        token: &str,
        request: &ShipmentRequest,
    ) -> Result<reqwest::Response, CarrierError> {
        Ok(self
            .client
            .post(format!("{}/orders/create/adhoc", self.base_url))
            .bearer_auth(token)
            .json(request)
            .send()
            .await?)
    }
}

#[async_trait]
impl ShippingCarrier for ShiprocketClient {
    #[instrument(skip(self, request), fields(order_number = %request.order_number))]
    async fn create_shipment(
        &self,
        request: &ShipmentRequest,
    ) -> Result<ShipmentReceipt, CarrierError> {
        let token = self.token().await?;
        let mut response = self.post_shipment(&token, request).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            warn!("Shiprocket token rejected; logging in again");
            self.tokens.invalidate().await;
            let token = self.token().await?;
            response = self.post_shipment(&token, request).await?;
        }

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CarrierError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ShiprocketClient {
        let config = ShiprocketConfig {
            email: "ops@example.com".into(),
            password: "pw".into(),
            base_url: server.uri(),
            ..ShiprocketConfig::default()
        };
        ShiprocketClient::new(&config, Arc::new(TokenCache::new(config.token_ttl()))).unwrap()
    }

    fn request() -> ShipmentRequest {
        ShipmentRequest {
            order_number: "ORD-1A2B3C4D".into(),
            order_date: "2024-06-01 10:00".into(),
            billing_customer_name: "Asha".into(),
            billing_address: "1 Main St".into(),
            billing_city: "Pune".into(),
            billing_state: "MH".into(),
            billing_pincode: "411001".into(),
            billing_country: "IN".into(),
            billing_phone: "9999999999".into(),
            billing_email: None,
            shipping_is_billing: true,
            order_items: vec![],
            payment_method: "Prepaid".into(),
            sub_total: Decimal::ONE_HUNDRED,
        }
    }

    #[tokio::test]
    async fn logs_in_once_and_reuses_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "t1" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/orders/create/adhoc"))
            .and(header("authorization", "Bearer t1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "order_id": 11, "shipment_id": 22, "status": "NEW"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let carrier = client(&server);
        let first = carrier.create_shipment(&request()).await.unwrap();
        let second = carrier.create_shipment(&request()).await.unwrap();
        assert_eq!(first.shipment_id, 22);
        assert_eq!(second.carrier_order_id, 11);
    }

    #[tokio::test]
    async fn unauthorized_response_refreshes_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "fresh" })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/orders/create/adhoc"))
            .and(header("authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/orders/create/adhoc"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "order_id": 1, "shipment_id": 2
            })))
            .mount(&server)
            .await;

        let carrier = client(&server);
        carrier.tokens.set("stale").await;
        let receipt = carrier.create_shipment(&request()).await.unwrap();
        assert_eq!(receipt.shipment_id, 2);
        assert_eq!(carrier.tokens.peek().await.as_deref(), Some("fresh"));
    }
}
