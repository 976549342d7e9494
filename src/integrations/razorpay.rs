//! Razorpay client: order creation, payment lookup and webhook verification.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::config::RazorpayConfig;
use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the webhook body signature.
pub const SIGNATURE_HEADER: &str = "x-razorpay-signature";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gateway returned {status}: {message}")]
    Api { status: u16, message: String },
}

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        ServiceError::ExternalServiceError(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateGatewayOrder {
    /// Minor units
    pub amount: i64,
    pub currency: String,
    pub receipt: String,
    pub notes: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub amount_paid: i64,
    pub currency: String,
    #[serde(default)]
    pub receipt: Option<String>,
    pub status: String,
    #[serde(default)]
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayPayment {
    pub id: String,
    pub status: String,
    /// Minor units
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub created_at: i64,
}

impl GatewayPayment {
    /// `captured` and `authorized` both mean the shopper has paid.
    pub fn is_successful(&self) -> bool {
        matches!(self.status.as_str(), "captured" | "authorized")
    }
}

#[derive(Debug, Deserialize)]
struct Collection<T> {
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    description: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(&self, request: CreateGatewayOrder) -> Result<GatewayOrder, GatewayError>;

    async fn fetch_order(&self, order_id: &str) -> Result<GatewayOrder, GatewayError>;

    async fn fetch_payments(&self, order_id: &str) -> Result<Vec<GatewayPayment>, GatewayError>;
}

#[derive(Clone)]
pub struct RazorpayClient {
    client: reqwest::Client,
    base_url: String,
    key_id: String,
    key_secret: String,
}

impl RazorpayClient {
    pub fn new(config: &RazorpayConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            key_id: config.key_id.clone(),
            key_secret: config.key_secret.clone(),
        })
    }

    async fn decode<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|b| b.error.description)
            .unwrap_or(body);
        warn!(status = status.as_u16(), %message, "Razorpay request rejected");
        Err(GatewayError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl PaymentGateway for RazorpayClient {
    #[instrument(skip(self, request), fields(receipt = %request.receipt, amount = request.amount))]
    async fn create_order(&self, request: CreateGatewayOrder) -> Result<GatewayOrder, GatewayError> {
        let response = self
            .client
            .post(format!("{}/orders", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&request)
            .send()
            .await?;
        let order: GatewayOrder = Self::decode(response).await?;
        debug!(order_id = %order.id, "Razorpay order created");
        Ok(order)
    }

    #[instrument(skip(self))]
    async fn fetch_order(&self, order_id: &str) -> Result<GatewayOrder, GatewayError> {
        let response = self
            .client
            .get(format!("{}/orders/{}", self.base_url, order_id))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .send()
            .await?;
        Self::decode(response).await
    }

    #[instrument(skip(self))]
    async fn fetch_payments(&self, order_id: &str) -> Result<Vec<GatewayPayment>, GatewayError> {
        let response = self
            .client
            .get(format!("{}/orders/{}/payments", self.base_url, order_id))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .send()
            .await?;
        let collection: Collection<GatewayPayment> = Self::decode(response).await?;
        Ok(collection.items)
    }
}

/// Checks `signature` (hex HMAC-SHA256 of the raw body) in constant time.
pub fn verify_webhook_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Hex HMAC-SHA256 of `body`, as Razorpay signs webhooks.
pub fn sign_webhook_body(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Deserialize)]
struct EntityWrapper<T> {
    entity: T,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    payment: Option<EntityWrapper<GatewayPayment>>,
    #[serde(default)]
    order: Option<EntityWrapper<GatewayOrder>>,
}

/// Webhook envelope as delivered by Razorpay.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    #[serde(default)]
    payload: WebhookPayload,
}

impl WebhookEvent {
    /// Events that mean money has moved for an order.
    pub fn is_payment_success(&self) -> bool {
        matches!(
            self.event.as_str(),
            "payment.captured" | "payment.authorized" | "order.paid"
        )
    }

    /// Gateway order id, from the order entity or the payment's `order_id`.
    pub fn gateway_order_id(&self) -> Option<&str> {
        self.payload
            .order
            .as_ref()
            .map(|o| o.entity.id.as_str())
            .or_else(|| {
                self.payload
                    .payment
                    .as_ref()
                    .and_then(|p| p.entity.order_id.as_deref())
            })
    }

    pub fn payment(&self) -> Option<&GatewayPayment> {
        self.payload.payment.as_ref().map(|p| &p.entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{basic_auth, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: String) -> RazorpayConfig {
        RazorpayConfig {
            key_id: "rzp_test_key".into(),
            key_secret: "secret".into(),
            webhook_secret: Some("whsec".into()),
            base_url,
            timeout_secs: 5,
        }
    }

    #[test]
    fn signature_round_trips_and_rejects_tampering() {
        let body = br#"{"event":"payment.captured"}"#;
        let sig = sign_webhook_body("whsec", body).unwrap();
        assert!(verify_webhook_signature("whsec", body, &sig));
        assert!(!verify_webhook_signature("other", body, &sig));
        assert!(!verify_webhook_signature("whsec", b"{}", &sig));
        assert!(!verify_webhook_signature("whsec", body, "not-hex"));
    }

    #[test]
    fn webhook_event_exposes_order_and_payment() {
        let raw = json!({
            "entity": "event",
            "event": "payment.captured",
            "payload": {
                "payment": { "entity": {
                    "id": "pay_1", "status": "captured", "amount": 50000,
                    "currency": "INR", "order_id": "order_1", "created_at": 1
                }}
            }
        });
        let event: WebhookEvent = serde_json::from_value(raw).unwrap();
        assert!(event.is_payment_success());
        assert_eq!(event.gateway_order_id(), Some("order_1"));
        assert_eq!(event.payment().unwrap().id, "pay_1");
    }

    #[tokio::test]
    async fn fetch_payments_uses_basic_auth_and_unwraps_collection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orders/order_1/payments"))
            .and(basic_auth("rzp_test_key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "entity": "collection",
                "count": 1,
                "items": [{
                    "id": "pay_1", "status": "authorized", "amount": 49900,
                    "currency": "INR", "order_id": "order_1", "created_at": 1700000000
                }]
            })))
            .mount(&server)
            .await;

        let client = RazorpayClient::new(&config(server.uri())).unwrap();
        let payments = client.fetch_payments("order_1").await.unwrap();
        assert_eq!(payments.len(), 1);
        assert!(payments[0].is_successful());
        assert_eq!(payments[0].amount, 49900);
    }

    #[tokio::test]
    async fn api_errors_carry_gateway_description() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "code": "BAD_REQUEST_ERROR", "description": "amount too low" }
            })))
            .mount(&server)
            .await;

        let client = RazorpayClient::new(&config(server.uri())).unwrap();
        let err = client
            .create_order(CreateGatewayOrder {
                amount: 1,
                currency: "INR".into(),
                receipt: "r".into(),
                notes: HashMap::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Api { status: 400, ref message } if message == "amount too low"));
    }
}
