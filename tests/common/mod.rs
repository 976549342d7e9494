#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ConnectOptions, Database, DatabaseConnection, Set};
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

use checkout_engine::{
    common::Claimant,
    config::{AppConfig, CheckoutConfig},
    db,
    entities::commerce::{
        checkout_session::ShippingAddress,
        coupon::{self, CouponScope, CouponType},
        product_variant,
    },
    events::{self, EventSender},
    handlers::AppServices,
    integrations::razorpay::{
        CreateGatewayOrder, GatewayError, GatewayOrder, GatewayPayment, PaymentGateway,
    },
    integrations::shiprocket::{CarrierError, ShipmentReceipt, ShipmentRequest, ShippingCarrier},
    services::{
        commerce::checkout_service::{CheckoutLineInput, CreateSessionInput, PaymentWindow},
        expiry_sweeper::ExpirySweeper,
        shipments::ShipmentDispatcher,
    },
    AppState,
};

pub const WEBHOOK_SECRET: &str = "whsec_test";

/// Gateway double: hands out sequential order ids and serves whatever payments a
/// test registered for an order.
#[derive(Default)]
pub struct StubGateway {
    created: Mutex<Vec<CreateGatewayOrder>>,
    payments: Mutex<HashMap<String, Vec<GatewayPayment>>>,
    fetch_calls: AtomicUsize,
    fail_fetch: Mutex<bool>,
}

impl StubGateway {
    pub fn created_orders(&self) -> Vec<CreateGatewayOrder> {
        self.created.lock().unwrap().clone()
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn fail_fetches(&self) {
        *self.fail_fetch.lock().unwrap() = true;
    }

    /// Registers a payment for `order_id` and returns it.
    pub fn pay(&self, order_id: &str, amount: i64, status: &str) -> GatewayPayment {
        let payment = GatewayPayment {
            id: format!("pay_{}", Uuid::new_v4().simple()),
            status: status.to_string(),
            amount,
            currency: "INR".to_string(),
            order_id: Some(order_id.to_string()),
            contact: Some("+919999999999".to_string()),
            email: Some("shopper@example.com".to_string()),
            created_at: Utc::now().timestamp(),
        };
        self.payments
            .lock()
            .unwrap()
            .entry(order_id.to_string())
            .or_default()
            .push(payment.clone());
        payment
    }
}

#[async_trait]
impl PaymentGateway for StubGateway {
    async fn create_order(&self, request: CreateGatewayOrder) -> Result<GatewayOrder, GatewayError> {
        let mut created = self.created.lock().unwrap();
        let order = GatewayOrder {
            id: format!("order_test_{}", created.len() + 1),
            amount: request.amount,
            amount_paid: 0,
            currency: request.currency.clone(),
            receipt: Some(request.receipt.clone()),
            status: "created".to_string(),
            created_at: Utc::now().timestamp(),
        };
        created.push(request);
        Ok(order)
    }

    async fn fetch_order(&self, order_id: &str) -> Result<GatewayOrder, GatewayError> {
        Err(GatewayError::Api {
            status: 404,
            message: format!("order {} not tracked by stub", order_id),
        })
    }

    async fn fetch_payments(&self, order_id: &str) -> Result<Vec<GatewayPayment>, GatewayError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_fetch.lock().unwrap() {
            return Err(GatewayError::Api {
                status: 503,
                message: "gateway unavailable".to_string(),
            });
        }
        Ok(self
            .payments
            .lock()
            .unwrap()
            .get(order_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Carrier double that records every shipment request.
#[derive(Default)]
pub struct StubCarrier {
    requests: Mutex<Vec<ShipmentRequest>>,
}

impl StubCarrier {
    pub fn requests(&self) -> Vec<ShipmentRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ShippingCarrier for StubCarrier {
    async fn create_shipment(
        &self,
        request: &ShipmentRequest,
    ) -> Result<ShipmentReceipt, CarrierError> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request.clone());
        Ok(ShipmentReceipt {
            carrier_order_id: 1000 + requests.len() as i64,
            shipment_id: 5000 + requests.len() as i64,
            status: Some("NEW".to_string()),
        })
    }
}

/// Application wired against an in-memory SQLite database and stub collaborators.
pub struct TestApp {
    pub db: Arc<DatabaseConnection>,
    pub gateway: Arc<StubGateway>,
    pub carrier: Arc<StubCarrier>,
    pub services: AppServices,
    pub config: AppConfig,
    router: Router,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_checkout_config(CheckoutConfig::default()).await
    }

    pub async fn with_checkout_config(checkout: CheckoutConfig) -> Self {
        let mut opt = ConnectOptions::new("sqlite::memory:");
        opt.max_connections(1).min_connections(1).sqlx_logging(false);
        let pool = Database::connect(opt)
            .await
            .expect("failed to open in-memory database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db_arc = Arc::new(pool);

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(StubGateway::default());
        let carrier = Arc::new(StubCarrier::default());
        let (shipments, _worker) = ShipmentDispatcher::spawn(
            carrier.clone(),
            db_arc.clone(),
            event_sender.clone(),
            16,
        );

        let mut config = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        config.checkout = checkout.clone();
        config.razorpay.webhook_secret = Some(WEBHOOK_SECRET.to_string());

        let services = AppServices::new(
            db_arc.clone(),
            event_sender,
            gateway.clone(),
            shipments,
            checkout,
        );

        let state = AppState {
            db: db_arc.clone(),
            config: config.clone(),
            services: services.clone(),
        };
        let router = checkout_engine::app_router(state);

        Self {
            db: db_arc,
            gateway,
            carrier,
            services,
            config,
            router,
            _event_task: event_task,
        }
    }

    pub fn sweeper(&self) -> ExpirySweeper {
        ExpirySweeper::new(
            self.db.clone(),
            self.services.checkout.clone(),
            self.config.checkout.clone(),
        )
    }

    pub async fn seed_variant(&self, price: Decimal, stock: i32) -> product_variant::Model {
        self.seed_variant_with(|v| {
            v.price = Set(price);
            v.catalog_price = Set(price);
            v.total_stock_qty = Set(stock);
        })
        .await
    }

    pub async fn seed_variant_with(
        &self,
        customize: impl FnOnce(&mut product_variant::ActiveModel),
    ) -> product_variant::Model {
        let now = Utc::now();
        let product_id = Uuid::new_v4();
        let mut model = product_variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product_id),
            size: Set("M".to_string()),
            name: Set("Classic Tee".to_string()),
            slug: Set(format!("classic-tee-{}", &product_id.simple().to_string()[..6])),
            category: Set(Some("tees".to_string())),
            price: Set(Decimal::new(49900, 2)),
            catalog_price: Set(Decimal::new(49900, 2)),
            total_stock_qty: Set(10),
            sold_qty: Set(0),
            lock_version: Set(0),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        };
        customize(&mut model);
        model.insert(&*self.db).await.expect("seed product variant")
    }

    pub async fn seed_coupon(
        &self,
        code: &str,
        coupon_type: CouponType,
        value: Decimal,
    ) -> coupon::Model {
        self.seed_coupon_with(code, coupon_type, value, |_| {}).await
    }

    pub async fn seed_coupon_with(
        &self,
        code: &str,
        coupon_type: CouponType,
        value: Decimal,
        customize: impl FnOnce(&mut coupon::ActiveModel),
    ) -> coupon::Model {
        let now = Utc::now();
        let mut model = coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(coupon::normalize_code(code)),
            coupon_type: Set(coupon_type),
            value: Set(value),
            min_order_value: Set(Decimal::ZERO),
            max_discount: Set(None),
            scope: Set(CouponScope::default()),
            exclude_discounted_items: Set(false),
            usage_limit: Set(None),
            usage_count: Set(0),
            user_usage_limit: Set(None),
            valid_from: Set(now - Duration::days(1)),
            valid_until: Set(Some(now + Duration::days(30))),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        };
        customize(&mut model);
        model.insert(&*self.db).await.expect("seed coupon")
    }

    /// Creates a session, validates it against a fixed address and opens the payment window.
    pub async fn session_in_payment(
        &self,
        claimant: &Claimant,
        lines: &[(&product_variant::Model, i32)],
    ) -> PaymentWindow {
        let checkout = &self.services.checkout;
        let session = checkout
            .create_session(claimant, cart_input(lines))
            .await
            .expect("create session");
        let validation = checkout
            .validate_for_payment(claimant, session.id, address())
            .await
            .expect("validate for payment");
        assert!(!validation.has_errors, "unexpected blocking issues");
        checkout
            .open_payment_window(claimant, session.id)
            .await
            .expect("open payment window")
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn raw_request(
        &self,
        uri: &str,
        body: Vec<u8>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(Body::from(body)).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

pub fn guest(tracking: &str) -> Claimant {
    Claimant::Guest(tracking.to_string())
}

pub fn customer() -> Claimant {
    Claimant::Identified(Uuid::new_v4())
}

pub fn line(variant: &product_variant::Model, qty: i32) -> CheckoutLineInput {
    CheckoutLineInput {
        product_id: variant.product_id,
        size: variant.size.clone(),
        qty,
    }
}

pub fn cart_input(lines: &[(&product_variant::Model, i32)]) -> CreateSessionInput {
    serde_json::from_value(serde_json::json!({
        "type": "cart_checkout",
        "items": lines
            .iter()
            .map(|(variant, qty)| serde_json::json!({
                "productId": variant.product_id,
                "size": variant.size,
                "qty": qty,
            }))
            .collect::<Vec<_>>(),
    }))
    .expect("cart checkout input")
}

pub fn address() -> ShippingAddress {
    ShippingAddress {
        name: "Asha Rao".to_string(),
        phone: "9876543210".to_string(),
        email: Some("asha@example.com".to_string()),
        line1: "12 MG Road".to_string(),
        line2: None,
        city: "Bengaluru".to_string(),
        state: "KA".to_string(),
        postal_code: "560001".to_string(),
        country: "IN".to_string(),
    }
}
