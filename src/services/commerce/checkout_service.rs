//! Checkout session lifecycle
//!
//! A session moves `active -> processing -> completed`, with side exits to `expired`
//! and `cancelled`. Every status change is a conditional update on the current status;
//! field edits go through a version-checked save and are retried on conflict.

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, QueryFilter, Set, TransactionTrait, UpdateMany,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::common::{round_money, to_minor_units, Claimant, LineKey};
use crate::config::CheckoutConfig;
use crate::entities::commerce::checkout_session::{
    self, AppliedCoupon, CheckoutStatus, LineDiscount, LockedTotals, SessionItem, SessionItems,
    SessionType, ShippingAddress,
};
use crate::entities::commerce::coupon::CouponType;
use crate::entities::commerce::product_variant;
use crate::entities::inventory_reservation::ReservationStatus;
use crate::errors::{ServiceError, SessionStateError};
use crate::events::{Event, EventSender};
use crate::integrations::razorpay::{CreateGatewayOrder, PaymentGateway};
use crate::services::commerce::coupon_service::CouponService;
use crate::services::commerce::discount_engine::{calculate_discount, PricedLine};
use crate::services::inventory_reservation_service::{
    ReservationOwner, ReservationRequest, ReservationStore,
};

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutLineInput {
    pub product_id: Uuid,
    #[validate(length(min = 1, max = 32))]
    pub size: String,
    #[validate(range(min = 1, max = 99))]
    pub qty: i32,
}

/// Buy-now sends `productId`/`size`/`qty`; cart checkout sends `items`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionInput {
    #[serde(rename = "type")]
    pub session_type: SessionType,
    #[serde(default)]
    pub items: Vec<CheckoutLineInput>,
    pub product_id: Option<Uuid>,
    pub size: Option<String>,
    pub qty: Option<i32>,
}

impl CreateSessionInput {
    pub fn lines(&self) -> Result<Vec<CheckoutLineInput>, ServiceError> {
        let lines = match self.session_type {
            SessionType::BuyNow => match (self.product_id, &self.size) {
                (Some(product_id), Some(size)) => vec![CheckoutLineInput {
                    product_id,
                    size: size.trim().to_string(),
                    qty: self.qty.unwrap_or(1),
                }],
                _ if self.items.len() == 1 => self.items.clone(),
                _ => {
                    return Err(ServiceError::InvalidInput(
                        "Buy-now checkout requires productId, size and qty".into(),
                    ))
                }
            },
            SessionType::CartCheckout => self.items.clone(),
        };

        if lines.is_empty() {
            return Err(ServiceError::InvalidInput(
                "At least one item is required".into(),
            ));
        }
        for line in &lines {
            line.validate()?;
        }
        Ok(lines)
    }
}

/// Money view of a session. `total` excludes the shipping discount, which is settled
/// against shipping charges downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartTotals {
    pub subtotal: Decimal,
    pub discount_total: Decimal,
    pub shipping_discount: Decimal,
    pub total: Decimal,
    pub currency: String,
}

impl CartTotals {
    pub fn compute(items: &[SessionItem], coupon: Option<&AppliedCoupon>, currency: &str) -> Self {
        let subtotal = round_money(items.iter().map(SessionItem::line_total).sum());
        let discount_total = coupon.map(|c| c.total_discount).unwrap_or(Decimal::ZERO);
        let shipping_discount = coupon.map(|c| c.shipping_discount).unwrap_or(Decimal::ZERO);
        Self {
            subtotal,
            discount_total,
            shipping_discount,
            total: round_money(subtotal - discount_total).max(Decimal::ZERO),
            currency: currency.to_string(),
        }
    }

    pub fn of(session: &checkout_session::Model, currency: &str) -> Self {
        Self::compute(&session.items.0, session.applied_coupon.as_ref(), currency)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: Uuid,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub status: CheckoutStatus,
    pub items: Vec<SessionItem>,
    pub applied_coupon: Option<AppliedCoupon>,
    pub expires_at: DateTime<Utc>,
    pub totals: CartTotals,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_totals: Option<LockedTotals>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub razorpay_order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
}

impl SessionView {
    pub fn new(session: &checkout_session::Model, currency: &str) -> Self {
        Self {
            session_id: session.id,
            session_type: session.session_type,
            status: session.status,
            items: session.items.0.clone(),
            applied_coupon: session.applied_coupon.clone(),
            expires_at: session.expires_at,
            totals: CartTotals::of(session, currency),
            locked_totals: session.locked_totals.clone(),
            razorpay_order_id: session.razorpay_order_id.clone(),
            validated_at: session.validated_at,
            order_id: session.order_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponSummary {
    pub code: String,
    #[serde(rename = "type")]
    pub coupon_type: CouponType,
    pub value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscountSummary {
    pub total_discount: Decimal,
    pub shipping_discount: Decimal,
    pub item_discounts: Vec<LineDiscount>,
    pub eligible_items: Vec<LineKey>,
}

/// Response of apply/remove coupon.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponOutcome {
    pub coupon: Option<CouponSummary>,
    pub discount: DiscountSummary,
    pub cart_totals: CartTotals,
    pub session: SessionView,
}

impl CouponOutcome {
    fn from_session(session: &checkout_session::Model, currency: &str) -> Self {
        let (coupon, discount) = match &session.applied_coupon {
            Some(applied) => (
                Some(CouponSummary {
                    code: applied.code.clone(),
                    coupon_type: applied.coupon_type,
                    value: applied.value,
                }),
                DiscountSummary {
                    total_discount: applied.total_discount,
                    shipping_discount: applied.shipping_discount,
                    item_discounts: applied.item_discounts.clone(),
                    eligible_items: applied.eligible_items.clone(),
                },
            ),
            None => (
                None,
                DiscountSummary {
                    total_discount: Decimal::ZERO,
                    shipping_discount: Decimal::ZERO,
                    item_discounts: session
                        .items
                        .0
                        .iter()
                        .map(|item| LineDiscount {
                            product_id: item.product_id,
                            size: item.size.clone(),
                            discount: Decimal::ZERO,
                            eligible: false,
                        })
                        .collect(),
                    eligible_items: Vec::new(),
                },
            ),
        };

        Self {
            coupon,
            discount,
            cart_totals: CartTotals::of(session, currency),
            session: SessionView::new(session, currency),
        }
    }
}

/// Problem or notice produced by validate-for-payment. Only blocking issues stop payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
    pub blocking: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

impl ValidationIssue {
    fn notice(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            blocking: false,
            product_id: None,
            size: None,
        }
    }

    fn blocking(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            blocking: true,
            ..Self::notice(code, message)
        }
    }

    fn for_line(mut self, key: &LineKey) -> Self {
        self.product_id = Some(key.product_id);
        self.size = Some(key.size.clone());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentValidation {
    pub has_errors: bool,
    pub errors: Vec<ValidationIssue>,
    pub totals: CartTotals,
    pub session: SessionView,
}

/// What the client needs to open the gateway's payment sheet.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentWindow {
    pub session_id: Uuid,
    pub razorpay_order_id: String,
    /// Minor units
    pub amount: i64,
    pub currency: String,
    pub locked_totals: LockedTotals,
    pub expires_at: DateTime<Utc>,
}

impl PaymentWindow {
    fn from_session(session: &checkout_session::Model) -> Option<Self> {
        let razorpay_order_id = session.razorpay_order_id.clone()?;
        let locked_totals = session.locked_totals.clone()?;
        let amount = to_minor_units(session.locked_total?)?;
        Some(Self {
            session_id: session.id,
            razorpay_order_id,
            amount,
            currency: locked_totals.currency.clone(),
            locked_totals,
            expires_at: session.expires_at,
        })
    }
}

/// Conditional status change `from -> to` on one session. Callers add extra columns or
/// filters and check `rows_affected`.
pub(crate) fn transition(
    session_id: Uuid,
    from: CheckoutStatus,
    to: CheckoutStatus,
) -> UpdateMany<checkout_session::Entity> {
    let mut update = checkout_session::Entity::update_many()
        .col_expr(checkout_session::Column::Status, Expr::value(to.as_str()))
        .col_expr(
            checkout_session::Column::Version,
            Expr::col(checkout_session::Column::Version).add(1),
        )
        .col_expr(checkout_session::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(checkout_session::Column::Id.eq(session_id))
        .filter(checkout_session::Column::Status.eq(from));
    if to.is_terminal() {
        update = update.col_expr(
            checkout_session::Column::HasActiveReservations,
            Expr::value(false),
        );
    }
    update
}

/// Saves `active` only if nobody else saved `current` in the meantime.
pub(crate) async fn save_versioned<C: ConnectionTrait>(
    conn: &C,
    current: &checkout_session::Model,
    mut active: checkout_session::ActiveModel,
) -> Result<checkout_session::Model, ServiceError> {
    active.version = Set(current.version + 1);
    active.updated_at = Set(Utc::now());
    checkout_session::Entity::update(active)
        .filter(checkout_session::Column::Version.eq(current.version))
        .exec(conn)
        .await
        .map_err(|err| match err {
            DbErr::RecordNotUpdated => ServiceError::ConcurrentModification(current.id),
            other => ServiceError::DatabaseError(other),
        })
}

async fn find_variant<C: ConnectionTrait>(
    conn: &C,
    key: &LineKey,
) -> Result<Option<product_variant::Model>, DbErr> {
    product_variant::Entity::find()
        .filter(product_variant::Column::ProductId.eq(key.product_id))
        .filter(product_variant::Column::Size.eq(key.size.clone()))
        .one(conn)
        .await
}

fn payment_started(session: &checkout_session::Model, action: &'static str) -> ServiceError {
    SessionStateError::InvalidState {
        session_id: session.id,
        status: "awaiting_payment".into(),
        action,
    }
    .into()
}

#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    gateway: Arc<dyn PaymentGateway>,
    reservations: ReservationStore,
    coupons: CouponService,
    config: CheckoutConfig,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        config: CheckoutConfig,
    ) -> Self {
        Self {
            db,
            event_sender,
            gateway,
            reservations: ReservationStore::new(),
            coupons: CouponService::new(),
            config,
        }
    }

    pub fn config(&self) -> &CheckoutConfig {
        &self.config
    }

    /// Creates a session with its reservations in one transaction. Any other active
    /// session of the same claimant is cancelled in the same transaction.
    #[instrument(skip(self, input), fields(claimant = %claimant, session_type = ?input.session_type))]
    pub async fn create_session(
        &self,
        claimant: &Claimant,
        input: CreateSessionInput,
    ) -> Result<checkout_session::Model, ServiceError> {
        let lines = input.lines()?;
        let now = Utc::now();
        let owner = ReservationOwner {
            session_id: Uuid::new_v4(),
            session_type: input.session_type,
            claimant: claimant.clone(),
            expires_at: now + self.config.session_ttl(),
        };

        let txn = self.db.begin().await?;
        let superseded = self.cancel_superseded(&txn, claimant).await?;

        let requests = lines
            .into_iter()
            .map(|line| ReservationRequest {
                key: LineKey::new(line.product_id, line.size.trim()),
                qty: line.qty,
            })
            .collect();
        let reservations = self
            .reservations
            .create_multiple_reservations(&txn, &owner, requests)
            .await?;

        let mut items = Vec::with_capacity(reservations.len());
        for reservation in &reservations {
            let variant = find_variant(&txn, &reservation.key()).await?.ok_or_else(|| {
                ServiceError::InternalError(format!("Variant {} vanished", reservation.key()))
            })?;
            items.push(SessionItem {
                product_id: variant.product_id,
                name: variant.name,
                slug: variant.slug,
                size: variant.size,
                qty: reservation.reserved_qty,
                price: variant.price,
                catalog_price: variant.catalog_price,
                category: variant.category,
            });
        }

        let session = checkout_session::ActiveModel {
            id: Set(owner.session_id),
            owner_id: Set(claimant.owner_id()),
            guest_tracking_id: Set(claimant.guest_tracking_id()),
            session_type: Set(owner.session_type),
            items: Set(SessionItems(items)),
            applied_coupon: Set(None),
            has_active_reservations: Set(true),
            status: Set(CheckoutStatus::Active),
            expires_at: Set(owner.expires_at),
            locked_total: Set(None),
            locked_totals: Set(None),
            razorpay_order_id: Set(None),
            validated_at: Set(None),
            validated_address: Set(None),
            order_id: Set(None),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;

        for session_id in superseded {
            self.event_sender
                .send_or_log(Event::CheckoutCancelled(session_id));
        }
        counter!("checkout_sessions.created", 1, "type" => session.session_type.as_str());
        info!(session_id = %session.id, items = session.items.0.len(), "Checkout session created");
        self.event_sender.send_or_log(Event::CheckoutSessionCreated {
            session_id: session.id,
            item_count: session.items.0.len(),
            expires_at: session.expires_at,
        });

        Ok(session)
    }

    async fn cancel_superseded<C: ConnectionTrait>(
        &self,
        conn: &C,
        claimant: &Claimant,
    ) -> Result<Vec<Uuid>, ServiceError> {
        let previous = checkout_session::Entity::find()
            .filter(claimant.condition(
                checkout_session::Column::OwnerId,
                checkout_session::Column::GuestTrackingId,
            ))
            .filter(checkout_session::Column::Status.eq(CheckoutStatus::Active))
            .all(conn)
            .await?;

        let mut cancelled = Vec::new();
        for session in previous {
            let result = transition(session.id, CheckoutStatus::Active, CheckoutStatus::Cancelled)
                .exec(conn)
                .await?;
            if result.rows_affected == 0 {
                continue;
            }
            self.reservations
                .release_session_reservations(conn, session.id, ReservationStatus::Cancelled)
                .await?;
            self.coupons.drop_applications(conn, session.id).await?;
            debug!(session_id = %session.id, "Superseded checkout session cancelled");
            cancelled.push(session.id);
        }
        Ok(cancelled)
    }

    async fn find_owned<C: ConnectionTrait>(
        &self,
        conn: &C,
        claimant: &Claimant,
        session_id: Uuid,
    ) -> Result<checkout_session::Model, ServiceError> {
        checkout_session::Entity::find_by_id(session_id)
            .filter(claimant.condition(
                checkout_session::Column::OwnerId,
                checkout_session::Column::GuestTrackingId,
            ))
            .one(conn)
            .await?
            .ok_or_else(|| SessionStateError::NotFound(session_id).into())
    }

    /// Reads a session, expiring it on the spot when it is active but past its deadline.
    #[instrument(skip(self), fields(claimant = %claimant))]
    pub async fn get_session(
        &self,
        claimant: &Claimant,
        session_id: Uuid,
    ) -> Result<checkout_session::Model, ServiceError> {
        let now = Utc::now();
        let session = self.find_owned(&*self.db, claimant, session_id).await?;
        if session.status == CheckoutStatus::Active && session.is_past_expiry(now) {
            self.expire_session(session.id, now).await?;
            return self.find_owned(&*self.db, claimant, session_id).await;
        }
        Ok(session)
    }

    /// Loads a session that may still be edited, or explains why it may not.
    async fn load_mutable(
        &self,
        claimant: &Claimant,
        session_id: Uuid,
        action: &'static str,
    ) -> Result<checkout_session::Model, ServiceError> {
        let session = self.get_session(claimant, session_id).await?;
        match session.status {
            CheckoutStatus::Active => Ok(session),
            CheckoutStatus::Expired => Err(SessionStateError::Expired(session.id).into()),
            other => Err(SessionStateError::InvalidState {
                session_id: session.id,
                status: other.as_str().to_string(),
                action,
            }
            .into()),
        }
    }

    async fn retry_on_conflict<T, F, Fut>(&self, mut op: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let attempts = self.config.save_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(err) if err.is_concurrent_modification() && attempt < attempts => {
                    attempt += 1;
                    counter!("checkout_sessions.save_conflicts", 1);
                    debug!(attempt, error = %err, "Session saved concurrently; re-reading");
                }
                result => return result,
            }
        }
    }

    /// Evaluates `code` against the session's items and stores the snapshot.
    #[instrument(skip(self), fields(claimant = %claimant))]
    pub async fn apply_coupon(
        &self,
        claimant: &Claimant,
        session_id: Uuid,
        code: &str,
    ) -> Result<CouponOutcome, ServiceError> {
        let session = self
            .retry_on_conflict(|| self.try_apply_coupon(claimant, session_id, code))
            .await?;

        if let Some(applied) = &session.applied_coupon {
            self.event_sender.send_or_log(Event::CouponApplied {
                session_id,
                code: applied.code.clone(),
                total_discount: applied.total_discount + applied.shipping_discount,
            });
        }
        Ok(CouponOutcome::from_session(&session, &self.config.currency))
    }

    async fn try_apply_coupon(
        &self,
        claimant: &Claimant,
        session_id: Uuid,
        code: &str,
    ) -> Result<checkout_session::Model, ServiceError> {
        let now = Utc::now();
        let session = self
            .load_mutable(claimant, session_id, "apply a coupon")
            .await?;
        if session.is_locked() {
            return Err(payment_started(&session, "apply a coupon"));
        }

        let txn = self.db.begin().await?;
        let coupon = self.coupons.find_by_code(&txn, code).await?;
        self.coupons
            .ensure_usable(&txn, &coupon, claimant, session.id, now)
            .await?;

        let lines: Vec<PricedLine> = session.items.0.iter().map(PricedLine::from).collect();
        let allocation = calculate_discount(&coupon, &lines)?;

        self.coupons
            .record_application(&txn, &coupon, claimant, session.id, session.expires_at)
            .await?;

        let mut active: checkout_session::ActiveModel = session.clone().into();
        active.applied_coupon = Set(Some(allocation.to_applied(&coupon, now)));
        active.validated_at = Set(None);
        let updated = save_versioned(&txn, &session, active).await?;
        txn.commit().await?;

        info!(session_id = %updated.id, code = %coupon.code, discount = %allocation.total_discount, "Coupon applied");
        Ok(updated)
    }

    #[instrument(skip(self), fields(claimant = %claimant))]
    pub async fn remove_coupon(
        &self,
        claimant: &Claimant,
        session_id: Uuid,
    ) -> Result<CouponOutcome, ServiceError> {
        let (session, removed) = self
            .retry_on_conflict(|| self.try_remove_coupon(claimant, session_id))
            .await?;

        if let Some(code) = removed {
            self.event_sender
                .send_or_log(Event::CouponRemoved { session_id, code });
        }
        Ok(CouponOutcome::from_session(&session, &self.config.currency))
    }

    async fn try_remove_coupon(
        &self,
        claimant: &Claimant,
        session_id: Uuid,
    ) -> Result<(checkout_session::Model, Option<String>), ServiceError> {
        let session = self
            .load_mutable(claimant, session_id, "remove a coupon")
            .await?;
        if session.is_locked() {
            return Err(payment_started(&session, "remove a coupon"));
        }
        let Some(applied) = session.applied_coupon.clone() else {
            return Ok((session, None));
        };

        let txn = self.db.begin().await?;
        self.coupons.drop_applications(&txn, session.id).await?;
        let mut active: checkout_session::ActiveModel = session.clone().into();
        active.applied_coupon = Set(None);
        active.validated_at = Set(None);
        let updated = save_versioned(&txn, &session, active).await?;
        txn.commit().await?;

        Ok((updated, Some(applied.code)))
    }

    /// Re-prices every line, re-validates the coupon and records the address.
    ///
    /// Drift beyond the configured epsilon is corrected in place and reported as a
    /// non-blocking notice; only unavailable items block payment.
    #[instrument(skip(self, address), fields(claimant = %claimant))]
    pub async fn validate_for_payment(
        &self,
        claimant: &Claimant,
        session_id: Uuid,
        address: ShippingAddress,
    ) -> Result<PaymentValidation, ServiceError> {
        address.validate()?;
        let validation = self
            .retry_on_conflict(|| self.try_validate_for_payment(claimant, session_id, &address))
            .await?;

        counter!(
            "checkout_sessions.validated",
            1,
            "outcome" => if validation.has_errors { "blocked" } else { "ok" }
        );
        Ok(validation)
    }

    async fn try_validate_for_payment(
        &self,
        claimant: &Claimant,
        session_id: Uuid,
        address: &ShippingAddress,
    ) -> Result<PaymentValidation, ServiceError> {
        let now = Utc::now();
        let epsilon = self.config.price_epsilon;
        let currency = self.config.currency.as_str();
        let session = self
            .load_mutable(claimant, session_id, "validate for payment")
            .await?;
        if session.is_locked() {
            return Err(payment_started(&session, "validate for payment"));
        }

        let txn = self.db.begin().await?;
        let mut issues = Vec::new();
        let mut items = session.items.0.clone();

        for item in items.iter_mut() {
            let key = item.key();
            match find_variant(&txn, &key).await? {
                Some(variant) if variant.is_active => {
                    if (variant.price - item.price).abs() > epsilon {
                        issues.push(
                            ValidationIssue::notice(
                                "PRICE_CHANGED",
                                format!(
                                    "Price of {} (size {}) changed from {} to {}",
                                    item.name,
                                    item.size,
                                    round_money(item.price),
                                    round_money(variant.price)
                                ),
                            )
                            .for_line(&key),
                        );
                        item.price = variant.price;
                    }
                    item.catalog_price = variant.catalog_price;
                    item.category = variant.category;
                }
                _ => issues.push(
                    ValidationIssue::blocking(
                        "ITEM_UNAVAILABLE",
                        format!("{} (size {}) is no longer available", item.name, item.size),
                    )
                    .for_line(&key),
                ),
            }
        }

        let applied = match &session.applied_coupon {
            None => None,
            Some(previous) => {
                let lines: Vec<PricedLine> = items.iter().map(PricedLine::from).collect();
                let revalidated = async {
                    let coupon = self.coupons.find_by_id(&txn, previous.coupon_id).await?;
                    self.coupons
                        .ensure_usable(&txn, &coupon, claimant, session.id, now)
                        .await?;
                    let allocation = calculate_discount(&coupon, &lines)?;
                    Ok::<_, ServiceError>(allocation.to_applied(&coupon, previous.applied_at))
                }
                .await;

                match revalidated {
                    Ok(fresh) => {
                        let drift = (fresh.total_discount - previous.total_discount).abs()
                            + (fresh.shipping_discount - previous.shipping_discount).abs();
                        if drift > epsilon {
                            issues.push(ValidationIssue::notice(
                                "DISCOUNT_CHANGED",
                                format!(
                                    "Discount for {} changed from {} to {}",
                                    fresh.code, previous.total_discount, fresh.total_discount
                                ),
                            ));
                        }
                        Some(fresh)
                    }
                    Err(ServiceError::CouponRejected(rejection)) => {
                        self.coupons.drop_applications(&txn, session.id).await?;
                        issues.push(ValidationIssue::notice(
                            rejection.code(),
                            format!("Coupon {} was removed: {}", previous.code, rejection),
                        ));
                        None
                    }
                    Err(other) => return Err(other),
                }
            }
        };

        let totals = CartTotals::compute(&items, applied.as_ref(), currency);
        let has_errors = issues.iter().any(|issue| issue.blocking);

        let mut active: checkout_session::ActiveModel = session.clone().into();
        active.items = Set(SessionItems(items));
        active.applied_coupon = Set(applied);
        active.validated_address = Set(Some(address.clone()));
        active.validated_at = Set(if has_errors { None } else { Some(now) });
        let updated = save_versioned(&txn, &session, active).await?;
        txn.commit().await?;

        if !issues.is_empty() {
            info!(session_id = %updated.id, issues = issues.len(), has_errors, "Session corrected during payment validation");
        }

        Ok(PaymentValidation {
            has_errors,
            errors: issues,
            totals,
            session: SessionView::new(&updated, currency),
        })
    }

    /// Freezes totals, creates the gateway order and stretches the session and its
    /// reservations to the payment window. Calling it again returns the same order.
    #[instrument(skip(self), fields(claimant = %claimant))]
    pub async fn open_payment_window(
        &self,
        claimant: &Claimant,
        session_id: Uuid,
    ) -> Result<PaymentWindow, ServiceError> {
        let now = Utc::now();
        let session = self
            .load_mutable(claimant, session_id, "start payment")
            .await?;
        if let Some(window) = PaymentWindow::from_session(&session) {
            return Ok(window);
        }
        if session.validated_at.is_none() {
            return Err(SessionStateError::InvalidState {
                session_id: session.id,
                status: "unvalidated".into(),
                action: "start payment",
            }
            .into());
        }

        let totals = CartTotals::of(&session, &self.config.currency);
        let amount = to_minor_units(totals.total)
            .filter(|minor| *minor > 0)
            .ok_or_else(|| ServiceError::InvalidOperation("Order total must be positive".into()))?;

        let gateway_order = self
            .gateway
            .create_order(CreateGatewayOrder {
                amount,
                currency: totals.currency.clone(),
                receipt: session.id.to_string(),
                notes: HashMap::from([("session_id".to_string(), session.id.to_string())]),
            })
            .await?;

        let expires_at = now + self.config.payment_window();
        let locked = LockedTotals {
            subtotal: totals.subtotal,
            discount_total: totals.discount_total,
            shipping_discount: totals.shipping_discount,
            total: totals.total,
            currency: totals.currency.clone(),
            locked_at: now,
        };

        let txn = self.db.begin().await?;
        let mut active: checkout_session::ActiveModel = session.clone().into();
        active.locked_total = Set(Some(totals.total));
        active.locked_totals = Set(Some(locked));
        active.razorpay_order_id = Set(Some(gateway_order.id.clone()));
        active.expires_at = Set(expires_at);

        let updated = match save_versioned(&txn, &session, active).await {
            Ok(updated) => updated,
            Err(err) if err.is_concurrent_modification() => {
                drop(txn);
                // Another request may have opened the window first; hand back its order.
                let current = self.find_owned(&*self.db, claimant, session_id).await?;
                warn!(%session_id, orphaned_order = %gateway_order.id, "Payment window raced; keeping the first order");
                return PaymentWindow::from_session(&current).ok_or(err);
            }
            Err(err) => return Err(err),
        };
        self.reservations
            .extend_session_reservations(&txn, session_id, expires_at)
            .await?;
        self.coupons
            .extend_applications(&txn, session_id, expires_at)
            .await?;
        txn.commit().await?;

        info!(%session_id, razorpay_order_id = %gateway_order.id, amount, "Payment window opened");
        self.event_sender.send_or_log(Event::PaymentWindowOpened {
            session_id,
            razorpay_order_id: gateway_order.id.clone(),
            locked_total: totals.total,
        });

        PaymentWindow::from_session(&updated)
            .ok_or_else(|| ServiceError::InternalError("Locked session lost its totals".into()))
    }

    /// Shopper-initiated cancel. Cancelling an already cancelled session is a no-op.
    #[instrument(skip(self), fields(claimant = %claimant))]
    pub async fn cancel_session(
        &self,
        claimant: &Claimant,
        session_id: Uuid,
    ) -> Result<checkout_session::Model, ServiceError> {
        let session = self.get_session(claimant, session_id).await?;
        match session.status {
            CheckoutStatus::Cancelled => return Ok(session),
            CheckoutStatus::Active => {}
            CheckoutStatus::Expired => return Err(SessionStateError::Expired(session.id).into()),
            other => {
                return Err(SessionStateError::InvalidState {
                    session_id: session.id,
                    status: other.as_str().to_string(),
                    action: "cancel",
                }
                .into())
            }
        }

        let txn = self.db.begin().await?;
        let result = transition(session.id, CheckoutStatus::Active, CheckoutStatus::Cancelled)
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(session.id));
        }
        let released = self
            .reservations
            .release_session_reservations(&txn, session.id, ReservationStatus::Cancelled)
            .await?;
        self.coupons.drop_applications(&txn, session.id).await?;
        txn.commit().await?;

        info!(%session_id, released, "Checkout session cancelled");
        self.event_sender
            .send_or_log(Event::CheckoutCancelled(session_id));
        self.event_sender.send_or_log(Event::ReservationsReleased {
            session_id,
            status: ReservationStatus::Cancelled.as_str().to_string(),
            count: released,
        });

        self.find_owned(&*self.db, claimant, session_id).await
    }

    /// Moves an active session past its deadline to `expired` and frees its stock.
    /// Returns `false` when the session was not due or already left `active`.
    pub async fn expire_session(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let txn = self.db.begin().await?;
        let result = transition(session_id, CheckoutStatus::Active, CheckoutStatus::Expired)
            .filter(checkout_session::Column::ExpiresAt.lte(now))
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            return Ok(false);
        }

        let released = self
            .reservations
            .release_session_reservations(&txn, session_id, ReservationStatus::Expired)
            .await?;
        self.coupons.drop_applications(&txn, session_id).await?;
        txn.commit().await?;

        counter!("checkout_sessions.expired", 1);
        info!(%session_id, released, "Checkout session expired");
        self.event_sender
            .send_or_log(Event::CheckoutExpired(session_id));
        self.event_sender.send_or_log(Event::ReservationsReleased {
            session_id,
            status: ReservationStatus::Expired.as_str().to_string(),
            count: released,
        });
        Ok(true)
    }
}
