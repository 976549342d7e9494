//! Checkout session lifecycle: creation, coupons, validation, payment window and exits.

mod common;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use checkout_engine::entities::commerce::checkout_session::{self, CheckoutStatus};
use checkout_engine::entities::commerce::coupon::CouponType;
use checkout_engine::entities::commerce::product_variant;
use checkout_engine::entities::inventory_reservation::ReservationStatus;
use checkout_engine::errors::{CouponRejection, ServiceError, SessionStateError};
use checkout_engine::services::commerce::CreateSessionInput;
use checkout_engine::services::inventory_reservation_service::ReservationStore;
use common::{address, cart_input, guest, TestApp};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::json;

fn buy_now(variant: &product_variant::Model, qty: i32) -> CreateSessionInput {
    serde_json::from_value(json!({
        "type": "buy_now",
        "productId": variant.product_id,
        "size": variant.size,
        "qty": qty,
    }))
    .unwrap()
}

async fn backdate(app: &TestApp, session: checkout_session::Model) {
    let mut active: checkout_session::ActiveModel = session.into();
    active.expires_at = Set(Utc::now() - Duration::seconds(5));
    active.update(&*app.db).await.unwrap();
}

#[tokio::test]
async fn buy_now_reserves_stock_for_the_session() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(dec!(499.00), 5).await;
    let claimant = guest("g-buy-now");

    let session = app
        .services
        .checkout
        .create_session(&claimant, buy_now(&variant, 2))
        .await
        .unwrap();

    assert_eq!(session.status, CheckoutStatus::Active);
    assert!(session.has_active_reservations);
    assert_eq!(session.items.0.len(), 1);
    assert_eq!(session.items.0[0].qty, 2);
    assert_eq!(session.items.0[0].price, dec!(499.00));
    assert_eq!(session.guest_tracking_id.as_deref(), Some("g-buy-now"));
    assert!(session.expires_at > Utc::now());

    let holds = ReservationStore::new()
        .find_for_session(&*app.db, session.id)
        .await
        .unwrap();
    assert_eq!(holds.len(), 1);
    assert_eq!(holds[0].reserved_qty, 2);
    assert_eq!(holds[0].status, ReservationStatus::Active);
}

#[tokio::test]
async fn cart_checkout_fails_whole_when_one_line_is_short() {
    let app = TestApp::new().await;
    let tee = app.seed_variant(dec!(499.00), 5).await;
    let cap = app.seed_variant(dec!(299.00), 1).await;
    let claimant = guest("g-short");

    let err = app
        .services
        .checkout
        .create_session(&claimant, cart_input(&[(&tee, 1), (&cap, 3)]))
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::StockValidation(ref lines) if lines.len() == 1 && lines[0].available == 1);
    let sessions = checkout_session::Entity::find().all(&*app.db).await.unwrap();
    assert!(sessions.is_empty());
}

#[tokio::test]
async fn new_session_supersedes_the_previous_one() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(dec!(499.00), 3).await;
    let claimant = guest("g-twice");
    let checkout = &app.services.checkout;

    let first = checkout
        .create_session(&claimant, buy_now(&variant, 2))
        .await
        .unwrap();
    // Only one unit would be free if the first hold survived.
    let second = checkout
        .create_session(&claimant, buy_now(&variant, 3))
        .await
        .unwrap();

    let first = checkout.get_session(&claimant, first.id).await.unwrap();
    assert_eq!(first.status, CheckoutStatus::Cancelled);
    assert!(!first.has_active_reservations);
    assert_eq!(second.status, CheckoutStatus::Active);

    let released = ReservationStore::new()
        .find_for_session(&*app.db, first.id)
        .await
        .unwrap();
    assert!(released.iter().all(|r| r.status == ReservationStatus::Cancelled));
}

#[tokio::test]
async fn sessions_are_scoped_to_their_claimant() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(dec!(499.00), 3).await;
    let owner = guest("g-owner");

    let session = app
        .services
        .checkout
        .create_session(&owner, buy_now(&variant, 1))
        .await
        .unwrap();

    let err = app
        .services
        .checkout
        .get_session(&guest("g-stranger"), session.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::SessionState(SessionStateError::NotFound(_)));
}

#[tokio::test]
async fn coupon_below_minimum_order_leaves_session_untouched() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(dec!(400.00), 5).await;
    app.seed_coupon_with("BIGSPEND", CouponType::Fixed, dec!(50), |c| {
        c.min_order_value = Set(dec!(500))
    })
    .await;
    let claimant = guest("g-min-order");
    let checkout = &app.services.checkout;

    let session = checkout
        .create_session(&claimant, buy_now(&variant, 1))
        .await
        .unwrap();
    let err = checkout
        .apply_coupon(&claimant, session.id, "bigspend")
        .await
        .unwrap_err();

    assert_matches!(
        err,
        ServiceError::CouponRejected(CouponRejection::MinOrderNotMet { min_order_value, cart_subtotal })
            if min_order_value == dec!(500) && cart_subtotal == dec!(400)
    );
    assert_eq!(err.code(), Some("MIN_ORDER_NOT_MET"));

    let reread = checkout.get_session(&claimant, session.id).await.unwrap();
    assert!(reread.applied_coupon.is_none());
    assert_eq!(reread.version, session.version);
}

#[tokio::test]
async fn apply_and_remove_coupon_update_totals() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(dec!(499.00), 5).await;
    app.seed_coupon("TENOFF", CouponType::Percentage, dec!(10)).await;
    let claimant = guest("g-coupon");
    let checkout = &app.services.checkout;

    let session = checkout
        .create_session(&claimant, buy_now(&variant, 2))
        .await
        .unwrap();

    let applied = checkout
        .apply_coupon(&claimant, session.id, " tenoff ")
        .await
        .unwrap();
    let summary = applied.coupon.as_ref().unwrap();
    assert_eq!(summary.code, "TENOFF");
    assert_eq!(applied.discount.total_discount, dec!(99.80));
    assert_eq!(applied.cart_totals.subtotal, dec!(998.00));
    assert_eq!(applied.cart_totals.total, dec!(898.20));
    assert_eq!(applied.discount.item_discounts.len(), 1);

    let removed = checkout.remove_coupon(&claimant, session.id).await.unwrap();
    assert!(removed.coupon.is_none());
    assert_eq!(removed.discount.total_discount, Decimal::ZERO);
    assert_eq!(removed.cart_totals.total, dec!(998.00));

    let again = checkout.remove_coupon(&claimant, session.id).await.unwrap();
    assert!(again.coupon.is_none());
}

#[tokio::test]
async fn unknown_coupon_is_rejected() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(dec!(499.00), 5).await;
    let claimant = guest("g-unknown");

    let session = app
        .services
        .checkout
        .create_session(&claimant, buy_now(&variant, 1))
        .await
        .unwrap();
    let err = app
        .services
        .checkout
        .apply_coupon(&claimant, session.id, "NOPE")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::CouponRejected(CouponRejection::InvalidCoupon));
}

#[tokio::test]
async fn validation_corrects_price_drift_with_a_notice() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(dec!(499.00), 5).await;
    let claimant = guest("g-drift");
    let checkout = &app.services.checkout;

    let session = checkout
        .create_session(&claimant, buy_now(&variant, 1))
        .await
        .unwrap();

    let mut repriced: product_variant::ActiveModel = variant.clone().into();
    repriced.price = Set(dec!(549.00));
    repriced.catalog_price = Set(dec!(549.00));
    repriced.update(&*app.db).await.unwrap();

    let validation = checkout
        .validate_for_payment(&claimant, session.id, address())
        .await
        .unwrap();

    assert!(!validation.has_errors);
    assert_eq!(validation.errors.len(), 1);
    assert_eq!(validation.errors[0].code, "PRICE_CHANGED");
    assert!(!validation.errors[0].blocking);
    assert_eq!(validation.totals.subtotal, dec!(549.00));
    assert_eq!(validation.session.items[0].price, dec!(549.00));
    assert!(validation.session.validated_at.is_some());
}

#[tokio::test]
async fn unavailable_item_blocks_payment() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(dec!(499.00), 5).await;
    let claimant = guest("g-retired");
    let checkout = &app.services.checkout;

    let session = checkout
        .create_session(&claimant, buy_now(&variant, 1))
        .await
        .unwrap();

    let mut retired: product_variant::ActiveModel = variant.clone().into();
    retired.is_active = Set(false);
    retired.update(&*app.db).await.unwrap();

    let validation = checkout
        .validate_for_payment(&claimant, session.id, address())
        .await
        .unwrap();
    assert!(validation.has_errors);
    assert_eq!(validation.errors[0].code, "ITEM_UNAVAILABLE");
    assert!(validation.errors[0].blocking);

    let err = checkout
        .open_payment_window(&claimant, session.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::SessionState(SessionStateError::InvalidState { .. }));
    assert!(app.gateway.created_orders().is_empty());
}

#[tokio::test]
async fn payment_window_requires_validation() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(dec!(499.00), 5).await;
    let claimant = guest("g-unvalidated");

    let session = app
        .services
        .checkout
        .create_session(&claimant, buy_now(&variant, 1))
        .await
        .unwrap();
    let err = app
        .services
        .checkout
        .open_payment_window(&claimant, session.id)
        .await
        .unwrap_err();

    assert_matches!(
        err,
        ServiceError::SessionState(SessionStateError::InvalidState { ref status, .. }) if status == "unvalidated"
    );
}

#[tokio::test]
async fn payment_window_is_idempotent_and_locks_the_session() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(dec!(499.00), 5).await;
    app.seed_coupon("TENOFF", CouponType::Percentage, dec!(10)).await;
    let claimant = guest("g-window");
    let checkout = &app.services.checkout;

    let window = app.session_in_payment(&claimant, &[(&variant, 2)]).await;
    assert_eq!(window.amount, 99_800);
    assert_eq!(window.currency, "INR");
    assert_eq!(window.locked_totals.total, dec!(998.00));
    assert!(window.expires_at > Utc::now() + Duration::minutes(20));

    let again = checkout
        .open_payment_window(&claimant, window.session_id)
        .await
        .unwrap();
    assert_eq!(again.razorpay_order_id, window.razorpay_order_id);
    assert_eq!(app.gateway.created_orders().len(), 1);
    assert_eq!(app.gateway.created_orders()[0].amount, 99_800);

    let holds = ReservationStore::new()
        .find_for_session(&*app.db, window.session_id)
        .await
        .unwrap();
    assert!(holds.iter().all(|r| r.expires_at > Utc::now() + Duration::minutes(20)));

    let err = checkout
        .apply_coupon(&claimant, window.session_id, "TENOFF")
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::SessionState(SessionStateError::InvalidState { ref status, .. }) if status == "awaiting_payment"
    );
}

#[tokio::test]
async fn cancel_releases_holds_and_is_repeatable() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(dec!(499.00), 5).await;
    let claimant = guest("g-cancel");
    let checkout = &app.services.checkout;

    let session = checkout
        .create_session(&claimant, buy_now(&variant, 2))
        .await
        .unwrap();
    let cancelled = checkout.cancel_session(&claimant, session.id).await.unwrap();
    assert_eq!(cancelled.status, CheckoutStatus::Cancelled);

    let holds = ReservationStore::new()
        .find_for_session(&*app.db, session.id)
        .await
        .unwrap();
    assert!(holds.iter().all(|r| r.status == ReservationStatus::Cancelled));

    let repeat = checkout.cancel_session(&claimant, session.id).await.unwrap();
    assert_eq!(repeat.status, CheckoutStatus::Cancelled);

    let err = checkout
        .apply_coupon(&claimant, session.id, "ANY")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::SessionState(SessionStateError::InvalidState { .. }));
}

#[tokio::test]
async fn reading_an_overdue_session_expires_it() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(dec!(499.00), 5).await;
    let claimant = guest("g-late");
    let checkout = &app.services.checkout;

    let session = checkout
        .create_session(&claimant, buy_now(&variant, 1))
        .await
        .unwrap();
    backdate(&app, session.clone()).await;

    let reread = checkout.get_session(&claimant, session.id).await.unwrap();
    assert_eq!(reread.status, CheckoutStatus::Expired);
    assert!(!reread.has_active_reservations);

    let holds = ReservationStore::new()
        .find_for_session(&*app.db, session.id)
        .await
        .unwrap();
    assert!(holds.iter().all(|r| r.status == ReservationStatus::Expired));

    let err = checkout
        .validate_for_payment(&claimant, session.id, address())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::SessionState(SessionStateError::Expired(_)));
}

#[tokio::test]
async fn exhausted_coupon_is_rejected() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(dec!(499.00), 5).await;
    app.seed_coupon_with("LAUNCH", CouponType::Fixed, dec!(50), |c| {
        c.usage_limit = Set(Some(100));
        c.usage_count = Set(100);
    })
    .await;
    let claimant = guest("g-late-to-launch");
    let session = app
        .services
        .checkout
        .create_session(&claimant, buy_now(&variant, 1))
        .await
        .unwrap();

    let err = app
        .services
        .checkout
        .apply_coupon(&claimant, session.id, "LAUNCH")
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::CouponRejected(CouponRejection::UsageLimitExceeded)
    );
    assert_eq!(err.code(), Some("USAGE_LIMIT_EXCEEDED"));
}

#[tokio::test]
async fn per_claimant_limit_counts_redeemed_orders() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(dec!(499.00), 5).await;
    app.seed_coupon_with("ONCE", CouponType::Fixed, dec!(50), |c| {
        c.user_usage_limit = Set(Some(1));
    })
    .await;
    let claimant = guest("g-repeat-buyer");
    let checkout = &app.services.checkout;

    let first = checkout
        .create_session(&claimant, buy_now(&variant, 1))
        .await
        .unwrap();
    checkout
        .apply_coupon(&claimant, first.id, "ONCE")
        .await
        .unwrap();
    checkout
        .validate_for_payment(&claimant, first.id, address())
        .await
        .unwrap();
    let window = checkout
        .open_payment_window(&claimant, first.id)
        .await
        .unwrap();
    assert_eq!(window.amount, 44_900);
    app.gateway
        .pay(&window.razorpay_order_id, window.amount, "captured");
    app.services
        .reconciler
        .check_status(&window.razorpay_order_id, first.id, &claimant)
        .await
        .unwrap();

    let second = checkout
        .create_session(&claimant, buy_now(&variant, 1))
        .await
        .unwrap();
    let err = checkout
        .apply_coupon(&claimant, second.id, "ONCE")
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::CouponRejected(CouponRejection::UserUsageLimitExceeded)
    );

    // The limit is per claimant, not global.
    let someone_else = guest("g-first-timer");
    let theirs = checkout
        .create_session(&someone_else, buy_now(&variant, 1))
        .await
        .unwrap();
    checkout
        .apply_coupon(&someone_else, theirs.id, "ONCE")
        .await
        .unwrap();
}

#[tokio::test]
async fn reapplying_a_limited_coupon_is_not_a_second_use() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(dec!(499.00), 5).await;
    app.seed_coupon_with("ONCE", CouponType::Fixed, dec!(50), |c| {
        c.user_usage_limit = Set(Some(1));
    })
    .await;
    let claimant = guest("g-indecisive");
    let checkout = &app.services.checkout;

    let session = checkout
        .create_session(&claimant, buy_now(&variant, 1))
        .await
        .unwrap();
    checkout
        .apply_coupon(&claimant, session.id, "ONCE")
        .await
        .unwrap();
    checkout
        .apply_coupon(&claimant, session.id, "ONCE")
        .await
        .unwrap();

    // Starting over cancels the old session and frees its application.
    let restarted = checkout
        .create_session(&claimant, buy_now(&variant, 1))
        .await
        .unwrap();
    let outcome = checkout
        .apply_coupon(&claimant, restarted.id, "ONCE")
        .await
        .unwrap();
    assert_eq!(outcome.discount.total_discount, dec!(50));
}
