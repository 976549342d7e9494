//! Expiry sweeper passes over abandoned sessions, holds and coupon applications.

mod common;

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use checkout_engine::config::CheckoutConfig;
use checkout_engine::entities::commerce::checkout_session::{self, CheckoutStatus, SessionType};
use checkout_engine::entities::commerce::coupon::CouponType;
use checkout_engine::entities::commerce::coupon_usage::{self, CouponUsageStatus};
use checkout_engine::entities::inventory_reservation::ReservationStatus;
use checkout_engine::services::expiry_sweeper::SweepReport;
use checkout_engine::services::inventory_reservation_service::{
    ReservationOwner, ReservationRequest, ReservationStore,
};
use common::{cart_input, guest, TestApp};
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, EntityTrait, PaginatorTrait, Set};
use tokio::sync::watch;
use uuid::Uuid;

async fn session_for(
    app: &TestApp,
    tracking: &str,
    variant: &checkout_engine::entities::commerce::product_variant::Model,
) -> checkout_session::Model {
    app.services
        .checkout
        .create_session(&guest(tracking), cart_input(&[(variant, 1)]))
        .await
        .unwrap()
}

async fn backdate(app: &TestApp, session: &checkout_session::Model) {
    let mut overdue: checkout_session::ActiveModel = session.clone().into();
    overdue.expires_at = Set(Utc::now() - Duration::seconds(5));
    overdue.update(&*app.db).await.unwrap();
}

async fn status_of(app: &TestApp, session_id: Uuid) -> CheckoutStatus {
    checkout_session::Entity::find_by_id(session_id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap()
        .status
}

#[tokio::test]
async fn pass_expires_overdue_sessions_and_cleans_up() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(dec!(499.00), 10).await;
    let coupon = app.seed_coupon("WELCOME", CouponType::Fixed, dec!(50)).await;
    let store = ReservationStore::new();

    let overdue = session_for(&app, "g-overdue", &variant).await;
    backdate(&app, &overdue).await;
    let live = session_for(&app, "g-live", &variant).await;

    // A hold whose session row never made it
    let orphan = ReservationOwner {
        session_id: Uuid::new_v4(),
        session_type: SessionType::BuyNow,
        claimant: guest("g-orphan"),
        expires_at: Utc::now() - Duration::minutes(1),
    };
    store
        .create_reservation(&*app.db, &orphan, ReservationRequest { key: variant.key(), qty: 1 })
        .await
        .unwrap();

    // An application left behind by a session that ended elsewhere
    coupon_usage::ActiveModel {
        id: Set(Uuid::new_v4()),
        coupon_id: Set(coupon.id),
        code: Set(coupon.code.clone()),
        owner_id: Set(None),
        guest_tracking_id: Set(Some("g-stale".into())),
        session_id: Set(Uuid::new_v4()),
        status: Set(CouponUsageStatus::Applied),
        order_id: Set(None),
        expires_at: Set(Some(Utc::now() - Duration::minutes(1))),
        created_at: Set(Utc::now() - Duration::minutes(10)),
        used_at: Set(None),
    }
    .insert(&*app.db)
    .await
    .unwrap();

    let sweeper = app.sweeper();
    let report = sweeper.run_once(Utc::now()).await.unwrap();

    assert_eq!(
        report,
        SweepReport {
            claims_released: 0,
            sessions_expired: 1,
            reservations_expired: 1,
            reservations_deleted: 0,
            coupon_usages_purged: 1,
        }
    );
    assert_eq!(status_of(&app, overdue.id).await, CheckoutStatus::Expired);
    assert_eq!(status_of(&app, live.id).await, CheckoutStatus::Active);

    let released = store.find_for_session(&*app.db, overdue.id).await.unwrap();
    assert!(released.iter().all(|r| r.status == ReservationStatus::Expired));
    let held = store.find_for_session(&*app.db, live.id).await.unwrap();
    assert!(held.iter().all(|r| r.status == ReservationStatus::Active));
    assert_eq!(coupon_usage::Entity::find().count(&*app.db).await.unwrap(), 0);

    let second = sweeper.run_once(Utc::now()).await.unwrap();
    assert_eq!(second, SweepReport::default());
}

#[tokio::test]
async fn sessions_in_payment_are_not_expired_early() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(dec!(499.00), 10).await;
    let window = app.session_in_payment(&guest("g-paying"), &[(&variant, 1)]).await;

    // Past the short session TTL, still inside the payment window
    let report = app
        .sweeper()
        .run_once(Utc::now() + Duration::minutes(10))
        .await
        .unwrap();

    assert_eq!(report.sessions_expired, 0);
    assert_eq!(status_of(&app, window.session_id).await, CheckoutStatus::Active);
}

#[tokio::test]
async fn abandoned_payment_claim_is_released_for_retry() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(dec!(499.00), 10).await;
    let claimant = guest("g-crashed-worker");
    let window = app.session_in_payment(&claimant, &[(&variant, 1)]).await;

    // A worker claimed the session and died before writing the order.
    let session = checkout_session::Entity::find_by_id(window.session_id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    let mut claimed: checkout_session::ActiveModel = session.into();
    claimed.status = Set(CheckoutStatus::Processing);
    claimed.updated_at = Set(Utc::now());
    claimed.update(&*app.db).await.unwrap();

    let sweeper = app.sweeper();
    let fresh = sweeper.run_once(Utc::now()).await.unwrap();
    assert_eq!(fresh.claims_released, 0);
    assert_eq!(status_of(&app, window.session_id).await, CheckoutStatus::Processing);

    let later = Utc::now() + Duration::minutes(app.config.checkout.stale_claim_minutes + 1);
    let report = sweeper.run_once(later).await.unwrap();
    assert_eq!(report.claims_released, 1);
    assert_eq!(report.sessions_expired, 0);
    assert_eq!(status_of(&app, window.session_id).await, CheckoutStatus::Active);

    app.gateway.pay(&window.razorpay_order_id, window.amount, "captured");
    let reconciled = app
        .services
        .reconciler
        .check_status(&window.razorpay_order_id, window.session_id, &claimant)
        .await
        .unwrap();
    assert!(reconciled.created);
    assert_eq!(status_of(&app, window.session_id).await, CheckoutStatus::Completed);
}

#[tokio::test]
async fn spawned_sweeper_runs_until_shutdown() {
    let app = TestApp::with_checkout_config(CheckoutConfig {
        sweeper_interval_secs: 1,
        ..CheckoutConfig::default()
    })
    .await;
    let variant = app.seed_variant(dec!(499.00), 10).await;
    let overdue = session_for(&app, "g-background", &variant).await;
    backdate(&app, &overdue).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = app.sweeper().spawn(shutdown_rx);

    let mut expired = false;
    for _ in 0..100 {
        if status_of(&app, overdue.id).await == CheckoutStatus::Expired {
            expired = true;
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }
    assert!(expired, "sweeper never expired the session");

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(StdDuration::from_secs(5), handle)
        .await
        .expect("sweeper did not stop")
        .unwrap();
}
