//! Periodic cleanup of abandoned checkouts.
//!
//! Each pass hands abandoned `processing` claims back to `active`, expires active
//! sessions past their deadline, retires stale reservation rows and purges coupon
//! applications that never turned into a redemption. A session
//! that a payment claims between the scan and the expiry is left alone: expiry is a
//! conditional `active -> expired` transition.

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QuerySelect};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::CheckoutConfig;
use crate::entities::commerce::checkout_session::{self, CheckoutStatus};
use crate::errors::ServiceError;
use crate::services::commerce::checkout_service::{transition, CheckoutService};
use crate::services::commerce::coupon_service::CouponService;
use crate::services::inventory_reservation_service::ReservationStore;

/// Counts from one sweeper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub claims_released: u64,
    pub sessions_expired: u64,
    pub reservations_expired: u64,
    pub reservations_deleted: u64,
    pub coupon_usages_purged: u64,
}

#[derive(Clone)]
pub struct ExpirySweeper {
    db: Arc<DatabaseConnection>,
    checkout: Arc<CheckoutService>,
    reservations: ReservationStore,
    coupons: CouponService,
    config: CheckoutConfig,
}

impl ExpirySweeper {
    pub fn new(
        db: Arc<DatabaseConnection>,
        checkout: Arc<CheckoutService>,
        config: CheckoutConfig,
    ) -> Self {
        Self {
            db,
            checkout,
            reservations: ReservationStore::new(),
            coupons: CouponService::new(),
            config,
        }
    }

    /// Runs one full pass. A session that fails to expire is logged and retried on
    /// the next pass; the remaining steps still run.
    #[instrument(skip(self))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport, ServiceError> {
        let started = Instant::now();
        let mut report = SweepReport::default();

        report.claims_released = self.release_stale_claims(now).await?;

        let due: Vec<Uuid> = checkout_session::Entity::find()
            .select_only()
            .column(checkout_session::Column::Id)
            .filter(checkout_session::Column::Status.eq(CheckoutStatus::Active))
            .filter(checkout_session::Column::ExpiresAt.lte(now))
            .into_tuple()
            .all(&*self.db)
            .await?;

        for session_id in due {
            match self.checkout.expire_session(session_id, now).await {
                Ok(true) => report.sessions_expired += 1,
                Ok(false) => debug!(%session_id, "Session left active before it could expire"),
                Err(e) => {
                    counter!("checkout_sweeper.errors", 1, "step" => "expire_session");
                    warn!(%session_id, error = %e, "Failed to expire session");
                }
            }
        }

        let cleanup = self
            .reservations
            .clean_expired_reservations(&*self.db, now, self.config.reservation_retention())
            .await?;
        report.reservations_expired = cleanup.expired;
        report.reservations_deleted = cleanup.deleted;

        report.coupon_usages_purged = self.coupons.purge_stale_applications(&*self.db, now).await?;

        counter!("checkout_sweeper.claims_released", report.claims_released);
        counter!("checkout_sweeper.sessions_expired", report.sessions_expired);
        counter!("checkout_sweeper.reservations_expired", report.reservations_expired);
        counter!("checkout_sweeper.reservations_deleted", report.reservations_deleted);
        counter!("checkout_sweeper.coupon_usages_purged", report.coupon_usages_purged);
        histogram!("checkout_sweeper.pass_seconds", started.elapsed().as_secs_f64());

        if report != SweepReport::default() {
            info!(?report, "Sweeper pass finished");
        }
        Ok(report)
    }

    /// A claim whose worker died between claiming and creating the order would hold the
    /// session in `processing` forever. Old claims go back to `active`, where a later
    /// payment trigger can retry them or the expiry step below retires them.
    async fn release_stale_claims(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let cutoff = now - self.config.stale_claim_after();
        let stale: Vec<Uuid> = checkout_session::Entity::find()
            .select_only()
            .column(checkout_session::Column::Id)
            .filter(checkout_session::Column::Status.eq(CheckoutStatus::Processing))
            .filter(checkout_session::Column::UpdatedAt.lte(cutoff))
            .into_tuple()
            .all(&*self.db)
            .await?;

        let mut released = 0;
        for session_id in stale {
            let result = transition(session_id, CheckoutStatus::Processing, CheckoutStatus::Active)
                .filter(checkout_session::Column::UpdatedAt.lte(cutoff))
                .exec(&*self.db)
                .await?;
            if result.rows_affected == 1 {
                warn!(%session_id, "Released stale payment claim");
                released += 1;
            }
        }
        Ok(released)
    }

    /// Runs [`Self::run_once`] on the configured interval until `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.sweeper_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval = ?self.config.sweeper_interval(), "Expiry sweeper started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.run_once(Utc::now()).await {
                            counter!("checkout_sweeper.errors", 1, "step" => "pass");
                            error!(error = %e, "Sweeper pass failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Expiry sweeper stopped");
        })
    }
}
