use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait,
    PaginatorTrait, QueryFilter, Set,
};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::common::Claimant;
use crate::entities::commerce::coupon::{self, normalize_code};
use crate::entities::commerce::coupon_usage::{self, CouponUsageStatus};
use crate::errors::{CouponRejection, ServiceError};
use crate::services::commerce::discount_engine::ensure_redeemable;

/// Coupon lookup, usage-limit checks and the usage ledger.
///
/// Limit checks read then compare; two shoppers redeeming the last use at the same
/// moment can both pass. `usage_count` itself is only ever moved by a single
/// arithmetic update when an order is created.
#[derive(Clone, Default)]
pub struct CouponService;

impl CouponService {
    pub fn new() -> Self {
        Self
    }

    pub async fn find_by_code<C: ConnectionTrait>(
        &self,
        conn: &C,
        code: &str,
    ) -> Result<coupon::Model, ServiceError> {
        let code = normalize_code(code);
        if code.is_empty() {
            return Err(CouponRejection::InvalidCoupon.into());
        }
        coupon::Entity::find()
            .filter(coupon::Column::Code.eq(code))
            .one(conn)
            .await?
            .ok_or_else(|| CouponRejection::InvalidCoupon.into())
    }

    pub async fn find_by_id<C: ConnectionTrait>(
        &self,
        conn: &C,
        coupon_id: Uuid,
    ) -> Result<coupon::Model, ServiceError> {
        coupon::Entity::find_by_id(coupon_id)
            .one(conn)
            .await?
            .ok_or_else(|| CouponRejection::InvalidCoupon.into())
    }

    /// Validity window plus global and per-claimant limits.
    ///
    /// The claimant's own live application in `session_id` does not count against
    /// them, so re-applying or re-validating the same coupon is allowed.
    #[instrument(skip(self, conn, coupon), fields(code = %coupon.code))]
    pub async fn ensure_usable<C: ConnectionTrait>(
        &self,
        conn: &C,
        coupon: &coupon::Model,
        claimant: &Claimant,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        ensure_redeemable(coupon, now)?;

        if let Some(limit) = coupon.usage_limit {
            if coupon.usage_count >= limit {
                return Err(CouponRejection::UsageLimitExceeded.into());
            }
        }

        if let Some(limit) = coupon.user_usage_limit {
            let live_elsewhere = Condition::all()
                .add(coupon_usage::Column::Status.eq(CouponUsageStatus::Applied))
                .add(coupon_usage::Column::SessionId.ne(session_id))
                .add(coupon_usage::Column::ExpiresAt.gt(now));
            let counted = Condition::any()
                .add(coupon_usage::Column::Status.eq(CouponUsageStatus::Used))
                .add(live_elsewhere);

            let uses = coupon_usage::Entity::find()
                .filter(coupon_usage::Column::CouponId.eq(coupon.id))
                .filter(claimant.condition(
                    coupon_usage::Column::OwnerId,
                    coupon_usage::Column::GuestTrackingId,
                ))
                .filter(counted)
                .count(conn)
                .await?;

            if uses >= limit.max(0) as u64 {
                debug!(%claimant, uses, limit, "Per-claimant coupon limit reached");
                return Err(CouponRejection::UserUsageLimitExceeded.into());
            }
        }

        Ok(())
    }

    /// Records (or refreshes) the claimant's application of `coupon` to the session.
    pub async fn record_application<C: ConnectionTrait>(
        &self,
        conn: &C,
        coupon: &coupon::Model,
        claimant: &Claimant,
        session_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<coupon_usage::Model, ServiceError> {
        // A session carries at most one coupon at a time.
        self.drop_applications(conn, session_id).await?;

        let usage = coupon_usage::ActiveModel {
            id: Set(Uuid::new_v4()),
            coupon_id: Set(coupon.id),
            code: Set(coupon.code.clone()),
            owner_id: Set(claimant.owner_id()),
            guest_tracking_id: Set(claimant.guest_tracking_id()),
            session_id: Set(session_id),
            status: Set(CouponUsageStatus::Applied),
            order_id: Set(None),
            expires_at: Set(Some(expires_at)),
            created_at: Set(Utc::now()),
            used_at: Set(None),
        };
        Ok(usage.insert(conn).await?)
    }

    /// Removes unredeemed applications for the session.
    pub async fn drop_applications<C: ConnectionTrait>(
        &self,
        conn: &C,
        session_id: Uuid,
    ) -> Result<u64, ServiceError> {
        let result = coupon_usage::Entity::delete_many()
            .filter(coupon_usage::Column::SessionId.eq(session_id))
            .filter(coupon_usage::Column::Status.eq(CouponUsageStatus::Applied))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }

    /// Keeps the session's application alive for as long as the session itself.
    pub async fn extend_applications<C: ConnectionTrait>(
        &self,
        conn: &C,
        session_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        let result = coupon_usage::Entity::update_many()
            .col_expr(coupon_usage::Column::ExpiresAt, Expr::value(Some(expires_at)))
            .filter(coupon_usage::Column::SessionId.eq(session_id))
            .filter(coupon_usage::Column::Status.eq(CouponUsageStatus::Applied))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }

    /// Redeems the session's application for `order_id` and bumps the global counter.
    ///
    /// A session that lost its application row (swept while in the payment window)
    /// still gets a `used` row so per-claimant limits stay accurate.
    #[instrument(skip(self, conn, claimant))]
    pub async fn mark_used<C: ConnectionTrait>(
        &self,
        conn: &C,
        coupon_id: Uuid,
        code: &str,
        claimant: &Claimant,
        session_id: Uuid,
        order_id: Uuid,
    ) -> Result<(), ServiceError> {
        let now = Utc::now();
        let updated = coupon_usage::Entity::update_many()
            .col_expr(
                coupon_usage::Column::Status,
                Expr::value(CouponUsageStatus::Used),
            )
            .col_expr(coupon_usage::Column::OrderId, Expr::value(Some(order_id)))
            .col_expr(coupon_usage::Column::UsedAt, Expr::value(Some(now)))
            .col_expr(
                coupon_usage::Column::ExpiresAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .filter(coupon_usage::Column::SessionId.eq(session_id))
            .filter(coupon_usage::Column::CouponId.eq(coupon_id))
            .filter(coupon_usage::Column::Status.eq(CouponUsageStatus::Applied))
            .exec(conn)
            .await?
            .rows_affected;

        if updated == 0 {
            coupon_usage::ActiveModel {
                id: Set(Uuid::new_v4()),
                coupon_id: Set(coupon_id),
                code: Set(code.to_string()),
                owner_id: Set(claimant.owner_id()),
                guest_tracking_id: Set(claimant.guest_tracking_id()),
                session_id: Set(session_id),
                status: Set(CouponUsageStatus::Used),
                order_id: Set(Some(order_id)),
                expires_at: Set(None),
                created_at: Set(now),
                used_at: Set(Some(now)),
            }
            .insert(conn)
            .await?;
        }

        coupon::Entity::update_many()
            .col_expr(
                coupon::Column::UsageCount,
                Expr::col(coupon::Column::UsageCount).add(1),
            )
            .col_expr(coupon::Column::UpdatedAt, Expr::value(now))
            .filter(coupon::Column::Id.eq(coupon_id))
            .exec(conn)
            .await?;

        info!(%coupon_id, %order_id, "Coupon redeemed");
        Ok(())
    }

    /// Deletes applications whose session ended without an order.
    pub async fn purge_stale_applications<C: ConnectionTrait>(
        &self,
        conn: &C,
        now: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        let result = coupon_usage::Entity::delete_many()
            .filter(coupon_usage::Column::Status.eq(CouponUsageStatus::Applied))
            .filter(coupon_usage::Column::ExpiresAt.lte(now))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }
}
