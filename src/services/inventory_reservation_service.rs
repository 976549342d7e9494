//! Reservation store
//!
//! Time-boxed holds on (product, size) stock. Nothing else in the crate computes
//! availability; every write runs on the caller's connection so it can join the
//! transaction that owns the checkout session.

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, FromQueryResult,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::common::{Claimant, LineKey};
use crate::entities::commerce::{product_variant, SessionType};
use crate::entities::inventory_reservation::{self, ReservationStatus};
use crate::errors::{InsufficientStockLine, ServiceError};

/// Quantity requested for one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub key: LineKey,
    pub qty: i32,
}

/// Session-level attributes stamped on every reservation row.
#[derive(Debug, Clone)]
pub struct ReservationOwner {
    pub session_id: Uuid,
    pub session_type: SessionType,
    pub claimant: Claimant,
    pub expires_at: DateTime<Utc>,
}

/// Counts from one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationCleanup {
    /// Active rows past expiry flipped to `expired`
    pub expired: u64,
    /// Expired rows past retention removed
    pub deleted: u64,
}

#[derive(Debug, FromQueryResult)]
struct ReservedSum {
    reserved: Option<i64>,
}

#[derive(Clone, Default)]
pub struct ReservationStore;

impl ReservationStore {
    pub fn new() -> Self {
        Self
    }

    /// `total - sold - Σ active, unexpired holds`, floored at zero.
    ///
    /// Holds past `expires_at` are ignored even if the sweeper has not flipped them yet.
    pub async fn get_available_qty<C: ConnectionTrait>(
        &self,
        conn: &C,
        key: &LineKey,
        total_stock_qty: i32,
        sold_qty: i32,
        now: DateTime<Utc>,
    ) -> Result<i32, ServiceError> {
        let reserved = self.active_reserved_qty(conn, key, now).await?;
        let available = i64::from(total_stock_qty) - i64::from(sold_qty) - reserved;
        Ok(available.clamp(0, i64::from(i32::MAX)) as i32)
    }

    async fn active_reserved_qty<C: ConnectionTrait>(
        &self,
        conn: &C,
        key: &LineKey,
        now: DateTime<Utc>,
    ) -> Result<i64, ServiceError> {
        let sum = inventory_reservation::Entity::find()
            .select_only()
            .column_as(
                Expr::col(inventory_reservation::Column::ReservedQty).sum(),
                "reserved",
            )
            .filter(inventory_reservation::Column::ProductId.eq(key.product_id))
            .filter(inventory_reservation::Column::Size.eq(key.size.clone()))
            .filter(inventory_reservation::Column::Status.eq(ReservationStatus::Active))
            .filter(inventory_reservation::Column::ExpiresAt.gt(now))
            .into_model::<ReservedSum>()
            .one(conn)
            .await?;

        Ok(sum.and_then(|s| s.reserved).unwrap_or(0))
    }

    /// Reserves a single line. See [`Self::create_multiple_reservations`].
    pub async fn create_reservation<C: ConnectionTrait>(
        &self,
        conn: &C,
        owner: &ReservationOwner,
        request: ReservationRequest,
    ) -> Result<inventory_reservation::Model, ServiceError> {
        let mut rows = self
            .create_multiple_reservations(conn, owner, vec![request])
            .await?;
        rows.pop()
            .ok_or_else(|| ServiceError::InternalError("reservation insert returned no row".into()))
    }

    /// Reserves every requested line or none of them.
    ///
    /// Each affected variant row gets a `lock_version` bump first, in (product, size)
    /// order, so concurrent creators for the same line serialize on that row before the
    /// availability check. Any shortfall is reported for all offending lines at once and
    /// nothing is written.
    #[instrument(skip(self, conn, requests), fields(session_id = %owner.session_id))]
    pub async fn create_multiple_reservations<C: ConnectionTrait>(
        &self,
        conn: &C,
        owner: &ReservationOwner,
        requests: Vec<ReservationRequest>,
    ) -> Result<Vec<inventory_reservation::Model>, ServiceError> {
        let mut merged: BTreeMap<LineKey, i32> = BTreeMap::new();
        for request in requests {
            if request.qty <= 0 {
                return Err(ServiceError::InvalidInput(format!(
                    "Quantity for {} must be positive",
                    request.key
                )));
            }
            let total = merged.entry(request.key.clone()).or_insert(0);
            *total = total.checked_add(request.qty).ok_or_else(|| {
                ServiceError::InvalidInput(format!("Quantity for {} is too large", request.key))
            })?;
        }
        if merged.is_empty() {
            return Err(ServiceError::InvalidInput(
                "At least one line is required".into(),
            ));
        }

        let now = Utc::now();
        let mut shortfalls = Vec::new();

        for (key, qty) in &merged {
            let bumped = product_variant::Entity::update_many()
                .col_expr(
                    product_variant::Column::LockVersion,
                    Expr::col(product_variant::Column::LockVersion).add(1),
                )
                .filter(product_variant::Column::ProductId.eq(key.product_id))
                .filter(product_variant::Column::Size.eq(key.size.clone()))
                .filter(product_variant::Column::IsActive.eq(true))
                .exec(conn)
                .await?;

            let variant = if bumped.rows_affected == 0 {
                None
            } else {
                product_variant::Entity::find()
                    .filter(product_variant::Column::ProductId.eq(key.product_id))
                    .filter(product_variant::Column::Size.eq(key.size.clone()))
                    .one(conn)
                    .await?
            };

            let (available, name) = match &variant {
                Some(v) => (
                    self.get_available_qty(conn, key, v.total_stock_qty, v.sold_qty, now)
                        .await?,
                    Some(v.name.clone()),
                ),
                None => (0, None),
            };

            if *qty > available {
                shortfalls.push(InsufficientStockLine {
                    product_id: key.product_id,
                    size: key.size.clone(),
                    name,
                    requested: *qty,
                    available,
                });
            }
        }

        if !shortfalls.is_empty() {
            counter!("checkout_reservations.rejected", shortfalls.len() as u64);
            warn!(
                session_id = %owner.session_id,
                lines = shortfalls.len(),
                "Stock validation failed; no reservations written"
            );
            return Err(ServiceError::StockValidation(shortfalls));
        }

        let mut rows = Vec::with_capacity(merged.len());
        for (key, qty) in merged {
            let active = inventory_reservation::ActiveModel {
                id: Set(Uuid::new_v4()),
                session_id: Set(owner.session_id),
                session_type: Set(owner.session_type),
                product_id: Set(key.product_id),
                size: Set(key.size),
                reserved_qty: Set(qty),
                owner_id: Set(owner.claimant.owner_id()),
                guest_tracking_id: Set(owner.claimant.guest_tracking_id()),
                status: Set(ReservationStatus::Active),
                expires_at: Set(owner.expires_at),
                created_at: Set(now),
                updated_at: Set(now),
            };
            rows.push(active.insert(conn).await?);
        }

        counter!("checkout_reservations.created", rows.len() as u64);
        info!(
            session_id = %owner.session_id,
            count = rows.len(),
            expires_at = %owner.expires_at,
            "Reservations created"
        );
        Ok(rows)
    }

    /// Moves every active reservation of the session to `new_status`. Rows are kept for audit.
    pub async fn release_session_reservations<C: ConnectionTrait>(
        &self,
        conn: &C,
        session_id: Uuid,
        new_status: ReservationStatus,
    ) -> Result<u64, ServiceError> {
        let result = inventory_reservation::Entity::update_many()
            .col_expr(
                inventory_reservation::Column::Status,
                Expr::value(new_status.as_str()),
            )
            .col_expr(inventory_reservation::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(inventory_reservation::Column::SessionId.eq(session_id))
            .filter(inventory_reservation::Column::Status.eq(ReservationStatus::Active))
            .exec(conn)
            .await?;

        debug!(
            %session_id,
            status = new_status.as_str(),
            released = result.rows_affected,
            "Released session reservations"
        );
        Ok(result.rows_affected)
    }

    /// Pushes the expiry of the session's active reservations to `expires_at`.
    pub async fn extend_session_reservations<C: ConnectionTrait>(
        &self,
        conn: &C,
        session_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        let result = inventory_reservation::Entity::update_many()
            .col_expr(inventory_reservation::Column::ExpiresAt, Expr::value(expires_at))
            .col_expr(inventory_reservation::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(inventory_reservation::Column::SessionId.eq(session_id))
            .filter(inventory_reservation::Column::Status.eq(ReservationStatus::Active))
            .exec(conn)
            .await?;

        info!(%session_id, %expires_at, extended = result.rows_affected, "Extended reservations");
        Ok(result.rows_affected)
    }

    pub async fn find_for_session<C: ConnectionTrait>(
        &self,
        conn: &C,
        session_id: Uuid,
    ) -> Result<Vec<inventory_reservation::Model>, ServiceError> {
        Ok(inventory_reservation::Entity::find()
            .filter(inventory_reservation::Column::SessionId.eq(session_id))
            .order_by_asc(inventory_reservation::Column::ProductId)
            .order_by_asc(inventory_reservation::Column::Size)
            .all(conn)
            .await?)
    }

    /// Flips active rows past expiry to `expired` and deletes expired rows older than
    /// `retention`.
    #[instrument(skip(self, conn))]
    pub async fn clean_expired_reservations<C: ConnectionTrait>(
        &self,
        conn: &C,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<ReservationCleanup, ServiceError> {
        let expired = inventory_reservation::Entity::update_many()
            .col_expr(
                inventory_reservation::Column::Status,
                Expr::value(ReservationStatus::Expired.as_str()),
            )
            .col_expr(inventory_reservation::Column::UpdatedAt, Expr::value(now))
            .filter(inventory_reservation::Column::Status.eq(ReservationStatus::Active))
            .filter(inventory_reservation::Column::ExpiresAt.lte(now))
            .exec(conn)
            .await?
            .rows_affected;

        let deleted = inventory_reservation::Entity::delete_many()
            .filter(inventory_reservation::Column::Status.eq(ReservationStatus::Expired))
            .filter(inventory_reservation::Column::ExpiresAt.lt(now - retention))
            .exec(conn)
            .await?
            .rows_affected;

        if expired > 0 || deleted > 0 {
            info!(expired, deleted, "Cleaned expired reservations");
        }
        Ok(ReservationCleanup { expired, deleted })
    }
}
