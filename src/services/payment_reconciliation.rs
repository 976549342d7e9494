//! Payment reconciliation
//!
//! Turns a confirmed gateway payment into exactly one order. The webhook and the
//! shopper's status poll both land here and race freely; the conditional
//! `active -> processing` claim on the session decides which of them creates the order,
//! and the unique indexes on `orders` back that up at the storage level.

use chrono::Utc;
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::common::{to_minor_units, Claimant};
use crate::db::{is_unique_violation, with_transaction};
use crate::entities::commerce::checkout_session::{self, CheckoutStatus};
use crate::entities::commerce::product_variant;
use crate::entities::inventory_reservation::ReservationStatus;
use crate::entities::order::{self, order_number_for, OrderItems, OrderStatus, PaymentStatus};
use crate::errors::{ReconciliationError, ServiceError};
use crate::events::{Event, EventSender};
use crate::integrations::razorpay::{GatewayPayment, PaymentGateway, WebhookEvent};
use crate::services::commerce::checkout_service::transition;
use crate::services::commerce::coupon_service::CouponService;
use crate::services::inventory_reservation_service::ReservationStore;
use crate::services::shipments::ShipmentDispatcher;

const CLAIM_WAIT_ATTEMPTS: u32 = 20;
const CLAIM_WAIT_INTERVAL: Duration = Duration::from_millis(50);

/// Who is asking on the status-poll path.
#[derive(Clone, Copy)]
struct PollScope<'a> {
    session_id: Uuid,
    claimant: &'a Claimant,
}

impl PollScope<'_> {
    fn admits(&self, session_id: Uuid, owner: Option<Claimant>) -> bool {
        self.session_id == session_id && owner.as_ref() == Some(self.claimant)
    }
}

/// What observed the payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    StatusPoll,
    Webhook,
}

impl Trigger {
    fn as_str(self) -> &'static str {
        match self {
            Trigger::StatusPoll => "status_poll",
            Trigger::Webhook => "webhook",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledOrder {
    pub order: order::Model,
    /// False when an earlier trigger already created the order
    pub created: bool,
}

#[derive(Clone)]
pub struct PaymentReconciler {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    gateway: Arc<dyn PaymentGateway>,
    shipments: ShipmentDispatcher,
    reservations: ReservationStore,
    coupons: CouponService,
}

impl PaymentReconciler {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        shipments: ShipmentDispatcher,
    ) -> Self {
        Self {
            db,
            event_sender,
            gateway,
            shipments,
            reservations: ReservationStore::new(),
            coupons: CouponService::new(),
        }
    }

    /// Recovery poll from the shopper. The gateway order must belong to `session_id`,
    /// and that session to `claimant`; anything else reads as an unknown session.
    pub async fn check_status(
        &self,
        razorpay_order_id: &str,
        session_id: Uuid,
        claimant: &Claimant,
    ) -> Result<ReconciledOrder, ServiceError> {
        let scope = PollScope {
            session_id,
            claimant,
        };
        let result = self
            .reconcile(razorpay_order_id, Some(scope), None, Trigger::StatusPoll)
            .await;
        record_outcome(Trigger::StatusPoll, &result);
        result
    }

    /// Gateway webhook. Events that do not confirm a payment are acknowledged with `None`.
    pub async fn handle_webhook(
        &self,
        event: &WebhookEvent,
    ) -> Result<Option<ReconciledOrder>, ServiceError> {
        if !event.is_payment_success() {
            info!(event = %event.event, "Ignoring webhook event");
            return Ok(None);
        }
        let Some(razorpay_order_id) = event.gateway_order_id() else {
            warn!(event = %event.event, "Webhook carries no order id");
            return Ok(None);
        };

        let result = self
            .reconcile(razorpay_order_id, None, event.payment().cloned(), Trigger::Webhook)
            .await;
        record_outcome(Trigger::Webhook, &result);
        result.map(Some)
    }

    #[instrument(skip(self, scope, known_payment))]
    async fn reconcile(
        &self,
        razorpay_order_id: &str,
        scope: Option<PollScope<'_>>,
        known_payment: Option<GatewayPayment>,
        trigger: Trigger,
    ) -> Result<ReconciledOrder, ServiceError> {
        if let Some(order) = self.find_order_by_gateway_order(razorpay_order_id).await? {
            if !scope.map_or(true, |s| s.admits(order.session_id, order.claimant())) {
                return Err(ReconciliationError::SessionNotFound.into());
            }
            return Ok(ReconciledOrder {
                order,
                created: false,
            });
        }

        let session = checkout_session::Entity::find()
            .filter(checkout_session::Column::RazorpayOrderId.eq(razorpay_order_id))
            .one(&*self.db)
            .await?
            .filter(|s| scope.map_or(true, |scope| scope.admits(s.id, s.claimant())))
            .ok_or(ReconciliationError::SessionNotFound)?;

        let payment = match known_payment.filter(GatewayPayment::is_successful) {
            Some(payment) => payment,
            None => self
                .gateway
                .fetch_payments(razorpay_order_id)
                .await
                .map_err(|e| ReconciliationError::Gateway(e.to_string()))?
                .into_iter()
                .find(GatewayPayment::is_successful)
                .ok_or(ReconciliationError::PaymentNotCompleted)?,
        };

        let Some(expected_minor) = session.locked_total.and_then(to_minor_units) else {
            error!(session_id = %session.id, "Session has a gateway order but no locked total");
            return Err(ReconciliationError::RecoveryFailed.into());
        };
        if payment.amount != expected_minor {
            error!(
                session_id = %session.id,
                %razorpay_order_id,
                payment_id = %payment.id,
                expected_minor,
                captured_minor = payment.amount,
                "Captured amount does not match locked total"
            );
            return Err(ReconciliationError::AmountMismatch {
                expected_minor,
                captured_minor: payment.amount,
            }
            .into());
        }

        let claim = transition(session.id, CheckoutStatus::Active, CheckoutStatus::Processing)
            .filter(checkout_session::Column::RazorpayOrderId.eq(razorpay_order_id))
            .exec(&*self.db)
            .await?;
        if claim.rows_affected == 0 {
            return match self
                .await_competing_order(session.id, razorpay_order_id, &payment.id)
                .await?
            {
                Some(order) => {
                    info!(session_id = %session.id, order_id = %order.id, "Another trigger created the order");
                    Ok(ReconciledOrder {
                        order,
                        created: false,
                    })
                }
                None => {
                    warn!(session_id = %session.id, payment_id = %payment.id, "Session could not be claimed and no order exists");
                    Err(ReconciliationError::RecoveryFailed.into())
                }
            };
        }

        match self.create_order(&session, &payment).await {
            Ok(order) => {
                info!(
                    session_id = %session.id,
                    order_id = %order.id,
                    order_number = %order.order_number,
                    payment_status = %order.payment_status,
                    trigger = trigger.as_str(),
                    "Order created from payment"
                );
                self.shipments.dispatch(&order);
                self.event_sender.send_or_log(Event::OrderCreated {
                    order_id: order.id,
                    order_number: order.order_number.clone(),
                    total_amount: order.total_amount,
                });
                self.event_sender.send_or_log(Event::CheckoutCompleted {
                    session_id: session.id,
                    order_id: order.id,
                });
                Ok(ReconciledOrder {
                    order,
                    created: true,
                })
            }
            Err(ServiceError::DatabaseError(db_err)) if is_unique_violation(&db_err) => {
                match self.find_order_for_payment(razorpay_order_id, &payment.id).await? {
                    Some(order) => Ok(ReconciledOrder {
                        order,
                        created: false,
                    }),
                    None => Err(self.abandon_claim(session.id, &db_err.to_string()).await),
                }
            }
            Err(err) => Err(self.abandon_claim(session.id, &err.to_string()).await),
        }
    }

    /// Looks for the order of a trigger that won the claim. While that trigger still
    /// holds `processing` the lookup is repeated for a bounded time.
    async fn await_competing_order(
        &self,
        session_id: Uuid,
        razorpay_order_id: &str,
        payment_id: &str,
    ) -> Result<Option<order::Model>, ServiceError> {
        for attempt in 1..=CLAIM_WAIT_ATTEMPTS {
            if let Some(order) = self
                .find_order_for_payment(razorpay_order_id, payment_id)
                .await?
            {
                return Ok(Some(order));
            }
            let status = checkout_session::Entity::find_by_id(session_id)
                .one(&*self.db)
                .await?
                .map(|s| s.status);
            if status != Some(CheckoutStatus::Processing) || attempt == CLAIM_WAIT_ATTEMPTS {
                break;
            }
            tokio::time::sleep(CLAIM_WAIT_INTERVAL).await;
        }
        // The winner may have committed between the last two reads.
        self.find_order_for_payment(razorpay_order_id, payment_id)
            .await
    }

    /// Puts a claimed session back to `active` so a later trigger can retry.
    async fn abandon_claim(&self, session_id: Uuid, cause: &str) -> ServiceError {
        error!(%session_id, %cause, "Payment captured but order creation failed");
        counter!("checkout_reconciliation.order_creation_failed", 1);

        if let Err(e) = transition(session_id, CheckoutStatus::Processing, CheckoutStatus::Active)
            .exec(&*self.db)
            .await
        {
            error!(%session_id, error = %e, "Failed to release processing claim");
        }
        ReconciliationError::OrderCreationFailed.into()
    }

    /// Inserts the order and settles stock, coupon and session in one transaction.
    async fn create_order(
        &self,
        session: &checkout_session::Model,
        payment: &GatewayPayment,
    ) -> Result<order::Model, ServiceError> {
        let locked = session
            .locked_totals
            .clone()
            .ok_or_else(|| ServiceError::InternalError("Session has no locked totals".into()))?;
        let claimant = session
            .claimant()
            .ok_or_else(|| ServiceError::InternalError("Session has no claimant".into()))?;
        let razorpay_order_id = session
            .razorpay_order_id
            .clone()
            .ok_or_else(|| ServiceError::InternalError("Session has no gateway order".into()))?;
        let payment_status = if payment.status == "captured" {
            PaymentStatus::Captured
        } else {
            PaymentStatus::Authorized
        };

        let session = session.clone();
        let payment_id = payment.id.clone();
        let reservations = self.reservations.clone();
        let coupons = self.coupons.clone();

        let (order, released) = with_transaction::<_, _, ServiceError>(&self.db, move |txn| {
            Box::pin(async move {
                let now = Utc::now();
                let order_id = Uuid::new_v4();
                let order = order::ActiveModel {
                    id: Set(order_id),
                    order_number: Set(order_number_for(order_id)),
                    owner_id: Set(claimant.owner_id()),
                    guest_tracking_id: Set(claimant.guest_tracking_id()),
                    session_id: Set(session.id),
                    razorpay_order_id: Set(razorpay_order_id),
                    razorpay_payment_id: Set(payment_id),
                    items: Set(OrderItems(session.items.0.clone())),
                    subtotal: Set(locked.subtotal),
                    discount_total: Set(locked.discount_total),
                    shipping_discount: Set(locked.shipping_discount),
                    total_amount: Set(locked.total),
                    currency: Set(locked.currency.clone()),
                    applied_coupon: Set(session.applied_coupon.clone()),
                    shipping_address: Set(session.validated_address.clone()),
                    status: Set(OrderStatus::Confirmed),
                    payment_status: Set(payment_status),
                    shipment_reference: Set(None),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(txn)
                .await?;

                if let Some(applied) = &session.applied_coupon {
                    coupons
                        .mark_used(
                            txn,
                            applied.coupon_id,
                            &applied.code,
                            &claimant,
                            session.id,
                            order_id,
                        )
                        .await?;
                }

                for item in &session.items.0 {
                    product_variant::Entity::update_many()
                        .col_expr(
                            product_variant::Column::SoldQty,
                            Expr::col(product_variant::Column::SoldQty).add(item.qty),
                        )
                        .col_expr(product_variant::Column::UpdatedAt, Expr::value(now))
                        .filter(product_variant::Column::ProductId.eq(item.product_id))
                        .filter(product_variant::Column::Size.eq(item.size.clone()))
                        .exec(txn)
                        .await?;
                }

                let released = reservations
                    .release_session_reservations(txn, session.id, ReservationStatus::Completed)
                    .await?;

                let completed =
                    transition(session.id, CheckoutStatus::Processing, CheckoutStatus::Completed)
                        .col_expr(checkout_session::Column::OrderId, Expr::value(Some(order_id)))
                        .exec(txn)
                        .await?;
                if completed.rows_affected == 0 {
                    return Err(ServiceError::ConcurrentModification(session.id));
                }

                Ok((order, released))
            })
        })
        .await?;

        self.event_sender.send_or_log(Event::ReservationsReleased {
            session_id: order.session_id,
            status: ReservationStatus::Completed.as_str().to_string(),
            count: released,
        });
        Ok(order)
    }

    async fn find_order_by_gateway_order(
        &self,
        razorpay_order_id: &str,
    ) -> Result<Option<order::Model>, ServiceError> {
        Ok(order::Entity::find()
            .filter(order::Column::RazorpayOrderId.eq(razorpay_order_id))
            .one(&*self.db)
            .await?)
    }

    async fn find_order_for_payment(
        &self,
        razorpay_order_id: &str,
        payment_id: &str,
    ) -> Result<Option<order::Model>, ServiceError> {
        let by_payment = order::Entity::find()
            .filter(order::Column::RazorpayPaymentId.eq(payment_id))
            .one(&*self.db)
            .await?;
        match by_payment {
            Some(order) => Ok(Some(order)),
            None => self.find_order_by_gateway_order(razorpay_order_id).await,
        }
    }
}

fn record_outcome(trigger: Trigger, result: &Result<ReconciledOrder, ServiceError>) {
    let status = match result {
        Ok(r) if r.created => "created",
        Ok(_) => "already_completed",
        Err(ServiceError::Reconciliation(e)) => e.status(),
        Err(_) => "error",
    };
    counter!("checkout_reconciliation.outcomes", 1, "trigger" => trigger.as_str(), "status" => status);
}
