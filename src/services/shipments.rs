//! Fire-and-forget shipment creation after an order is confirmed.
//!
//! [`ShipmentDispatcher::dispatch`] only enqueues; a single worker drains the bounded
//! queue and talks to the carrier. Failures surface through logs and metrics and never
//! reach the reconciliation caller.

use metrics::counter;
use sea_orm::{sea_query::Expr, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::entities::order::{self, OrderStatus};
use crate::events::{Event, EventSender};
use crate::integrations::shiprocket::{ShipmentRequest, ShippingCarrier};

#[derive(Debug, Clone)]
struct ShipmentJob {
    order_id: Uuid,
    request: ShipmentRequest,
}

#[derive(Clone)]
pub struct ShipmentDispatcher {
    sender: Option<mpsc::Sender<ShipmentJob>>,
}

impl ShipmentDispatcher {
    /// Starts the worker and returns the dispatcher handle plus the worker task. The
    /// worker exits once every dispatcher clone has been dropped.
    pub fn spawn(
        carrier: Arc<dyn ShippingCarrier>,
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_worker(rx, carrier, db, event_sender));
        (Self { sender: Some(tx) }, handle)
    }

    /// Dispatcher that drops every job; used when no carrier is configured.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Queues shipment creation for `order`. Never blocks and never fails.
    pub fn dispatch(&self, order: &order::Model) {
        let Some(sender) = &self.sender else {
            debug!(order_number = %order.order_number, "Shipment dispatch disabled");
            return;
        };

        let Some(request) = ShipmentRequest::from_order(order) else {
            counter!("checkout_shipments.skipped", 1);
            warn!(order_number = %order.order_number, "Order has no shipping address; shipment not requested");
            return;
        };

        let job = ShipmentJob {
            order_id: order.id,
            request,
        };
        if let Err(e) = sender.try_send(job) {
            counter!("checkout_shipments.dropped", 1);
            error!(order_number = %order.order_number, error = %e, "Shipment queue rejected job");
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<ShipmentJob>,
    carrier: Arc<dyn ShippingCarrier>,
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
) {
    info!("Shipment worker started");

    while let Some(job) = rx.recv().await {
        let order_number = job.request.order_number.clone();
        // Each job runs in its own task so a panic is contained and reported.
        let task = tokio::spawn(process_job(
            job,
            carrier.clone(),
            db.clone(),
            event_sender.clone(),
        ));
        if let Err(e) = task.await {
            counter!("checkout_shipments.failed", 1, "reason" => "panic");
            error!(%order_number, error = %e, "Shipment job aborted");
        }
    }

    info!("Shipment worker stopped");
}

#[instrument(skip_all, fields(order_number = %job.request.order_number))]
async fn process_job(
    job: ShipmentJob,
    carrier: Arc<dyn ShippingCarrier>,
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
) {
    let receipt = match carrier.create_shipment(&job.request).await {
        Ok(receipt) => receipt,
        Err(e) => {
            counter!("checkout_shipments.failed", 1, "reason" => "carrier");
            error!(order_id = %job.order_id, error = %e, "Shipment creation failed");
            return;
        }
    };

    let reference = receipt.shipment_id.to_string();
    let update = order::Entity::update_many()
        .col_expr(order::Column::Status, Expr::value(OrderStatus::ShipmentRequested))
        .col_expr(order::Column::ShipmentReference, Expr::value(Some(reference.clone())))
        .col_expr(order::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
        .filter(order::Column::Id.eq(job.order_id))
        .exec(&*db)
        .await;

    match update {
        Ok(_) => {
            counter!("checkout_shipments.created", 1);
            info!(order_id = %job.order_id, shipment_id = %reference, status = %OrderStatus::ShipmentRequested, "Shipment requested");
            event_sender.send_or_log(Event::ShipmentRequested {
                order_number: job.request.order_number,
            });
        }
        Err(e) => {
            counter!("checkout_shipments.failed", 1, "reason" => "persist");
            error!(order_id = %job.order_id, shipment_id = %reference, error = %e, "Shipment created but order not updated");
        }
    }
}
