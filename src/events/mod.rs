use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event, waiting for channel capacity
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Best-effort publish: never blocks the caller, drops and logs when the channel is full
    /// or closed.
    pub fn send_or_log(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.sender.try_send(event) {
            counter!("checkout_events.dropped", 1, "event" => name);
            warn!(event = name, error = %e, "Dropping domain event");
        }
    }
}

/// Domain events emitted by the checkout engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    CheckoutSessionCreated {
        session_id: Uuid,
        item_count: usize,
        expires_at: DateTime<Utc>,
    },
    CouponApplied {
        session_id: Uuid,
        code: String,
        total_discount: Decimal,
    },
    CouponRemoved {
        session_id: Uuid,
        code: String,
    },
    PaymentWindowOpened {
        session_id: Uuid,
        razorpay_order_id: String,
        locked_total: Decimal,
    },
    CheckoutCompleted {
        session_id: Uuid,
        order_id: Uuid,
    },
    CheckoutExpired(Uuid),
    CheckoutCancelled(Uuid),
    OrderCreated {
        order_id: Uuid,
        order_number: String,
        total_amount: Decimal,
    },
    ReservationsReleased {
        session_id: Uuid,
        status: String,
        count: u64,
    },
    ShipmentRequested {
        order_number: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::CheckoutSessionCreated { .. } => "checkout_session_created",
            Event::CouponApplied { .. } => "coupon_applied",
            Event::CouponRemoved { .. } => "coupon_removed",
            Event::PaymentWindowOpened { .. } => "payment_window_opened",
            Event::CheckoutCompleted { .. } => "checkout_completed",
            Event::CheckoutExpired(_) => "checkout_expired",
            Event::CheckoutCancelled(_) => "checkout_cancelled",
            Event::OrderCreated { .. } => "order_created",
            Event::ReservationsReleased { .. } => "reservations_released",
            Event::ShipmentRequested { .. } => "shipment_requested",
        }
    }
}

/// Drains the event channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        counter!("checkout_events.processed", 1, "event" => event.name());
        match &event {
            Event::OrderCreated {
                order_id,
                order_number,
                total_amount,
            } => {
                info!(%order_id, %order_number, %total_amount, "Order created");
            }
            Event::CheckoutExpired(session_id) => {
                info!(%session_id, "Checkout session expired");
            }
            Event::ReservationsReleased {
                session_id,
                status,
                count,
            } => {
                info!(%session_id, %status, count, "Reservations released");
            }
            other => {
                info!(event = other.name(), payload = ?other, "Domain event");
            }
        }
    }

    info!("Event processing loop stopped");
}
