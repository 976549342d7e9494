pub mod commerce;
pub mod common;
pub mod health;
pub mod payment_webhooks;
pub mod payments;

use crate::config::CheckoutConfig;
use crate::db::DbPool;
use crate::events::EventSender;
use crate::integrations::PaymentGateway;
use crate::services::commerce::CheckoutService;
use crate::services::payment_reconciliation::PaymentReconciler;
use crate::services::shipments::ShipmentDispatcher;
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub checkout: Arc<CheckoutService>,
    pub reconciler: Arc<PaymentReconciler>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        shipments: ShipmentDispatcher,
        checkout_config: CheckoutConfig,
    ) -> Self {
        let checkout = Arc::new(CheckoutService::new(
            db_pool.clone(),
            event_sender.clone(),
            gateway.clone(),
            checkout_config,
        ));
        let reconciler = Arc::new(PaymentReconciler::new(
            db_pool,
            event_sender,
            gateway,
            shipments,
        ));

        Self {
            checkout,
            reconciler,
        }
    }
}
