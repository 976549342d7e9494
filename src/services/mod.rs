// Checkout domain
pub mod commerce;
pub mod inventory_reservation_service;

// Payment-to-order conversion and its side effects
pub mod payment_reconciliation;
pub mod shipments;

// Background maintenance
pub mod expiry_sweeper;
