pub mod commerce;
pub mod inventory_reservation;
pub mod order;
