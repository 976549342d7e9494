//! Clients for the external collaborators: the payment gateway and the carrier aggregator.

pub mod razorpay;
pub mod shiprocket;

pub use razorpay::{PaymentGateway, RazorpayClient};
pub use shiprocket::{ShippingCarrier, ShiprocketClient};
