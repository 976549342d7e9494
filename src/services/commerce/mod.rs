/// Commerce services module - checkout sessions, coupons and discount math
pub mod checkout_service;
pub mod coupon_service;
pub mod discount_engine;

// Re-export services for convenience
pub use checkout_service::{CheckoutService, CreateSessionInput};
pub use coupon_service::CouponService;
