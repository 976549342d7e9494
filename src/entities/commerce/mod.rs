/// Commerce entities module
pub mod checkout_session;
pub mod coupon;
pub mod coupon_usage;
pub mod product_variant;

// Re-export entities
pub use checkout_session::{
    CheckoutStatus, Entity as CheckoutSession, Model as CheckoutSessionModel, SessionType,
};
pub use coupon::{CouponType, Entity as Coupon, Model as CouponModel};
pub use coupon_usage::{CouponUsageStatus, Entity as CouponUsage, Model as CouponUsageModel};
pub use product_variant::{Entity as ProductVariant, Model as ProductVariantModel};
