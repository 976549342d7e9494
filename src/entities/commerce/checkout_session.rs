use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::common::{Claimant, LineKey};
use crate::entities::commerce::coupon::CouponType;

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStatus {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "expired")]
    Expired,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl CheckoutStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Expired | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    #[sea_orm(string_value = "buy_now")]
    BuyNow,
    #[sea_orm(string_value = "cart_checkout")]
    CartCheckout,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuyNow => "buy_now",
            Self::CartCheckout => "cart_checkout",
        }
    }
}

/// Priced line frozen into a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionItem {
    pub product_id: Uuid,
    pub name: String,
    pub slug: String,
    pub size: String,
    pub qty: i32,
    /// Unit selling price
    pub price: Decimal,
    /// Unit list price at the time the line was priced
    pub catalog_price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl SessionItem {
    pub fn key(&self) -> LineKey {
        LineKey::new(self.product_id, self.size.clone())
    }

    pub fn line_total(&self) -> Decimal {
        self.price * Decimal::from(self.qty)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct SessionItems(pub Vec<SessionItem>);

/// Discount attributed to one line; ineligible lines carry an explicit zero.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineDiscount {
    pub product_id: Uuid,
    pub size: String,
    pub discount: Decimal,
    pub eligible: bool,
}

impl LineDiscount {
    pub fn key(&self) -> LineKey {
        LineKey::new(self.product_id, self.size.clone())
    }
}

/// Snapshot of a coupon evaluation stored on the session. Re-validated before payment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
#[serde(rename_all = "camelCase")]
pub struct AppliedCoupon {
    pub coupon_id: Uuid,
    pub code: String,
    pub coupon_type: CouponType,
    pub value: Decimal,
    pub total_discount: Decimal,
    pub shipping_discount: Decimal,
    pub item_discounts: Vec<LineDiscount>,
    pub eligible_items: Vec<LineKey>,
    pub applied_at: DateTime<Utc>,
}

/// Totals frozen when the payment window opens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
#[serde(rename_all = "camelCase")]
pub struct LockedTotals {
    pub subtotal: Decimal,
    pub discount_total: Decimal,
    pub shipping_discount: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub locked_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate, FromJsonQueryResult)]
#[serde(rename_all = "camelCase")]
pub struct ShippingAddress {
    #[validate(length(min = 1, max = 120))]
    pub name: String,
    #[validate(length(min = 7, max = 20))]
    pub phone: String,
    #[validate(email)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[validate(length(min = 1, max = 255))]
    pub line1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line2: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    #[validate(length(min = 1, max = 100))]
    pub state: String,
    #[validate(length(min = 3, max = 12))]
    pub postal_code: String,
    #[validate(length(equal = 2))]
    pub country: String,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "checkout_sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(nullable)]
    pub owner_id: Option<Uuid>,
    #[sea_orm(nullable)]
    pub guest_tracking_id: Option<String>,
    pub session_type: SessionType,
    #[sea_orm(column_type = "Json")]
    pub items: SessionItems,
    #[sea_orm(column_type = "Json", nullable)]
    pub applied_coupon: Option<AppliedCoupon>,
    pub has_active_reservations: bool,
    pub status: CheckoutStatus,
    pub expires_at: DateTime<Utc>,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))", nullable)]
    pub locked_total: Option<Decimal>,
    #[sea_orm(column_type = "Json", nullable)]
    pub locked_totals: Option<LockedTotals>,
    #[sea_orm(nullable)]
    pub razorpay_order_id: Option<String>,
    #[sea_orm(nullable)]
    pub validated_at: Option<DateTime<Utc>>,
    #[sea_orm(column_type = "Json", nullable)]
    pub validated_address: Option<ShippingAddress>,
    #[sea_orm(nullable)]
    pub order_id: Option<Uuid>,
    /// Optimistic concurrency counter, bumped on every save
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn claimant(&self) -> Option<Claimant> {
        Claimant::from_columns(self.owner_id, self.guest_tracking_id.as_deref())
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// True once totals are frozen for payment.
    pub fn is_locked(&self) -> bool {
        self.locked_total.is_some()
    }

    pub fn subtotal(&self) -> Decimal {
        self.items.0.iter().map(SessionItem::line_total).sum()
    }
}
