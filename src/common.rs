/// Common types and utilities shared across handlers and services
use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use sea_orm::{ColumnTrait, Condition};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Who a session, reservation or coupon usage belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Claimant {
    /// Signed-in customer
    Identified(Uuid),
    /// Anonymous shopper tracked by a client-issued id
    Guest(String),
}

impl Claimant {
    pub fn owner_id(&self) -> Option<Uuid> {
        match self {
            Claimant::Identified(id) => Some(*id),
            Claimant::Guest(_) => None,
        }
    }

    pub fn guest_tracking_id(&self) -> Option<String> {
        match self {
            Claimant::Identified(_) => None,
            Claimant::Guest(tracking_id) => Some(tracking_id.clone()),
        }
    }

    /// Rebuilds a claimant from the paired storage columns; the owner wins when both are set.
    pub fn from_columns(owner_id: Option<Uuid>, guest_tracking_id: Option<&str>) -> Option<Self> {
        match (owner_id, guest_tracking_id) {
            (Some(id), _) => Some(Claimant::Identified(id)),
            (None, Some(g)) if !g.is_empty() => Some(Claimant::Guest(g.to_string())),
            _ => None,
        }
    }

    /// Filter matching rows that belong to this claimant.
    pub fn condition<C: ColumnTrait>(&self, owner_col: C, guest_col: C) -> Condition {
        match self {
            Claimant::Identified(id) => Condition::all().add(owner_col.eq(*id)),
            Claimant::Guest(tracking_id) => Condition::all()
                .add(owner_col.is_null())
                .add(guest_col.eq(tracking_id.clone())),
        }
    }
}

impl fmt::Display for Claimant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Claimant::Identified(id) => write!(f, "customer:{}", id),
            Claimant::Guest(tracking_id) => write!(f, "guest:{}", tracking_id),
        }
    }
}

/// Composite key of a stock-keeping line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineKey {
    pub product_id: Uuid,
    pub size: String,
}

impl LineKey {
    pub fn new(product_id: Uuid, size: impl Into<String>) -> Self {
        Self {
            product_id,
            size: size.into(),
        }
    }
}

impl fmt::Display for LineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.product_id, self.size)
    }
}

/// Rounds a money amount to two decimals, halves away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Converts a major-unit amount to minor units (paise, cents).
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    (round_money(amount) * Decimal::ONE_HUNDRED).to_i64()
}

/// Converts minor units back to a major-unit amount.
pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}
