//! Deterministic coupon evaluation over priced cart lines.
//!
//! Everything here is pure: no database, no clock reads. Callers load the coupon,
//! check usage limits and pass in `now` where time matters.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::common::{round_money, LineKey};
use crate::entities::commerce::checkout_session::{AppliedCoupon, LineDiscount, SessionItem};
use crate::entities::commerce::coupon::{self, CouponType};
use crate::errors::CouponRejection;

/// One cart line as the engine sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct PricedLine {
    pub key: LineKey,
    pub unit_price: Decimal,
    pub catalog_price: Decimal,
    pub qty: i32,
    pub category: Option<String>,
}

impl PricedLine {
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.qty)
    }
}

impl From<&SessionItem> for PricedLine {
    fn from(item: &SessionItem) -> Self {
        Self {
            key: item.key(),
            unit_price: item.price,
            catalog_price: item.catalog_price,
            qty: item.qty,
            category: item.category.clone(),
        }
    }
}

/// Outcome of a successful evaluation. All amounts are rounded to two decimals and
/// `item_discounts` sum exactly to `total_discount`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscountAllocation {
    pub total_discount: Decimal,
    pub shipping_discount: Decimal,
    pub item_discounts: Vec<LineDiscount>,
    pub eligible_items: Vec<LineKey>,
    pub cart_subtotal: Decimal,
    pub final_total: Decimal,
}

impl DiscountAllocation {
    pub fn discount_for(&self, key: &LineKey) -> Decimal {
        self.item_discounts
            .iter()
            .find(|d| d.product_id == key.product_id && d.size == key.size)
            .map(|d| d.discount)
            .unwrap_or(Decimal::ZERO)
    }

    /// Snapshot persisted on the session.
    pub fn to_applied(&self, coupon: &coupon::Model, applied_at: DateTime<Utc>) -> AppliedCoupon {
        AppliedCoupon {
            coupon_id: coupon.id,
            code: coupon.code.clone(),
            coupon_type: coupon.coupon_type,
            value: coupon.value,
            total_discount: self.total_discount,
            shipping_discount: self.shipping_discount,
            item_discounts: self.item_discounts.clone(),
            eligible_items: self.eligible_items.clone(),
            applied_at,
        }
    }
}

/// Checks the coupon's activation flag and validity window.
pub fn ensure_redeemable(coupon: &coupon::Model, now: DateTime<Utc>) -> Result<(), CouponRejection> {
    if !coupon.is_active {
        return Err(CouponRejection::CouponInactive);
    }
    if now < coupon.valid_from {
        return Err(CouponRejection::CouponNotStarted);
    }
    if coupon.valid_until.is_some_and(|until| now >= until) {
        return Err(CouponRejection::CouponExpired);
    }
    Ok(())
}

fn category_in(category: Option<&str>, list: &[String]) -> bool {
    category.is_some_and(|c| list.iter().any(|l| l.eq_ignore_ascii_case(c)))
}

fn is_eligible(coupon: &coupon::Model, line: &PricedLine) -> bool {
    let scope = &coupon.scope;
    let category = line.category.as_deref();

    if scope.excluded_products.contains(&line.key.product_id)
        || category_in(category, &scope.excluded_categories)
    {
        return false;
    }

    let has_inclusions =
        !scope.applicable_products.is_empty() || !scope.applicable_categories.is_empty();
    if has_inclusions
        && !scope.applicable_products.contains(&line.key.product_id)
        && !category_in(category, &scope.applicable_categories)
    {
        return false;
    }

    !(coupon.exclude_discounted_items && line.unit_price < line.catalog_price)
}

/// Evaluates `coupon` against `lines`.
pub fn calculate_discount(
    coupon: &coupon::Model,
    lines: &[PricedLine],
) -> Result<DiscountAllocation, CouponRejection> {
    let cart_subtotal: Decimal = lines.iter().map(PricedLine::line_total).sum();
    let eligible: Vec<bool> = lines.iter().map(|l| is_eligible(coupon, l)).collect();

    if !eligible.iter().any(|e| *e) {
        return Err(CouponRejection::NoEligibleItems);
    }
    if cart_subtotal < coupon.min_order_value {
        return Err(CouponRejection::MinOrderNotMet {
            min_order_value: round_money(coupon.min_order_value),
            cart_subtotal: round_money(cart_subtotal),
        });
    }

    let eligible_subtotal: Decimal = lines
        .iter()
        .zip(&eligible)
        .filter(|(_, e)| **e)
        .map(|(l, _)| l.line_total())
        .sum();
    let value = coupon.value.max(Decimal::ZERO);

    let (item_discount, shipping_discount) = match coupon.coupon_type {
        CouponType::Percentage => {
            let mut raw = eligible_subtotal * value / Decimal::ONE_HUNDRED;
            if let Some(cap) = coupon.max_discount {
                raw = raw.min(cap.max(Decimal::ZERO));
            }
            (round_money(raw.min(eligible_subtotal)), Decimal::ZERO)
        }
        CouponType::Fixed => (round_money(value.min(eligible_subtotal)), Decimal::ZERO),
        CouponType::Shipping => (Decimal::ZERO, round_money(value)),
    };

    let item_discounts = allocate(lines, &eligible, eligible_subtotal, item_discount);
    let eligible_items = lines
        .iter()
        .zip(&eligible)
        .filter(|(_, e)| **e)
        .map(|(l, _)| l.key.clone())
        .collect();

    Ok(DiscountAllocation {
        total_discount: item_discount,
        shipping_discount,
        item_discounts,
        eligible_items,
        cart_subtotal: round_money(cart_subtotal),
        final_total: round_money(cart_subtotal - item_discount),
    })
}

/// Splits `total` over eligible lines by their share of `eligible_subtotal`.
/// The last eligible line takes whatever remains so the parts add up exactly.
fn allocate(
    lines: &[PricedLine],
    eligible: &[bool],
    eligible_subtotal: Decimal,
    total: Decimal,
) -> Vec<LineDiscount> {
    let last_eligible = eligible.iter().rposition(|e| *e);
    let mut remaining = total;

    lines
        .iter()
        .zip(eligible)
        .enumerate()
        .map(|(idx, (line, is_eligible))| {
            let discount = if !*is_eligible || total.is_zero() || eligible_subtotal.is_zero() {
                Decimal::ZERO
            } else if Some(idx) == last_eligible {
                remaining
            } else {
                let share = round_money(total * line.line_total() / eligible_subtotal);
                share.min(remaining)
            };
            remaining -= discount;

            LineDiscount {
                product_id: line.key.product_id,
                size: line.key.size.clone(),
                discount,
                eligible: *is_eligible,
            }
        })
        .collect()
}
