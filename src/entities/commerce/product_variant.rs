use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::common::LineKey;

/// Sellable (product, size) combination with its stock counters.
///
/// Catalog maintenance happens elsewhere; the checkout engine reads prices and
/// stock from here and only writes `sold_qty` and `lock_version`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "product_variants")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub product_id: Uuid,
    pub size: String,
    pub name: String,
    pub slug: String,
    #[sea_orm(nullable)]
    pub category: Option<String>,
    /// Current selling price
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub price: Decimal,
    /// List price; a selling price below it marks the line as already discounted
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub catalog_price: Decimal,
    pub total_stock_qty: i32,
    pub sold_qty: i32,
    /// Bumped by reservation writers to serialize on this row
    pub lock_version: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn key(&self) -> LineKey {
        LineKey::new(self.product_id, self.size.clone())
    }

    pub fn is_discounted(&self) -> bool {
        self.price < self.catalog_price
    }
}
