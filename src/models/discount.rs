use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "discount_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DiscountType {
    Percent,
    Fixed,
}

impl fmt::Display for DiscountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscountType::Percent => write!(f, "percent"),
            DiscountType::Fixed => write!(f, "fixed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "discount_scope", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DiscountScope {
    All,
    Category,
    Product,
    ProductList,
}

#[derive(Debug, Clone, FromRow)]
pub struct DiscountRow {
    pub id: i64,
    pub name: String,
    pub discount_type: DiscountType,
    pub value: Decimal,
    pub scope: DiscountScope,
    pub scope_value: Option<String>,
    pub is_active: bool,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

/// Discount with its `product_list` membership resolved. This is the shape
/// the pricing engine consumes.
#[derive(Debug, Clone, Serialize)]
pub struct Discount {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub discount_type: DiscountType,
    pub value: Decimal,
    pub scope: DiscountScope,
    pub scope_value: Option<String>,
    pub is_active: bool,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub product_ids: Vec<i64>,
}

impl Discount {
    pub fn from_row(row: DiscountRow, product_ids: Vec<i64>) -> Self {
        Self {
            id: row.id,
            name: row.name,
            discount_type: row.discount_type,
            value: row.value,
            scope: row.scope,
            scope_value: row.scope_value,
            is_active: row.is_active,
            starts_at: row.starts_at,
            ends_at: row.ends_at,
            product_ids,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateDiscountRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub discount_type: DiscountType,
    pub value: Decimal,
    pub scope: DiscountScope,
    pub scope_value: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub product_ids: Vec<i64>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateDiscountRequest {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub discount_type: Option<DiscountType>,
    pub value: Option<Decimal>,
    pub scope: Option<DiscountScope>,
    pub scope_value: Option<String>,
    pub is_active: Option<bool>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub product_ids: Option<Vec<i64>>,
}
