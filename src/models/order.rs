use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Draft,
    Submitted,
    Paid,
    Cancelled,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Draft => write!(f, "draft"),
            OrderStatus::Submitted => write!(f, "submitted"),
            OrderStatus::Paid => write!(f, "paid"),
            OrderStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl OrderStatus {
    /// Monotonic state machine: `draft -> submitted -> paid | cancelled`.
    /// Same-status transitions are handled as no-ops before this check.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Draft, OrderStatus::Submitted)
                | (OrderStatus::Submitted, OrderStatus::Paid)
                | (OrderStatus::Submitted, OrderStatus::Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Paid | OrderStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: i64,
    pub user_id: i64,
    pub status: OrderStatus,
    pub currency: String,
    pub subtotal: Decimal,
    pub discount_total: Decimal,
    pub total_amount: Decimal,
    pub pricing_frozen: bool,
    pub pricing_frozen_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub product_id: i64,
    pub variant_id: i64,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub discount_id: Option<i64>,
    pub discount_amount: Decimal,
    pub final_unit_price: Decimal,
    pub line_total: Decimal,
}

/// Order item joined with its product name and variant label for responses.
#[derive(Debug, Clone, FromRow)]
pub struct OrderItemDetail {
    pub id: i64,
    pub order_id: i64,
    pub product_id: i64,
    pub variant_id: i64,
    pub product_name: Option<String>,
    pub variant_size: Option<String>,
    pub variant_color: Option<String>,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub discount_id: Option<i64>,
    pub discount_amount: Decimal,
    pub final_unit_price: Decimal,
    pub line_total: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderItemResponse {
    pub id: i64,
    pub product_id: i64,
    pub variant_id: i64,
    pub product_name: Option<String>,
    pub variant_label: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub discount_id: Option<i64>,
    pub discount_amount: Decimal,
    pub final_unit_price: Decimal,
    pub line_total: Decimal,
}

impl From<OrderItemDetail> for OrderItemResponse {
    fn from(item: OrderItemDetail) -> Self {
        let variant_label = format!(
            "{}/{}",
            item.variant_size.as_deref().unwrap_or("-"),
            item.variant_color.as_deref().unwrap_or("-")
        );
        Self {
            id: item.id,
            product_id: item.product_id,
            variant_id: item.variant_id,
            product_name: item.product_name,
            variant_label,
            quantity: item.quantity,
            unit_price: item.unit_price,
            discount_id: item.discount_id,
            discount_amount: item.discount_amount,
            final_unit_price: item.final_unit_price,
            line_total: item.line_total,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderResponse {
    pub id: i64,
    pub user_id: i64,
    pub status: OrderStatus,
    pub currency: String,
    pub items: Vec<OrderItemResponse>,
    pub subtotal: Decimal,
    pub discount_total: Decimal,
    pub total_amount: Decimal,
    pub pricing_frozen: bool,
    pub pricing_frozen_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderResponse {
    pub fn from_parts(order: Order, items: Vec<OrderItemDetail>) -> Self {
        Self {
            id: order.id,
            user_id: order.user_id,
            status: order.status,
            currency: order.currency,
            items: items.into_iter().map(OrderItemResponse::from).collect(),
            subtotal: order.subtotal,
            discount_total: order.discount_total,
            total_amount: order.total_amount,
            pricing_frozen: order.pricing_frozen,
            pricing_frozen_at: order.pricing_frozen_at,
            submitted_at: order.submitted_at,
            paid_at: order.paid_at,
            cancelled_at: order.cancelled_at,
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddOrderItemRequest {
    pub variant_id: i64,
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateOrderStatusRequest {
    pub status: OrderStatus,
    pub payment_ref: Option<String>,
    pub paid_amount: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PayOrderRequest {
    pub payment_ref: String,
    pub paid_amount: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManualOrderItemRequest {
    pub variant_id: i64,
    pub quantity: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_transition_table() {
        use OrderStatus::*;
        assert!(Draft.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(Paid));
        assert!(Submitted.can_transition_to(Cancelled));

        assert!(!Draft.can_transition_to(Paid));
        assert!(!Draft.can_transition_to(Cancelled));
        assert!(!Submitted.can_transition_to(Draft));
        assert!(!Paid.can_transition_to(Cancelled));
        assert!(!Paid.can_transition_to(Draft));
        assert!(!Cancelled.can_transition_to(Submitted));
        assert!(!Cancelled.can_transition_to(Paid));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(OrderStatus::Paid.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(!OrderStatus::Draft.is_terminal());
        assert!(!OrderStatus::Submitted.is_terminal());
    }
}
