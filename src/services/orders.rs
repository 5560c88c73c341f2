//! Order aggregate: draft assembly, item edits with full repricing,
//! submission freeze with stock reservation, and the order state machine.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::models::{
    ContactRequest, ManualOrderItemRequest, Order, OrderItem, OrderItemDetail, OrderResponse,
    OrderStatus, UpdateOrderStatusRequest, UserBasicResponse,
};
use crate::services::catalog::CatalogService;
use crate::services::discounts::DiscountService;
use crate::services::payments::PaymentService;
use crate::services::pricing::{
    self, validate_order_pricing_before_submit, PricingProduct,
};
use crate::services::reservations::ReservationService;
use crate::services::users::UserService;

const ORDER_COLUMNS: &str = "id, user_id, status, currency, subtotal, discount_total, total_amount, \
     pricing_frozen, pricing_frozen_at, submitted_at, paid_at, cancelled_at, expires_at, \
     created_at, updated_at";

const DEFAULT_CURRENCY: &str = "ARS";

#[derive(Debug, Serialize)]
pub struct CheckoutResult {
    pub customer: UserBasicResponse,
    pub order: OrderResponse,
    #[serde(skip)]
    pub user_created: bool,
}

pub struct OrderService;

impl OrderService {
    async fn get_order(conn: &mut PgConnection, order_id: i64) -> Result<Order> {
        sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found("order not found"))
    }

    async fn load_item_details(
        conn: &mut PgConnection,
        order_id: i64,
    ) -> Result<Vec<OrderItemDetail>> {
        let items = sqlx::query_as::<_, OrderItemDetail>(
            "SELECT oi.id, oi.order_id, oi.product_id, oi.variant_id,
                    p.name AS product_name, v.size AS variant_size, v.color AS variant_color,
                    oi.quantity, oi.unit_price, oi.discount_id, oi.discount_amount,
                    oi.final_unit_price, oi.line_total
             FROM order_items oi
             LEFT JOIN products p ON p.id = oi.product_id
             LEFT JOIN product_variants v ON v.id = oi.variant_id
             WHERE oi.order_id = $1
             ORDER BY oi.id ASC",
        )
        .bind(order_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(items)
    }

    async fn load_order_response(
        conn: &mut PgConnection,
        order_id: i64,
    ) -> Result<OrderResponse> {
        let order = Self::get_order(conn, order_id).await?;
        let items = Self::load_item_details(conn, order_id).await?;
        Ok(OrderResponse::from_parts(order, items))
    }

    async fn get_draft_for_update(
        conn: &mut PgConnection,
        user_id: i64,
    ) -> Result<Option<Order>> {
        let draft = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders
             WHERE user_id = $1 AND status = 'draft'
             ORDER BY created_at DESC, id DESC
             LIMIT 1 FOR UPDATE"
        ))
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(draft)
    }

    async fn insert_draft(conn: &mut PgConnection, user_id: i64) -> Result<Order> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "INSERT INTO orders (user_id, status, currency) VALUES ($1, 'draft', $2)
             RETURNING {ORDER_COLUMNS}"
        ))
        .bind(user_id)
        .bind(DEFAULT_CURRENCY)
        .fetch_one(&mut *conn)
        .await?;
        Ok(order)
    }

    /// Re-price every line of an order against the current discount set and
    /// write back the new totals. Frozen orders reprice only with `force`
    /// (the one-time `draft -> submitted` snapshot).
    async fn reprice_order(conn: &mut PgConnection, order_id: i64, force: bool) -> Result<()> {
        let order = Self::get_order(conn, order_id).await?;
        if order.pricing_frozen && !force {
            return Err(Error::validation("cannot recalculate a frozen order"));
        }

        let items = sqlx::query_as::<_, OrderItem>(
            "SELECT id, order_id, product_id, variant_id, quantity, unit_price, discount_id,
                    discount_amount, final_unit_price, line_total
             FROM order_items WHERE order_id = $1 ORDER BY id ASC",
        )
        .bind(order_id)
        .fetch_all(&mut *conn)
        .await?;

        let discounts = DiscountService::list(conn).await?;
        let now = Utc::now();

        let product_ids: Vec<i64> = items.iter().map(|item| item.product_id).collect();
        let product_rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT p.id, c.name FROM products p
             JOIN categories c ON c.id = p.category_id
             WHERE p.id = ANY($1)",
        )
        .bind(&product_ids)
        .fetch_all(&mut *conn)
        .await?;
        let products_by_id: HashMap<i64, PricingProduct> = product_rows
            .into_iter()
            .map(|(id, category)| (id, PricingProduct { id, category }))
            .collect();

        let mut lines: Vec<(Decimal, i32, Decimal, Decimal)> = Vec::with_capacity(items.len());
        for item in &items {
            let Some(product) = products_by_id.get(&item.product_id) else {
                // Product vanished from the catalog; the line keeps its
                // frozen figures.
                lines.push((
                    item.unit_price,
                    item.quantity,
                    item.discount_amount,
                    item.line_total,
                ));
                continue;
            };

            let applicable = pricing::applicable_to(product, &discounts, now);
            let best = pricing::best_discount_for(item.unit_price, &applicable);
            let line = pricing::recompute_line(item.unit_price, item.quantity, best)?;

            sqlx::query(
                "UPDATE order_items
                 SET discount_id = $1, discount_amount = $2, final_unit_price = $3, line_total = $4
                 WHERE id = $5",
            )
            .bind(line.discount_id)
            .bind(line.discount_amount)
            .bind(line.final_unit_price)
            .bind(line.line_total)
            .bind(item.id)
            .execute(&mut *conn)
            .await?;

            lines.push((
                item.unit_price,
                item.quantity,
                line.discount_amount,
                line.line_total,
            ));
        }

        let totals = pricing::recompute_order_totals(&lines);
        sqlx::query(
            "UPDATE orders
             SET subtotal = $1, discount_total = $2, total_amount = $3, updated_at = NOW()
             WHERE id = $4",
        )
        .bind(totals.subtotal)
        .bind(totals.discount_total)
        .bind(totals.total_amount)
        .bind(order_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn get_or_create_draft(
        pool: &PgPool,
        user_id: i64,
    ) -> Result<(OrderResponse, bool)> {
        let mut tx = pool.begin().await?;
        let (order, created) = match Self::get_draft_for_update(&mut tx, user_id).await? {
            Some(draft) => (draft, false),
            None => (Self::insert_draft(&mut tx, user_id).await?, true),
        };
        let response = Self::load_order_response(&mut tx, order.id).await?;
        tx.commit().await?;
        Ok((response, created))
    }

    pub async fn add_item_to_draft(
        pool: &PgPool,
        user_id: i64,
        variant_id: i64,
        quantity: i32,
    ) -> Result<OrderResponse> {
        if quantity <= 0 {
            return Err(Error::validation("quantity must be greater than 0"));
        }

        let mut tx = pool.begin().await?;
        let variant = CatalogService::get_active_variant(&mut tx, variant_id).await?;
        let order = match Self::get_draft_for_update(&mut tx, user_id).await? {
            Some(draft) => draft,
            None => Self::insert_draft(&mut tx, user_id).await?,
        };

        let existing_item_id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM order_items WHERE order_id = $1 AND variant_id = $2",
        )
        .bind(order.id)
        .bind(variant_id)
        .fetch_optional(&mut *tx)
        .await?;

        match existing_item_id {
            Some(item_id) => {
                sqlx::query("UPDATE order_items SET quantity = quantity + $1 WHERE id = $2")
                    .bind(quantity)
                    .bind(item_id)
                    .execute(&mut *tx)
                    .await?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO order_items
                         (order_id, product_id, variant_id, quantity, unit_price,
                          discount_amount, final_unit_price, line_total)
                     VALUES ($1, $2, $3, $4, $5, 0, $5, $5 * $4)",
                )
                .bind(order.id)
                .bind(variant.product_id)
                .bind(variant.id)
                .bind(quantity)
                .bind(variant.price)
                .execute(&mut *tx)
                .await?;
            }
        }

        Self::reprice_order(&mut tx, order.id, false).await?;
        let response = Self::load_order_response(&mut tx, order.id).await?;
        tx.commit().await?;
        Ok(response)
    }

    pub async fn remove_item_from_draft(
        pool: &PgPool,
        user_id: i64,
        item_id: i64,
    ) -> Result<OrderResponse> {
        let mut tx = pool.begin().await?;
        let draft = Self::get_draft_for_update(&mut tx, user_id)
            .await?
            .ok_or_else(|| Error::not_found("draft order item not found"))?;

        let deleted = sqlx::query("DELETE FROM order_items WHERE id = $1 AND order_id = $2")
            .bind(item_id)
            .bind(draft.id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(Error::not_found("draft order item not found"));
        }

        Self::reprice_order(&mut tx, draft.id, false).await?;
        let response = Self::load_order_response(&mut tx, draft.id).await?;
        tx.commit().await?;
        Ok(response)
    }

    pub async fn get_order_for_user(
        pool: &PgPool,
        user_id: i64,
        order_id: i64,
    ) -> Result<OrderResponse> {
        let mut conn = pool.acquire().await?;
        let response = Self::load_order_response(&mut conn, order_id).await?;
        if response.user_id != user_id {
            return Err(Error::not_found("order not found"));
        }
        Ok(response)
    }

    /// Drive the order state machine. Same-status is a no-op; admin `paid`
    /// delegates to the payment lifecycle; submission freezes pricing and
    /// reserves stock; cancellation releases reservations.
    pub async fn change_status(
        pool: &PgPool,
        user_id: i64,
        order_id: i64,
        req: UpdateOrderStatusRequest,
        is_admin: bool,
    ) -> Result<OrderResponse> {
        let new_status = req.status;
        if new_status != OrderStatus::Paid
            && (req.payment_ref.is_some() || req.paid_amount.is_some())
        {
            return Err(Error::validation(
                "payment_ref and paid_amount are only valid when status is paid",
            ));
        }

        let mut tx = pool.begin().await?;

        // Admin-driven paid may target another user's order.
        let bypass_ownership = is_admin && new_status == OrderStatus::Paid;
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(order_id)
        .fetch_optional(&mut *tx)
        .await?
        .filter(|order| bypass_ownership || order.user_id == user_id)
        .ok_or_else(|| Error::not_found("order not found"))?;

        if order.status != OrderStatus::Draft && new_status == OrderStatus::Draft {
            return Err(Error::validation("cannot move non-draft order back to draft"));
        }

        let item_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM order_items WHERE order_id = $1")
                .bind(order_id)
                .fetch_one(&mut *tx)
                .await?;
        if order.status == OrderStatus::Draft
            && new_status != OrderStatus::Draft
            && item_count == 0
        {
            return Err(Error::validation("cannot leave draft with an empty order"));
        }

        if new_status == OrderStatus::Paid {
            if !is_admin {
                return Err(Error::validation("only admins can set status paid manually"));
            }
            let payment_ref = req
                .payment_ref
                .as_deref()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .ok_or_else(|| {
                    Error::validation("payment_ref is required when status is paid")
                })?;
            let paid_amount = req.paid_amount.filter(|a| *a > Decimal::ZERO).ok_or_else(|| {
                Error::validation("paid_amount must be greater than 0 when status is paid")
            })?;

            PaymentService::confirm_manual_payment_for_order(
                &mut tx,
                order.id,
                order.user_id,
                payment_ref,
                paid_amount,
            )
            .await?;

            let response = Self::load_order_response(&mut tx, order.id).await?;
            tx.commit().await?;
            return Ok(response);
        }

        if order.status == new_status {
            let response = Self::load_order_response(&mut tx, order.id).await?;
            tx.commit().await?;
            return Ok(response);
        }

        if !order.status.can_transition_to(new_status) {
            return Err(Error::validation("invalid status transition"));
        }

        match new_status {
            OrderStatus::Submitted => {
                Self::reprice_order(&mut tx, order.id, true).await?;
                let repriced = Self::get_order(&mut tx, order.id).await?;
                validate_order_pricing_before_submit(
                    item_count as usize,
                    repriced.total_amount,
                )?;

                sqlx::query(
                    "UPDATE orders
                     SET status = 'submitted', pricing_frozen = TRUE,
                         pricing_frozen_at = COALESCE(pricing_frozen_at, NOW()),
                         submitted_at = COALESCE(submitted_at, NOW()),
                         updated_at = NOW()
                     WHERE id = $1",
                )
                .bind(order.id)
                .execute(&mut *tx)
                .await?;

                ReservationService::reserve_stock_for_submitted_order(&mut tx, order.id)
                    .await?;
            }
            OrderStatus::Cancelled => {
                ReservationService::release_reservations_for_cancelled_order(
                    &mut tx,
                    order.id,
                    "order_cancelled",
                )
                .await?;
                sqlx::query(
                    "UPDATE orders
                     SET status = 'cancelled', cancelled_at = COALESCE(cancelled_at, NOW()),
                         updated_at = NOW()
                     WHERE id = $1",
                )
                .bind(order.id)
                .execute(&mut *tx)
                .await?;
            }
            OrderStatus::Draft | OrderStatus::Paid => unreachable!("rejected above"),
        }

        let response = Self::load_order_response(&mut tx, order.id).await?;
        tx.commit().await?;
        Ok(response)
    }

    /// Buyer-facing manual payment confirmation (`POST /orders/{id}/pay`).
    pub async fn pay_order(
        pool: &PgPool,
        user_id: i64,
        order_id: i64,
        payment_ref: &str,
        paid_amount: Decimal,
    ) -> Result<OrderResponse> {
        let mut tx = pool.begin().await?;
        PaymentService::confirm_manual_payment_for_order(
            &mut tx,
            order_id,
            user_id,
            payment_ref,
            paid_amount,
        )
        .await?;
        let response = Self::load_order_response(&mut tx, order_id).await?;
        tx.commit().await?;
        Ok(response)
    }

    /// Shared by guest checkout and admin manual orders: resolve the user,
    /// build the order, price it, freeze it, submit it and reserve stock,
    /// all in one transaction.
    pub async fn create_manual_submitted_order(
        conn: &mut PgConnection,
        contact: &ContactRequest,
        items: &[ManualOrderItemRequest],
    ) -> Result<CheckoutResult> {
        if items.is_empty() {
            return Err(Error::validation("items are required"));
        }

        let (user, user_created) = UserService::get_or_create_by_contact(conn, contact).await?;
        let order = Self::insert_draft(conn, user.id).await?;

        let mut aggregated: Vec<(i64, i32)> = Vec::new();
        for item in items {
            if item.quantity <= 0 {
                return Err(Error::validation("quantity must be greater than 0"));
            }
            match aggregated.iter_mut().find(|(vid, _)| *vid == item.variant_id) {
                Some((_, quantity)) => *quantity += item.quantity,
                None => aggregated.push((item.variant_id, item.quantity)),
            }
        }
        aggregated.sort_by_key(|(variant_id, _)| *variant_id);

        for (variant_id, quantity) in &aggregated {
            let variant = CatalogService::get_active_variant(conn, *variant_id)
                .await
                .map_err(|_| Error::validation(format!("variant {variant_id} not found")))?;

            sqlx::query(
                "INSERT INTO order_items
                     (order_id, product_id, variant_id, quantity, unit_price,
                      discount_amount, final_unit_price, line_total)
                 VALUES ($1, $2, $3, $4, $5, 0, $5, $5 * $4)",
            )
            .bind(order.id)
            .bind(variant.product_id)
            .bind(variant.id)
            .bind(quantity)
            .bind(variant.price)
            .execute(&mut *conn)
            .await?;
        }

        Self::reprice_order(conn, order.id, true).await?;
        let repriced = Self::get_order(conn, order.id).await?;
        validate_order_pricing_before_submit(aggregated.len(), repriced.total_amount)?;

        sqlx::query(
            "UPDATE orders
             SET status = 'submitted', pricing_frozen = TRUE,
                 pricing_frozen_at = COALESCE(pricing_frozen_at, NOW()),
                 submitted_at = COALESCE(submitted_at, NOW()),
                 updated_at = NOW()
             WHERE id = $1",
        )
        .bind(order.id)
        .execute(&mut *conn)
        .await?;

        ReservationService::reserve_stock_for_submitted_order(conn, order.id).await?;

        let response = Self::load_order_response(conn, order.id).await?;
        Ok(CheckoutResult {
            customer: user.into(),
            order: response,
            user_created,
        })
    }

    pub async fn submit_checkout_order(
        pool: &PgPool,
        contact: &ContactRequest,
        items: &[ManualOrderItemRequest],
    ) -> Result<CheckoutResult> {
        let mut tx = pool.begin().await?;
        let result = Self::create_manual_submitted_order(&mut tx, contact, items).await?;
        tx.commit().await?;
        Ok(result)
    }
}
