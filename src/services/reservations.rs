//! Stock reservation manager: reserve-on-submit, TTL expiration with a
//! single permitted reactivation, cascade-to-cancel, consume-on-pay and
//! release-on-cancel.
//!
//! Every entry point expires due reservations first so callers never observe
//! logically-stale active rows. Variant rows are locked in ascending
//! `variant_id` order.

use chrono::{DateTime, Duration, Utc};
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::models::{Order, OrderItem, OrderStatus, StockReservation};

pub const RESERVATION_TTL_HOURS: i64 = 42;
pub const REACTIVATION_TTL_HOURS: i64 = 12;
pub const MAX_REACTIVATIONS: i32 = 1;

const RESERVATION_COLUMNS: &str = "id, order_id, order_item_id, variant_id, quantity, status, \
     reactivation_count, expires_at, consumed_at, released_at, reason, created_at, updated_at";

const ORDER_COLUMNS: &str = "id, user_id, status, currency, subtotal, discount_total, total_amount, \
     pricing_frozen, pricing_frozen_at, submitted_at, paid_at, cancelled_at, expires_at, \
     created_at, updated_at";

/// Facts about one expiring reservation, for the pure expiration decision.
#[derive(Debug, Clone)]
pub struct ExpiringReservation {
    pub variant_id: i64,
    pub quantity: i32,
    pub reactivation_count: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationOutcome {
    /// Order is not submitted; the reservations stay expired.
    MarkExpired,
    /// Order is submitted and stock still fits every line.
    Reactivate,
    /// Reactivation budget exhausted or stock no longer fits.
    CascadeCancel,
}

/// Decide what happens to a submitted order whose reservations just expired.
/// `available_by_variant` holds the availability computed after the
/// reservations were marked expired.
pub fn classify_expiration_outcome(
    order_status: OrderStatus,
    reservations: &[ExpiringReservation],
    available_by_variant: &HashMap<i64, i64>,
    max_reactivations: i32,
) -> ExpirationOutcome {
    if order_status != OrderStatus::Submitted {
        return ExpirationOutcome::MarkExpired;
    }
    if reservations
        .iter()
        .any(|r| r.reactivation_count >= max_reactivations)
    {
        return ExpirationOutcome::CascadeCancel;
    }

    let mut required: HashMap<i64, i64> = HashMap::new();
    for reservation in reservations {
        *required.entry(reservation.variant_id).or_default() += i64::from(reservation.quantity);
    }
    for (variant_id, quantity) in required {
        let available = available_by_variant.get(&variant_id).copied().unwrap_or(0);
        if available < quantity {
            return ExpirationOutcome::CascadeCancel;
        }
    }
    ExpirationOutcome::Reactivate
}

pub struct ReservationService;

impl ReservationService {
    async fn lock_order(conn: &mut PgConnection, order_id: i64) -> Result<Order> {
        sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(order_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found("order not found"))
    }

    async fn lock_order_items(conn: &mut PgConnection, order_id: i64) -> Result<Vec<OrderItem>> {
        let items = sqlx::query_as::<_, OrderItem>(
            "SELECT id, order_id, product_id, variant_id, quantity, unit_price, discount_id,
                    discount_amount, final_unit_price, line_total
             FROM order_items WHERE order_id = $1 ORDER BY id ASC FOR UPDATE",
        )
        .bind(order_id)
        .fetch_all(&mut *conn)
        .await?;
        if items.is_empty() {
            return Err(Error::validation("order has no items"));
        }
        Ok(items)
    }

    /// Locks the variant row and returns its availability at `now`, i.e.
    /// stock minus active non-expired reserved quantity. `None` when the
    /// variant is missing or inactive.
    async fn variant_availability(
        conn: &mut PgConnection,
        variant_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let row: Option<(i32, bool)> = sqlx::query_as(
            "SELECT stock, is_active FROM product_variants WHERE id = $1 FOR UPDATE",
        )
        .bind(variant_id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some((stock, is_active)) = row else {
            return Ok(None);
        };
        if !is_active {
            return Ok(None);
        }

        let reserved: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(quantity), 0)::BIGINT
             FROM stock_reservations
             WHERE variant_id = $1 AND status = 'active' AND expires_at > $2",
        )
        .bind(variant_id)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;

        Ok(Some((i64::from(stock) - reserved).max(0)))
    }

    async fn active_reservations_for_order(
        conn: &mut PgConnection,
        order_id: i64,
    ) -> Result<Vec<StockReservation>> {
        let reservations = sqlx::query_as::<_, StockReservation>(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM stock_reservations
             WHERE order_id = $1 AND status = 'active'
             ORDER BY id ASC FOR UPDATE"
        ))
        .bind(order_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(reservations)
    }

    /// Expire every active reservation whose TTL elapsed, then decide per
    /// order: keep expired, reactivate once, or cascade the order (and its
    /// pending payments) to cancelled. Returns the count of reservations
    /// that ended up expired; reactivated ones are not counted.
    pub async fn expire_active_reservations(
        conn: &mut PgConnection,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let due = sqlx::query_as::<_, StockReservation>(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM stock_reservations
             WHERE status = 'active' AND expires_at <= $1
             ORDER BY order_id ASC, id ASC FOR UPDATE"
        ))
        .bind(now)
        .fetch_all(&mut *conn)
        .await?;

        if due.is_empty() {
            return Ok(0);
        }

        let mut expired_count: i64 = 0;
        let mut index = 0;
        while index < due.len() {
            let order_id = due[index].order_id;
            let mut group = Vec::new();
            while index < due.len() && due[index].order_id == order_id {
                group.push(due[index].clone());
                index += 1;
            }
            expired_count += Self::expire_order_group(conn, order_id, &group, now).await?;
        }
        Ok(expired_count)
    }

    async fn expire_order_group(
        conn: &mut PgConnection,
        order_id: i64,
        group: &[StockReservation],
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let order = Self::lock_order(conn, order_id).await?;
        let group_ids: Vec<i64> = group.iter().map(|r| r.id).collect();

        // Starting hypothesis: everything in the group is expired.
        sqlx::query(
            "UPDATE stock_reservations
             SET status = 'expired', released_at = $2, reason = 'reservation_expired', updated_at = $2
             WHERE id = ANY($1)",
        )
        .bind(&group_ids)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        let expiring: Vec<ExpiringReservation> = group
            .iter()
            .map(|r| ExpiringReservation {
                variant_id: r.variant_id,
                quantity: r.quantity,
                reactivation_count: r.reactivation_count,
            })
            .collect();

        let mut available_by_variant = HashMap::new();
        if order.status == OrderStatus::Submitted {
            let mut variant_ids: Vec<i64> = group.iter().map(|r| r.variant_id).collect();
            variant_ids.sort_unstable();
            variant_ids.dedup();
            for variant_id in variant_ids {
                let available = Self::variant_availability(conn, variant_id, now)
                    .await?
                    .unwrap_or(0);
                available_by_variant.insert(variant_id, available);
            }
        }

        match classify_expiration_outcome(
            order.status,
            &expiring,
            &available_by_variant,
            MAX_REACTIVATIONS,
        ) {
            ExpirationOutcome::MarkExpired => Ok(group_ids.len() as i64),
            ExpirationOutcome::Reactivate => {
                let new_expiry = now + Duration::hours(REACTIVATION_TTL_HOURS);
                sqlx::query(
                    "UPDATE stock_reservations
                     SET status = 'active', reactivation_count = reactivation_count + 1,
                         expires_at = $2, released_at = NULL, consumed_at = NULL,
                         reason = NULL, updated_at = $3
                     WHERE id = ANY($1)",
                )
                .bind(&group_ids)
                .bind(new_expiry)
                .bind(now)
                .execute(&mut *conn)
                .await?;
                tracing::info!(
                    order_id,
                    count = group_ids.len() as u64,
                    "reactivated expired reservations"
                );
                Ok(0)
            }
            ExpirationOutcome::CascadeCancel => {
                sqlx::query(
                    "UPDATE orders
                     SET status = 'cancelled', cancelled_at = COALESCE(cancelled_at, $2), updated_at = $2
                     WHERE id = $1",
                )
                .bind(order_id)
                .bind(now)
                .execute(&mut *conn)
                .await?;

                let cancelled_payments = sqlx::query(
                    "UPDATE payments
                     SET status = 'cancelled',
                         provider_status = 'order_cancelled_reservation_expired',
                         updated_at = $2
                     WHERE order_id = $1 AND status = 'pending'",
                )
                .bind(order_id)
                .bind(now)
                .execute(&mut *conn)
                .await?
                .rows_affected();

                tracing::warn!(
                    order_id,
                    reservations = group_ids.len() as u64,
                    cancelled_payments,
                    "reservation expiry cascaded to order cancellation"
                );
                Ok(group_ids.len() as i64)
            }
        }
    }

    /// Reserve stock for every item of a submitted (or submitting) order.
    /// All-or-nothing; idempotent when every item already holds an active
    /// reservation.
    pub async fn reserve_stock_for_submitted_order(
        conn: &mut PgConnection,
        order_id: i64,
    ) -> Result<Vec<StockReservation>> {
        let now = Utc::now();
        Self::expire_active_reservations(conn, now).await?;

        let order = Self::lock_order(conn, order_id).await?;
        let items = Self::lock_order_items(conn, order_id).await?;
        if !matches!(order.status, OrderStatus::Draft | OrderStatus::Submitted) {
            return Err(Error::validation(
                "stock can only be reserved for draft/submitted orders",
            ));
        }

        let existing = Self::active_reservations_for_order(conn, order_id).await?;
        if !existing.is_empty() && existing.len() == items.len() {
            return Ok(existing);
        }

        let reserved_item_ids: Vec<i64> = existing.iter().map(|r| r.order_item_id).collect();
        let mut missing: Vec<&OrderItem> = items
            .iter()
            .filter(|item| !reserved_item_ids.contains(&item.id))
            .collect();

        // Validate availability first, locking variants in ascending order.
        missing.sort_by_key(|item| item.variant_id);
        for item in &missing {
            let available = Self::variant_availability(conn, item.variant_id, now)
                .await?
                .ok_or_else(|| {
                    Error::validation(format!("variant {} not found", item.variant_id))
                })?;
            if available < i64::from(item.quantity) {
                return Err(Error::validation(format!(
                    "insufficient stock for variant {}",
                    item.variant_id
                )));
            }
        }

        let expires_at = now + Duration::hours(RESERVATION_TTL_HOURS);
        for item in &missing {
            sqlx::query(
                "INSERT INTO stock_reservations
                     (order_id, order_item_id, variant_id, quantity, status, reactivation_count, expires_at)
                 VALUES ($1, $2, $3, $4, 'active', 0, $5)",
            )
            .bind(order_id)
            .bind(item.id)
            .bind(item.variant_id)
            .bind(item.quantity)
            .bind(expires_at)
            .execute(&mut *conn)
            .await?;
        }

        Self::active_reservations_for_order(conn, order_id).await
    }

    /// Apply active reservations to physical stock when an order is paid.
    /// Idempotent when the order is already paid and only consumed
    /// reservations remain.
    pub async fn consume_reservations_for_paid_order(
        conn: &mut PgConnection,
        order_id: i64,
    ) -> Result<Vec<StockReservation>> {
        let now = Utc::now();
        Self::expire_active_reservations(conn, now).await?;

        let order = Self::lock_order(conn, order_id).await?;
        Self::lock_order_items(conn, order_id).await?;
        if !matches!(order.status, OrderStatus::Submitted | OrderStatus::Paid) {
            return Err(Error::validation(
                "order can only be paid from submitted status",
            ));
        }

        let mut active = Self::active_reservations_for_order(conn, order_id).await?;
        if active.is_empty() {
            let consumed = sqlx::query_as::<_, StockReservation>(&format!(
                "SELECT {RESERVATION_COLUMNS} FROM stock_reservations
                 WHERE order_id = $1 AND status = 'consumed'
                 ORDER BY id ASC"
            ))
            .bind(order_id)
            .fetch_all(&mut *conn)
            .await?;
            if !consumed.is_empty() && order.status == OrderStatus::Paid {
                return Ok(consumed);
            }
            return Err(Error::validation("no active reservations for order"));
        }

        active.sort_by_key(|r| r.variant_id);
        for reservation in &active {
            let updated = sqlx::query(
                "UPDATE product_variants SET stock = stock - $1 WHERE id = $2 AND stock >= $1",
            )
            .bind(reservation.quantity)
            .bind(reservation.variant_id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
            if updated != 1 {
                return Err(Error::validation(format!(
                    "insufficient stock for variant {}",
                    reservation.variant_id
                )));
            }

            sqlx::query(
                "UPDATE stock_reservations
                 SET status = 'consumed', consumed_at = $2, reason = 'order_paid', updated_at = $2
                 WHERE id = $1",
            )
            .bind(reservation.id)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }

        let consumed = sqlx::query_as::<_, StockReservation>(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM stock_reservations
             WHERE order_id = $1 AND status = 'consumed'
             ORDER BY id ASC"
        ))
        .bind(order_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(consumed)
    }

    /// Release all active reservations of a cancelled order. Returns the
    /// released count.
    pub async fn release_reservations_for_cancelled_order(
        conn: &mut PgConnection,
        order_id: i64,
        reason: &str,
    ) -> Result<i64> {
        let now = Utc::now();
        Self::expire_active_reservations(conn, now).await?;
        Self::lock_order(conn, order_id).await?;

        let released = sqlx::query(
            "UPDATE stock_reservations
             SET status = 'released', released_at = $2, reason = $3, updated_at = $2
             WHERE order_id = $1 AND status = 'active'",
        )
        .bind(order_id)
        .bind(now)
        .bind(reason)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        Ok(released as i64)
    }

    pub async fn list_active(
        conn: &mut PgConnection,
        order_id: i64,
    ) -> Result<Vec<StockReservation>> {
        Self::expire_active_reservations(conn, Utc::now()).await?;
        let reservations = sqlx::query_as::<_, StockReservation>(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM stock_reservations
             WHERE order_id = $1 AND status = 'active'
             ORDER BY id ASC"
        ))
        .bind(order_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(reservations)
    }

    pub async fn list_all(
        conn: &mut PgConnection,
        order_id: i64,
    ) -> Result<Vec<StockReservation>> {
        Self::expire_active_reservations(conn, Utc::now()).await?;
        let reservations = sqlx::query_as::<_, StockReservation>(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM stock_reservations
             WHERE order_id = $1 ORDER BY id ASC"
        ))
        .bind(order_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(reservations)
    }

    /// One sweep in its own transaction; used by the admin endpoint and the
    /// background task.
    pub async fn sweep_expired(pool: &PgPool) -> Result<i64> {
        let mut tx = pool.begin().await?;
        let expired = Self::expire_active_reservations(&mut tx, Utc::now()).await?;
        tx.commit().await?;
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(variant_id: i64, quantity: i32, reactivation_count: i32) -> ExpiringReservation {
        ExpiringReservation {
            variant_id,
            quantity,
            reactivation_count,
        }
    }

    #[test]
    fn test_non_submitted_orders_stay_expired() {
        let available = HashMap::from([(1, 10)]);
        for status in [OrderStatus::Draft, OrderStatus::Paid, OrderStatus::Cancelled] {
            assert_eq!(
                classify_expiration_outcome(status, &[reservation(1, 2, 0)], &available, 1),
                ExpirationOutcome::MarkExpired
            );
        }
    }

    #[test]
    fn test_submitted_with_stock_reactivates() {
        let available = HashMap::from([(1, 2)]);
        assert_eq!(
            classify_expiration_outcome(
                OrderStatus::Submitted,
                &[reservation(1, 2, 0)],
                &available,
                1
            ),
            ExpirationOutcome::Reactivate
        );
    }

    #[test]
    fn test_reactivation_budget_exhausted_cancels() {
        let available = HashMap::from([(1, 10)]);
        assert_eq!(
            classify_expiration_outcome(
                OrderStatus::Submitted,
                &[reservation(1, 1, 1)],
                &available,
                1
            ),
            ExpirationOutcome::CascadeCancel
        );
        // One reservation over budget poisons the whole order.
        assert_eq!(
            classify_expiration_outcome(
                OrderStatus::Submitted,
                &[reservation(1, 1, 0), reservation(2, 1, 1)],
                &available,
                1
            ),
            ExpirationOutcome::CascadeCancel
        );
    }

    #[test]
    fn test_insufficient_stock_cancels() {
        let available = HashMap::from([(1, 1)]);
        assert_eq!(
            classify_expiration_outcome(
                OrderStatus::Submitted,
                &[reservation(1, 2, 0)],
                &available,
                1
            ),
            ExpirationOutcome::CascadeCancel
        );
    }

    #[test]
    fn test_unknown_variant_counts_as_zero_availability() {
        let available = HashMap::new();
        assert_eq!(
            classify_expiration_outcome(
                OrderStatus::Submitted,
                &[reservation(9, 1, 0)],
                &available,
                1
            ),
            ExpirationOutcome::CascadeCancel
        );
    }

    #[test]
    fn test_same_variant_requirements_accumulate() {
        // Two lines of 2 each on a variant with 3 available must not fit.
        let available = HashMap::from([(1, 3)]);
        assert_eq!(
            classify_expiration_outcome(
                OrderStatus::Submitted,
                &[reservation(1, 2, 0), reservation(1, 2, 0)],
                &available,
                1
            ),
            ExpirationOutcome::CascadeCancel
        );
        let available = HashMap::from([(1, 4)]);
        assert_eq!(
            classify_expiration_outcome(
                OrderStatus::Submitted,
                &[reservation(1, 2, 0), reservation(1, 2, 0)],
                &available,
                1
            ),
            ExpirationOutcome::Reactivate
        );
    }
}
