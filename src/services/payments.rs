//! Payment lifecycle: idempotent creation, single-active-pending per
//! `(order, method)`, manual confirmation, and reconciliation of normalized
//! provider state onto local rows.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use sqlx::PgConnection;

use crate::config::{AppConfig, MercadoPagoEnv};
use crate::error::{is_unique_violation, Error, Result};
use crate::models::{Order, OrderStatus, Payment, PaymentMethod, PaymentStatus};
use crate::services::mercadopago::MpProvider;
use crate::services::reservations::ReservationService;

const PAYMENT_COLUMNS: &str = "id, order_id, method, status, amount, currency, idempotency_key, \
     external_ref, provider_status, provider_payload, receipt_url, expires_at, paid_at, \
     created_at, updated_at";

const ORDER_COLUMNS: &str = "id, user_id, status, currency, subtotal, discount_total, total_amount, \
     pricing_frozen, pricing_frozen_at, submitted_at, paid_at, cancelled_at, expires_at, \
     created_at, updated_at";

/// Amount tolerance when reconciling provider-reported amounts.
fn amount_tolerance() -> Decimal {
    Decimal::new(1, 2)
}

/// Authoritative provider payment state, normalized for reconciliation.
#[derive(Debug, Clone)]
pub struct NormalizedMpPayment {
    pub provider_payment_id: String,
    pub provider_status: String,
    pub provider_status_detail: Option<String>,
    pub internal_status: PaymentStatus,
    pub external_reference: String,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub date_created: Option<String>,
    pub date_approved: Option<String>,
    pub date_last_updated: Option<String>,
    pub payment_method_id: Option<String>,
    pub payment_type_id: Option<String>,
    pub payer_id: Option<Value>,
    pub payer_email: Option<String>,
    pub metadata: Value,
    pub additional_info: Value,
    pub transaction_details: Value,
    pub raw: Value,
}

/// Provider status -> internal payment status.
pub fn map_mercadopago_provider_status(provider_status: &str) -> Result<PaymentStatus> {
    match provider_status.trim().to_lowercase().as_str() {
        "approved" | "accredited" => Ok(PaymentStatus::Paid),
        "pending" | "in_process" | "in_mediation" | "authorized" => Ok(PaymentStatus::Pending),
        "rejected" | "cancelled" | "canceled" => Ok(PaymentStatus::Cancelled),
        "expired" => Ok(PaymentStatus::Expired),
        "" => Err(Error::validation("provider_status is required")),
        _ => Err(Error::validation("unsupported mercadopago provider_status")),
    }
}

fn value_as_trimmed_string(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if raw.is_empty() {
        None
    } else {
        Some(raw)
    }
}

fn required_field(payload: &Value, field: &str) -> Result<String> {
    payload
        .get(field)
        .and_then(value_as_trimmed_string)
        .ok_or_else(|| Error::validation(format!("missing mercadopago {field}")))
}

fn decimal_field(payload: &Value, field: &str) -> Result<Option<Decimal>> {
    let Some(value) = payload.get(field) else {
        return Ok(None);
    };
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .to_string()
            .parse::<Decimal>()
            .map(Some)
            .map_err(|_| Error::validation(format!("invalid mercadopago {field}"))),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<Decimal>()
                .map(Some)
                .map_err(|_| Error::validation(format!("invalid mercadopago {field}")))
        }
        _ => Err(Error::validation(format!("invalid mercadopago {field}"))),
    }
}

fn object_or_empty(payload: &Value, field: &str) -> Value {
    match payload.get(field) {
        Some(value) if value.is_object() => value.clone(),
        _ => json!({}),
    }
}

fn optional_string(payload: &Value, field: &str) -> Option<String> {
    payload.get(field).and_then(value_as_trimmed_string)
}

/// Normalize a raw provider payment into the reconciler's shape. Requires
/// non-empty `id`, `status` and `external_reference`.
pub fn normalize_mp_payment_state(mp_payment: &Value) -> Result<NormalizedMpPayment> {
    if !mp_payment.is_object() {
        return Err(Error::validation("invalid mercadopago payment payload"));
    }

    let provider_payment_id = required_field(mp_payment, "id")?;
    let provider_status = required_field(mp_payment, "status")?.to_lowercase();
    let external_reference = required_field(mp_payment, "external_reference")?;
    let internal_status = map_mercadopago_provider_status(&provider_status)?;

    let currency = optional_string(mp_payment, "currency_id").map(|c| c.to_uppercase());
    let amount = decimal_field(mp_payment, "transaction_amount")?;

    let payer = object_or_empty(mp_payment, "payer");

    Ok(NormalizedMpPayment {
        provider_payment_id,
        provider_status,
        provider_status_detail: optional_string(mp_payment, "status_detail"),
        internal_status,
        external_reference,
        amount,
        currency,
        date_created: optional_string(mp_payment, "date_created"),
        date_approved: optional_string(mp_payment, "date_approved"),
        date_last_updated: optional_string(mp_payment, "date_last_updated"),
        payment_method_id: optional_string(mp_payment, "payment_method_id"),
        payment_type_id: optional_string(mp_payment, "payment_type_id"),
        payer_id: payer.get("id").cloned(),
        payer_email: payer.get("email").and_then(value_as_trimmed_string),
        metadata: object_or_empty(mp_payment, "metadata"),
        additional_info: object_or_empty(mp_payment, "additional_info"),
        transaction_details: object_or_empty(mp_payment, "transaction_details"),
        raw: mp_payment.clone(),
    })
}

/// Deterministic idempotency key for a manual confirmation:
/// `manual-order-<id>-<sha256(ref)[:16]>`.
pub fn manual_payment_idempotency_key(order_id: i64, payment_ref: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payment_ref.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("manual-order-{order_id}-{}", &digest[..16])
}

fn parse_provider_payload(raw: Option<&str>) -> Map<String, Value> {
    raw.and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|value| value.as_object().cloned())
        .unwrap_or_default()
}

fn checkout_preference_id(payload: &Map<String, Value>) -> Option<String> {
    payload
        .get("checkout")?
        .get("preference_id")
        .and_then(value_as_trimmed_string)
}

fn checkout_external_ref(payload: &Map<String, Value>) -> Option<String> {
    payload
        .get("checkout")?
        .get("external_ref")
        .and_then(value_as_trimmed_string)
}

pub struct PaymentService;

impl PaymentService {
    async fn get_payment_by_id(conn: &mut PgConnection, payment_id: i64) -> Result<Payment> {
        sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"
        ))
        .bind(payment_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found("payment not found"))
    }

    async fn find_by_idempotency_key(
        conn: &mut PgConnection,
        key: &str,
    ) -> Result<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(payment)
    }

    async fn order_owner(conn: &mut PgConnection, order_id: i64) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT user_id FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| Error::not_found("order not found"))
    }

    /// Replay guard: an existing payment for this idempotency key must match
    /// the requested order/method and be visible to the caller.
    async fn validate_replayed_payment(
        conn: &mut PgConnection,
        payment: Payment,
        order_id: i64,
        method: PaymentMethod,
        user_id: Option<i64>,
    ) -> Result<Payment> {
        if payment.order_id != order_id {
            return Err(Error::conflict(
                "idempotency key already used for a different order",
            ));
        }
        if payment.method != method {
            return Err(Error::conflict(
                "idempotency key already used for a different payment method",
            ));
        }
        if let Some(user_id) = user_id {
            if Self::order_owner(conn, payment.order_id).await? != user_id {
                return Err(Error::not_found("order not found"));
            }
        }
        Ok(payment)
    }

    async fn find_active_pending(
        conn: &mut PgConnection,
        order_id: i64,
        method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> Result<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE order_id = $1 AND method = $2 AND status = 'pending'
               AND (expires_at IS NULL OR expires_at > $3)
             ORDER BY created_at DESC, id DESC
             LIMIT 1"
        ))
        .bind(order_id)
        .bind(method)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(payment)
    }

    fn validate_active_pending_compatibility(
        active: &Payment,
        amount: Decimal,
        currency: &str,
    ) -> Result<()> {
        if active.amount.round_dp(2) != amount.round_dp(2) {
            return Err(Error::conflict(
                "there is already an active pending payment with a different amount",
            ));
        }
        if active.currency != currency {
            return Err(Error::conflict(
                "there is already an active pending payment with a different currency",
            ));
        }
        Ok(())
    }

    fn bank_transfer_payload(
        order_id: i64,
        payment_id: i64,
        amount: Decimal,
        currency: &str,
    ) -> Value {
        json!({
            "instructions": {
                "alias": "storefront.pagos",
                "bank_name": "Banco Demo",
                "reference": format!("ORDER-{order_id}-PAY-{payment_id}"),
                "amount": amount.to_f64(),
                "currency": currency,
            }
        })
    }

    async fn build_mercadopago_payload(
        config: &AppConfig,
        provider: &dyn MpProvider,
        order_id: i64,
        payment_id: i64,
        amount: Decimal,
        currency: &str,
        expires_at: DateTime<Utc>,
        payment_idempotency_key: &str,
    ) -> Result<(String, Value)> {
        let external_ref = format!("mp-order-{order_id}-pay-{payment_id}");
        let provider_idempotency_key = format!("mp-preference-{payment_idempotency_key}");
        let amount_number = amount.to_f64();

        let preference_payload = json!({
            "external_reference": external_ref,
            "items": [{
                "id": payment_id.to_string(),
                "title": format!("Order #{order_id}"),
                "quantity": 1,
                "currency_id": currency,
                "unit_price": amount_number,
            }],
            "back_urls": {
                "success": config.mercadopago_success_url,
                "failure": config.mercadopago_failure_url,
                "pending": config.mercadopago_pending_url,
            },
            "notification_url": config.mercadopago_notification_url,
            "expires": true,
            "date_of_expiration": expires_at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            "metadata": {
                "order_id": order_id,
                "payment_id": payment_id,
                "external_ref": external_ref,
                "currency": currency,
                "amount": amount_number,
            },
        });

        let provider_response = provider
            .create_preference(&preference_payload, &provider_idempotency_key)
            .await?;

        let init_point = provider_response.get("init_point").and_then(Value::as_str);
        let sandbox_init_point = provider_response
            .get("sandbox_init_point")
            .and_then(Value::as_str);
        let checkout_url = match config.mercadopago_env {
            MercadoPagoEnv::Sandbox => sandbox_init_point.or(init_point),
            MercadoPagoEnv::Production => init_point.or(sandbox_init_point),
        };

        let payload = json!({
            "checkout": {
                "provider": "mercadopago",
                "environment": config.mercadopago_env.as_str(),
                "external_ref": external_ref,
                "provider_idempotency_key": provider_idempotency_key,
                "preference_id": provider_response.get("id"),
                "checkout_url": checkout_url,
                "init_point": init_point,
                "sandbox_init_point": sandbox_init_point,
                "amount": amount_number,
                "currency": currency,
            }
        });
        Ok((external_ref, payload))
    }

    /// Create (or idempotently return) a payment for a submitted order.
    pub async fn create_payment_for_order(
        conn: &mut PgConnection,
        config: &AppConfig,
        provider: &dyn MpProvider,
        order_id: i64,
        method: PaymentMethod,
        user_id: Option<i64>,
        idempotency_key: &str,
        currency: Option<&str>,
        expires_in_minutes: i64,
    ) -> Result<Payment> {
        let now = Utc::now();
        ReservationService::expire_active_reservations(conn, now).await?;

        if expires_in_minutes <= 0 {
            return Err(Error::validation(
                "expires_in_minutes must be greater than 0",
            ));
        }
        let normalized_key = idempotency_key.trim().to_string();
        if normalized_key.is_empty() {
            return Err(Error::validation("idempotency_key is required"));
        }

        if let Some(existing) = Self::find_by_idempotency_key(conn, &normalized_key).await? {
            return Self::validate_replayed_payment(conn, existing, order_id, method, user_id)
                .await;
        }

        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(order_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found("order not found"))?;

        if let Some(user_id) = user_id {
            if order.user_id != user_id {
                return Err(Error::not_found("order not found"));
            }
        }
        if order.status == OrderStatus::Cancelled {
            return Err(Error::validation(
                "cannot create payment for a cancelled order",
            ));
        }
        if order.status != OrderStatus::Submitted {
            return Err(Error::validation(
                "payment can only be created for submitted orders",
            ));
        }

        let item_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM order_items WHERE order_id = $1")
                .bind(order_id)
                .fetch_one(&mut *conn)
                .await?;
        if item_count == 0 {
            return Err(Error::validation("cannot create payment for an empty order"));
        }

        if ReservationService::list_active(conn, order_id).await?.is_empty() {
            return Err(Error::validation("order has no active stock reservations"));
        }

        let amount = order.total_amount.round_dp(2);
        if amount <= Decimal::ZERO {
            return Err(Error::validation("order total must be greater than 0"));
        }

        let payment_currency = currency
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(&order.currency)
            .to_string();

        if let Some(active) = Self::find_active_pending(conn, order_id, method, now).await? {
            Self::validate_active_pending_compatibility(&active, amount, &payment_currency)?;
            return Ok(active);
        }

        let expires_at = now + Duration::minutes(expires_in_minutes);

        // The unique key and the partial pending index resolve creation
        // races: on violation, re-query and return the winner.
        let insert_result = {
            let mut savepoint = sqlx::Connection::begin(&mut *conn).await?;
            let result = sqlx::query_as::<_, Payment>(&format!(
                "INSERT INTO payments (order_id, method, status, amount, currency, idempotency_key, expires_at)
                 VALUES ($1, $2, 'pending', $3, $4, $5, $6)
                 RETURNING {PAYMENT_COLUMNS}"
            ))
            .bind(order_id)
            .bind(method)
            .bind(amount)
            .bind(&payment_currency)
            .bind(&normalized_key)
            .bind(expires_at)
            .fetch_one(&mut *savepoint)
            .await;
            match result {
                Ok(payment) => {
                    savepoint.commit().await?;
                    Ok(payment)
                }
                Err(err) => {
                    savepoint.rollback().await?;
                    Err(err)
                }
            }
        };

        let payment = match insert_result {
            Ok(payment) => payment,
            Err(err) if is_unique_violation(&err) => {
                if let Some(existing) =
                    Self::find_by_idempotency_key(conn, &normalized_key).await?
                {
                    return Self::validate_replayed_payment(
                        conn, existing, order_id, method, user_id,
                    )
                    .await;
                }
                if let Some(active) =
                    Self::find_active_pending(conn, order_id, method, now).await?
                {
                    Self::validate_active_pending_compatibility(
                        &active,
                        amount,
                        &payment_currency,
                    )?;
                    return Ok(active);
                }
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        match method {
            PaymentMethod::BankTransfer => {
                let payload =
                    Self::bank_transfer_payload(order_id, payment.id, amount, &payment_currency);
                sqlx::query(
                    "UPDATE payments SET provider_payload = $1, updated_at = NOW() WHERE id = $2",
                )
                .bind(payload.to_string())
                .bind(payment.id)
                .execute(&mut *conn)
                .await?;
            }
            PaymentMethod::Mercadopago => {
                let existing_payload = parse_provider_payload(payment.provider_payload.as_deref());
                if checkout_preference_id(&existing_payload).is_some() {
                    // A preference already exists; reuse it without another
                    // provider round-trip.
                    let external_ref = checkout_external_ref(&existing_payload);
                    sqlx::query(
                        "UPDATE payments
                         SET external_ref = COALESCE(external_ref, $1),
                             provider_status = COALESCE(provider_status, 'preference_created'),
                             updated_at = NOW()
                         WHERE id = $2",
                    )
                    .bind(&external_ref)
                    .bind(payment.id)
                    .execute(&mut *conn)
                    .await?;
                } else {
                    let (external_ref, payload) = Self::build_mercadopago_payload(
                        config,
                        provider,
                        order_id,
                        payment.id,
                        amount,
                        &payment_currency,
                        expires_at,
                        &normalized_key,
                    )
                    .await?;
                    sqlx::query(
                        "UPDATE payments
                         SET external_ref = $1, provider_status = 'preference_created',
                             provider_payload = $2, updated_at = NOW()
                         WHERE id = $3",
                    )
                    .bind(&external_ref)
                    .bind(payload.to_string())
                    .bind(payment.id)
                    .execute(&mut *conn)
                    .await?;
                }
            }
        }

        Self::get_payment_by_id(conn, payment.id).await
    }

    /// Buyer/admin manual confirmation. Re-confirming an already-paid order
    /// succeeds only when an existing paid payment matches both reference
    /// and amount.
    pub async fn confirm_manual_payment_for_order(
        conn: &mut PgConnection,
        order_id: i64,
        user_id: i64,
        payment_ref: &str,
        paid_amount: Decimal,
    ) -> Result<Payment> {
        let now = Utc::now();
        ReservationService::expire_active_reservations(conn, now).await?;

        let normalized_ref = payment_ref.trim().to_string();
        if normalized_ref.is_empty() {
            return Err(Error::validation("payment_ref is required"));
        }
        if paid_amount <= Decimal::ZERO {
            return Err(Error::validation("paid_amount must be greater than 0"));
        }

        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(order_id)
        .fetch_optional(&mut *conn)
        .await?
        .filter(|order| order.user_id == user_id)
        .ok_or_else(|| Error::not_found("order not found"))?;

        if order.status == OrderStatus::Cancelled {
            return Err(Error::validation("cannot pay a cancelled order"));
        }
        if !matches!(order.status, OrderStatus::Submitted | OrderStatus::Paid) {
            return Err(Error::validation(
                "order can only be paid from submitted status",
            ));
        }

        let item_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM order_items WHERE order_id = $1")
                .bind(order_id)
                .fetch_one(&mut *conn)
                .await?;
        if item_count == 0 {
            return Err(Error::validation("cannot pay an empty order"));
        }

        let expected_total = order.total_amount.round_dp(2);
        let received_total = paid_amount.round_dp(2);
        if expected_total != received_total {
            return Err(Error::validation("paid_amount does not match order total"));
        }

        let existing_paid_by_ref = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE order_id = $1 AND status = 'paid' AND external_ref = $2
             ORDER BY created_at DESC, id DESC
             LIMIT 1"
        ))
        .bind(order_id)
        .bind(&normalized_ref)
        .fetch_optional(&mut *conn)
        .await?;

        if order.status == OrderStatus::Paid {
            if let Some(existing) = existing_paid_by_ref {
                if existing.amount.round_dp(2) == received_total {
                    return Ok(existing);
                }
            }
            return Err(Error::validation(
                "order already paid with a different payment_ref",
            ));
        }

        ReservationService::consume_reservations_for_paid_order(conn, order_id).await?;

        let confirmation_payload = json!({
            "manual_confirmation": {
                "payment_ref": normalized_ref,
                "confirmed_at": now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            }
        })
        .to_string();

        let payment = match existing_paid_by_ref {
            Some(existing) => {
                sqlx::query_as::<_, Payment>(&format!(
                    "UPDATE payments
                     SET status = 'paid', amount = $1, currency = $2, external_ref = $3,
                         provider_status = 'manual_confirmed', provider_payload = $4,
                         paid_at = $5, updated_at = $5
                     WHERE id = $6
                     RETURNING {PAYMENT_COLUMNS}"
                ))
                .bind(received_total)
                .bind(&order.currency)
                .bind(&normalized_ref)
                .bind(&confirmation_payload)
                .bind(now)
                .bind(existing.id)
                .fetch_one(&mut *conn)
                .await?
            }
            None => {
                sqlx::query_as::<_, Payment>(&format!(
                    "INSERT INTO payments
                         (order_id, method, status, amount, currency, idempotency_key,
                          external_ref, provider_status, provider_payload, paid_at)
                     VALUES ($1, 'bank_transfer', 'paid', $2, $3, $4, $5, 'manual_confirmed', $6, $7)
                     RETURNING {PAYMENT_COLUMNS}"
                ))
                .bind(order_id)
                .bind(received_total)
                .bind(&order.currency)
                .bind(manual_payment_idempotency_key(order_id, &normalized_ref))
                .bind(&normalized_ref)
                .bind(&confirmation_payload)
                .bind(now)
                .fetch_one(&mut *conn)
                .await?
            }
        };

        sqlx::query(
            "UPDATE orders
             SET status = 'paid', paid_at = COALESCE(paid_at, $2), updated_at = $2
             WHERE id = $1",
        )
        .bind(order_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        tracing::info!(order_id, payment_id = payment.id, "manual payment confirmed");
        Ok(payment)
    }

    /// Apply a normalized provider state onto a local payment, enforcing the
    /// payment transition table and driving the order's paid/cancelled
    /// side effects.
    pub async fn apply_mercadopago_normalized_state(
        conn: &mut PgConnection,
        payment_id: i64,
        normalized: &NormalizedMpPayment,
        notification_payload: Option<&Value>,
    ) -> Result<Payment> {
        let now = Utc::now();
        ReservationService::expire_active_reservations(conn, now).await?;

        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE id = $1 AND method = 'mercadopago' FOR UPDATE"
        ))
        .bind(payment_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found("payment not found"))?;

        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(payment.order_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found("order not found"))?;

        let payment_external_ref = payment
            .external_ref
            .as_deref()
            .map(str::trim)
            .unwrap_or("");
        if payment_external_ref != normalized.external_reference {
            return Err(Error::validation("external_reference does not match payment"));
        }

        let amount_consistent = normalized
            .amount
            .map(|amount| (payment.amount - amount).abs() <= amount_tolerance())
            .unwrap_or(true);
        if !amount_consistent {
            return Err(Error::validation("payment amount mismatch"));
        }
        let currency_consistent = normalized
            .currency
            .as_deref()
            .map(|currency| payment.currency.trim().to_uppercase() == currency)
            .unwrap_or(true);
        if !currency_consistent {
            return Err(Error::validation("payment currency mismatch"));
        }

        if !payment.status.can_transition_to(normalized.internal_status) {
            return Err(Error::validation("invalid payment status transition"));
        }

        let mut merged = parse_provider_payload(payment.provider_payload.as_deref());
        if let Some(notification) = notification_payload {
            merged.insert("last_event".to_string(), notification.clone());
        }
        merged.insert("payment_lookup".to_string(), normalized.raw.clone());
        merged.insert(
            "reconciliation".to_string(),
            json!({
                "provider_payment_id": normalized.provider_payment_id,
                "external_reference": normalized.external_reference,
                "provider_status": normalized.provider_status,
                "provider_status_detail": normalized.provider_status_detail,
                "internal_status": normalized.internal_status,
                "amount_consistent": amount_consistent,
                "currency_consistent": currency_consistent,
                "date_last_updated": normalized.date_last_updated,
            }),
        );

        let next_status = normalized.internal_status;
        let paid_at = match (payment.paid_at, next_status) {
            (None, PaymentStatus::Paid) => Some(now),
            (existing, _) => existing,
        };

        sqlx::query(
            "UPDATE payments
             SET status = $1, provider_status = $2, provider_payload = $3,
                 paid_at = $4, updated_at = $5
             WHERE id = $6",
        )
        .bind(next_status)
        .bind(&normalized.provider_status)
        .bind(Value::Object(merged).to_string())
        .bind(paid_at)
        .bind(now)
        .bind(payment.id)
        .execute(&mut *conn)
        .await?;

        match next_status {
            PaymentStatus::Paid => {
                if !matches!(order.status, OrderStatus::Submitted | OrderStatus::Paid) {
                    return Err(Error::validation(
                        "order can only be paid from submitted status",
                    ));
                }
                if order.status == OrderStatus::Submitted {
                    ReservationService::consume_reservations_for_paid_order(conn, order.id)
                        .await?;
                }
                sqlx::query(
                    "UPDATE orders
                     SET status = 'paid', paid_at = COALESCE(paid_at, $2), updated_at = $2
                     WHERE id = $1",
                )
                .bind(order.id)
                .bind(now)
                .execute(&mut *conn)
                .await?;
            }
            PaymentStatus::Cancelled if order.status != OrderStatus::Paid => {
                ReservationService::release_reservations_for_cancelled_order(
                    conn,
                    order.id,
                    "order_cancelled",
                )
                .await?;
                sqlx::query(
                    "UPDATE orders
                     SET status = 'cancelled', cancelled_at = COALESCE(cancelled_at, $2),
                         updated_at = $2
                     WHERE id = $1",
                )
                .bind(order.id)
                .bind(now)
                .execute(&mut *conn)
                .await?;
            }
            _ => {}
        }

        Self::get_payment_by_id(conn, payment.id).await
    }

    /// Local payment matching a provider notification, by external ref.
    pub async fn find_payment_for_mercadopago_event(
        conn: &mut PgConnection,
        external_ref: &str,
    ) -> Result<Option<Payment>> {
        let external_ref = external_ref.trim();
        if external_ref.is_empty() {
            return Err(Error::validation("external_ref is required"));
        }
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE method = 'mercadopago' AND external_ref = $1
             ORDER BY created_at DESC, id DESC
             LIMIT 1"
        ))
        .bind(external_ref)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(payment)
    }

    pub async fn list_payments_for_order(
        conn: &mut PgConnection,
        order_id: i64,
        user_id: i64,
    ) -> Result<Vec<Payment>> {
        let owner = Self::order_owner(conn, order_id).await?;
        if owner != user_id {
            return Err(Error::not_found("order not found"));
        }

        let payments = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE order_id = $1
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(order_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(payments)
    }

    pub async fn get_payment_for_user(
        conn: &mut PgConnection,
        payment_id: i64,
        user_id: i64,
    ) -> Result<Payment> {
        sqlx::query_as::<_, Payment>(&format!(
            "SELECT p.id, p.order_id, p.method, p.status, p.amount, p.currency, p.idempotency_key,
                    p.external_ref, p.provider_status, p.provider_payload, p.receipt_url,
                    p.expires_at, p.paid_at, p.created_at, p.updated_at
             FROM payments p
             JOIN orders o ON o.id = p.order_id
             WHERE p.id = $1 AND o.user_id = $2"
        ))
        .bind(payment_id)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found("payment not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_provider_status_mapping() {
        assert_eq!(
            map_mercadopago_provider_status("approved").unwrap(),
            PaymentStatus::Paid
        );
        assert_eq!(
            map_mercadopago_provider_status("ACCREDITED").unwrap(),
            PaymentStatus::Paid
        );
        for status in ["pending", "in_process", "in_mediation", "authorized"] {
            assert_eq!(
                map_mercadopago_provider_status(status).unwrap(),
                PaymentStatus::Pending
            );
        }
        for status in ["rejected", "cancelled", "canceled"] {
            assert_eq!(
                map_mercadopago_provider_status(status).unwrap(),
                PaymentStatus::Cancelled
            );
        }
        assert_eq!(
            map_mercadopago_provider_status("expired").unwrap(),
            PaymentStatus::Expired
        );
        assert!(map_mercadopago_provider_status("refunded").is_err());
        assert!(map_mercadopago_provider_status("  ").is_err());
    }

    #[test]
    fn test_normalize_requires_core_fields() {
        let full = json!({
            "id": 123,
            "status": "Approved",
            "external_reference": "mp-order-1-pay-2",
            "transaction_amount": 150.5,
            "currency_id": "ars",
            "status_detail": "accredited",
            "payer": {"id": 9, "email": "buyer@example.com"},
            "metadata": {"order_id": 1},
        });
        let normalized = normalize_mp_payment_state(&full).unwrap();
        assert_eq!(normalized.provider_payment_id, "123");
        assert_eq!(normalized.provider_status, "approved");
        assert_eq!(normalized.internal_status, PaymentStatus::Paid);
        assert_eq!(normalized.external_reference, "mp-order-1-pay-2");
        assert_eq!(normalized.amount, Some(dec!(150.5)));
        assert_eq!(normalized.currency.as_deref(), Some("ARS"));
        assert_eq!(normalized.payer_email.as_deref(), Some("buyer@example.com"));
        assert_eq!(normalized.metadata["order_id"], 1);

        for missing in ["id", "status", "external_reference"] {
            let mut payload = full.clone();
            payload.as_object_mut().unwrap().remove(missing);
            assert!(normalize_mp_payment_state(&payload).is_err());
        }
        assert!(normalize_mp_payment_state(&json!("not an object")).is_err());
    }

    #[test]
    fn test_normalize_amount_parsing() {
        let base = json!({
            "id": "1", "status": "pending", "external_reference": "x",
        });
        let mut with_string = base.clone();
        with_string["transaction_amount"] = json!("99.90");
        assert_eq!(
            normalize_mp_payment_state(&with_string).unwrap().amount,
            Some(dec!(99.90))
        );

        let mut with_null = base.clone();
        with_null["transaction_amount"] = Value::Null;
        assert_eq!(normalize_mp_payment_state(&with_null).unwrap().amount, None);

        let mut with_garbage = base;
        with_garbage["transaction_amount"] = json!("abc");
        assert!(normalize_mp_payment_state(&with_garbage).is_err());
    }

    #[test]
    fn test_manual_idempotency_key_shape() {
        let key = manual_payment_idempotency_key(7, "TX1");
        assert!(key.starts_with("manual-order-7-"));
        assert_eq!(key.len(), "manual-order-7-".len() + 16);
        // Deterministic per (order, ref); distinct per ref.
        assert_eq!(key, manual_payment_idempotency_key(7, "TX1"));
        assert_ne!(key, manual_payment_idempotency_key(7, "TX2"));
        assert_ne!(key, manual_payment_idempotency_key(8, "TX1"));
    }

    #[test]
    fn test_checkout_payload_helpers() {
        let payload = parse_provider_payload(Some(
            r#"{"checkout":{"preference_id":"pref-1","external_ref":"mp-order-1-pay-2"}}"#,
        ));
        assert_eq!(checkout_preference_id(&payload).as_deref(), Some("pref-1"));
        assert_eq!(
            checkout_external_ref(&payload).as_deref(),
            Some("mp-order-1-pay-2")
        );

        assert!(parse_provider_payload(None).is_empty());
        assert!(parse_provider_payload(Some("not json")).is_empty());
        assert!(checkout_preference_id(&parse_provider_payload(Some("{}"))).is_none());
    }
}
