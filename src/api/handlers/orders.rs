//! Order handlers: draft lifecycle, status transitions, manual pay and
//! payment creation/listing.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::middleware::AuthUser;
use crate::error::{Error, Result};
use crate::models::{
    AddOrderItemRequest, CreateOrderPaymentRequest, PayOrderRequest, PaymentResponse,
    UpdateOrderStatusRequest,
};
use crate::services::orders::OrderService;
use crate::services::payments::PaymentService;
use crate::utils::response::{data, data_with_meta};
use crate::AppState;

const MAX_PAYMENT_EXPIRES_MINUTES: i64 = 1440;

/// GET /orders/draft
pub async fn get_or_create_draft(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<Value>> {
    let (order, created) =
        OrderService::get_or_create_draft(&state.db.pool, auth_user.user_id).await?;
    Ok(data_with_meta(order, json!({ "created": created })))
}

/// POST /orders/draft/items
pub async fn add_item_to_draft(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<AddOrderItemRequest>,
) -> Result<Json<Value>> {
    let order = OrderService::add_item_to_draft(
        &state.db.pool,
        auth_user.user_id,
        req.variant_id,
        req.quantity,
    )
    .await?;
    Ok(data(order))
}

/// DELETE /orders/draft/items/:item_id
pub async fn remove_item_from_draft(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
    Path(item_id): Path<i64>,
) -> Result<Json<Value>> {
    let order =
        OrderService::remove_item_from_draft(&state.db.pool, auth_user.user_id, item_id).await?;
    Ok(data(order))
}

/// PATCH /orders/:order_id/status
pub async fn update_order_status(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
    Path(order_id): Path<i64>,
    Json(req): Json<UpdateOrderStatusRequest>,
) -> Result<Json<Value>> {
    let order = OrderService::change_status(
        &state.db.pool,
        auth_user.user_id,
        order_id,
        req,
        auth_user.is_admin,
    )
    .await?;
    Ok(data(order))
}

/// GET /orders/:order_id
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
    Path(order_id): Path<i64>,
) -> Result<Json<Value>> {
    let order =
        OrderService::get_order_for_user(&state.db.pool, auth_user.user_id, order_id).await?;
    Ok(data(order))
}

/// POST /orders/:order_id/pay
pub async fn pay_order(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
    Path(order_id): Path<i64>,
    Json(req): Json<PayOrderRequest>,
) -> Result<Json<Value>> {
    let payment_ref = req.payment_ref.trim();
    if payment_ref.is_empty() {
        return Err(Error::validation("payment_ref is required"));
    }
    let order = OrderService::pay_order(
        &state.db.pool,
        auth_user.user_id,
        order_id,
        payment_ref,
        req.paid_amount,
    )
    .await?;
    Ok(data(order))
}

/// POST /orders/:order_id/payments
pub async fn create_order_payment(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
    Path(order_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<CreateOrderPaymentRequest>,
) -> Result<impl IntoResponse> {
    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or_else(|| Error::validation("Idempotency-Key header is required"))?;

    if req.expires_in_minutes > MAX_PAYMENT_EXPIRES_MINUTES {
        return Err(Error::validation("expires_in_minutes cannot exceed 1440"));
    }

    let mut tx = state.db.pool.begin().await?;
    let payment = PaymentService::create_payment_for_order(
        &mut tx,
        &state.config,
        state.mp_provider.as_ref(),
        order_id,
        req.method,
        Some(auth_user.user_id),
        idempotency_key,
        req.currency.as_deref(),
        req.expires_in_minutes,
    )
    .await?;
    tx.commit().await?;

    Ok((StatusCode::CREATED, data(PaymentResponse::from(payment))))
}

/// GET /orders/:order_id/payments
pub async fn list_order_payments(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
    Path(order_id): Path<i64>,
) -> Result<Json<Value>> {
    let mut conn = state.db.pool.acquire().await?;
    let payments =
        PaymentService::list_payments_for_order(&mut conn, order_id, auth_user.user_id).await?;
    let payments: Vec<PaymentResponse> = payments.into_iter().map(Into::into).collect();
    Ok(data(payments))
}
