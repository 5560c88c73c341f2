//! Admin discount CRUD.

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::models::{CreateDiscountRequest, UpdateDiscountRequest};
use crate::services::discounts::DiscountService;
use crate::utils::response::data;
use crate::AppState;

/// GET /discounts (admin)
pub async fn list_discounts(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    let discounts = DiscountService::list_all(&state.db.pool).await?;
    Ok(data(discounts))
}

/// POST /discounts (admin)
pub async fn create_discount(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateDiscountRequest>,
) -> Result<Json<Value>> {
    let discount = DiscountService::create(&state.db.pool, req).await?;
    Ok(data(discount))
}

/// PATCH /discounts/:discount_id (admin)
pub async fn update_discount(
    State(state): State<Arc<AppState>>,
    Path(discount_id): Path<i64>,
    Json(req): Json<UpdateDiscountRequest>,
) -> Result<Json<Value>> {
    let discount = DiscountService::update(&state.db.pool, discount_id, req).await?;
    Ok(data(discount))
}

/// DELETE /discounts/:discount_id (admin)
pub async fn delete_discount(
    State(state): State<Arc<AppState>>,
    Path(discount_id): Path<i64>,
) -> Result<Json<Value>> {
    let discount = DiscountService::delete(&state.db.pool, discount_id).await?;
    Ok(data(discount))
}
