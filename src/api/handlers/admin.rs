use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::Result;
use crate::services::reservations::ReservationService;
use crate::utils::response::data;
use crate::AppState;

/// POST /admin/stock-reservations/expire (admin)
///
/// On-demand reservation sweep; the background task runs the same routine.
pub async fn expire_stock_reservations(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    let expired_count = ReservationService::sweep_expired(&state.db.pool).await?;
    Ok(data(json!({ "expired_count": expired_count })))
}
