use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde_json::Value;
use std::sync::Arc;

use crate::auth::middleware::AuthUser;
use crate::error::Result;
use crate::models::PaymentResponse;
use crate::services::payments::PaymentService;
use crate::utils::response::data;
use crate::AppState;

/// GET /payments/:payment_id
pub async fn get_payment(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
    Path(payment_id): Path<i64>,
) -> Result<Json<Value>> {
    let mut conn = state.db.pool.acquire().await?;
    let payment =
        PaymentService::get_payment_for_user(&mut conn, payment_id, auth_user.user_id).await?;
    Ok(data(PaymentResponse::from(payment)))
}
