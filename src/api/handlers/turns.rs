use axum::{extract::State, Extension, Json};
use serde_json::Value;
use std::sync::Arc;

use crate::auth::middleware::AuthUser;
use crate::error::Result;
use crate::models::CreateTurnRequest;
use crate::services::turns::TurnService;
use crate::utils::response::data;
use crate::AppState;

/// POST /turns
pub async fn create_turn(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateTurnRequest>,
) -> Result<Json<Value>> {
    let turn = TurnService::create_turn_for_user(&state.db.pool, auth_user.user_id, req).await?;
    Ok(data(turn))
}
