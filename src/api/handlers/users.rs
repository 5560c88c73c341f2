//! User registration and the admin search/resolve surface.

use axum::{
    extract::{Query, State},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use validator::Validate;

use crate::error::{Error, Result};
use crate::models::{
    ContactRequest, CreateUserRequest, CreatedUserResponse, SearchUsersQuery, UserBasicResponse,
};
use crate::services::users::UserService;
use crate::utils::response::data;
use crate::AppState;

/// POST /users
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<Value>> {
    req.validate()
        .map_err(|_| Error::validation("invalid email"))?;
    let user =
        UserService::create_user(&state.db.pool, state.password_hasher.as_ref(), req).await?;
    Ok(data(CreatedUserResponse::from(user)))
}

/// GET /users/search (admin)
pub async fn search_users(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchUsersQuery>,
) -> Result<Json<Value>> {
    let users = UserService::search_users(&state.db.pool, &query).await?;
    let users: Vec<UserBasicResponse> = users.into_iter().map(Into::into).collect();
    Ok(data(users))
}

/// POST /users/resolve (admin)
pub async fn resolve_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ContactRequest>,
) -> Result<Json<Value>> {
    req.validate()
        .map_err(|_| Error::validation("invalid email"))?;
    let (user, created) = UserService::resolve_user(&state.db.pool, &req).await?;
    Ok(data(json!({
        "user": UserBasicResponse::from(user),
        "created": created,
    })))
}
