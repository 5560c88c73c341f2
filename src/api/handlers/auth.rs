//! Login, refresh and logout. Refresh and logout authenticate with the
//! refresh token itself, presented as a bearer credential.

use axum::{extract::State, http::header, http::HeaderMap, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::services::auth::AuthService;
use crate::utils::response::data;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

fn bearer_from_headers(headers: &HeaderMap) -> Result<&str> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());
    match auth_header {
        Some(header) if header.starts_with("Bearer ") => Ok(&header[7..]),
        _ => Err(Error::unauthorized("missing bearer token")),
    }
}

/// POST /auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<Value>> {
    let tokens = AuthService::login(
        &state.db.pool,
        &state.jwt,
        state.password_hasher.as_ref(),
        &req.email,
        &req.password,
    )
    .await?;
    Ok(data(tokens))
}

/// POST /auth/refresh
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let refresh_token = bearer_from_headers(&headers)?;
    let tokens = AuthService::refresh(&state.db.pool, &state.jwt, refresh_token).await?;
    Ok(data(tokens))
}

/// POST /auth/logout
pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let refresh_token = bearer_from_headers(&headers)?;
    AuthService::logout(&state.db.pool, &state.jwt, refresh_token).await?;
    Ok(data(json!({ "logged_out": true })))
}
