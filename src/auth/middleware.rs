use axum::{
    body::Body,
    extract::State,
    http::{header, Request},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::auth::jwt::parse_subject;
use crate::error::Error;
use crate::AppState;

#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: i64,
    pub is_admin: bool,
}

pub fn bearer_token(request: &Request<Body>) -> Result<&str, Error> {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    match auth_header {
        Some(header) if header.starts_with("Bearer ") => Ok(&header[7..]),
        _ => Err(Error::unauthorized("missing bearer token")),
    }
}

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Error> {
    let token = bearer_token(&request)?;
    let claims = state.jwt.decode_access_token(token)?;
    let user_id = parse_subject(&claims.sub)?;

    request.extensions_mut().insert(AuthUser {
        user_id,
        is_admin: claims.is_admin,
    });

    Ok(next.run(request).await)
}

/// Layered after `auth_middleware` on admin-only routes.
pub async fn require_admin(request: Request<Body>, next: Next) -> Result<Response, Error> {
    let auth_user = request
        .extensions()
        .get::<AuthUser>()
        .copied()
        .ok_or_else(|| Error::unauthorized("missing bearer token"))?;

    if !auth_user.is_admin {
        return Err(Error::Forbidden("admin privileges required".to_string()));
    }

    Ok(next.run(request).await)
}
