//! Guest checkout (anti-abuse gated) and admin manual order entry. Both
//! resolve the customer by contact data and produce a submitted order with
//! reserved stock.

use axum::{extract::State, http::HeaderMap, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use validator::Validate;

use crate::error::{Error, Result};
use crate::models::{ContactRequest, ManualOrderItemRequest};
use crate::services::orders::OrderService;
use crate::utils::response::data_with_meta;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuestCheckoutRequest {
    pub customer: ContactRequest,
    pub items: Vec<ManualOrderItemRequest>,
    /// Honeypot field; humans leave it empty.
    pub website: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManualOrderRequest {
    pub customer: ContactRequest,
    pub items: Vec<ManualOrderItemRequest>,
}

/// Best-effort client address for rate limiting, from proxy headers.
fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("X-Forwarded-For")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .or_else(|| {
            headers
                .get("X-Real-IP")
                .and_then(|h| h.to_str().ok())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// POST /checkout/guest
pub async fn guest_checkout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<GuestCheckoutRequest>,
) -> Result<Json<Value>> {
    req.customer
        .validate()
        .map_err(|_| Error::validation("invalid email"))?;

    let ip = client_ip(&headers);
    state.checkout_limiter.check(
        &ip,
        &req.customer.email,
        req.website.as_deref(),
        Utc::now(),
    )?;

    let result =
        OrderService::submit_checkout_order(&state.db.pool, &req.customer, &req.items).await?;
    let meta = json!({ "user_created": result.user_created });
    Ok(data_with_meta(result, meta))
}

/// POST /orders/manual/submitted (admin)
pub async fn create_manual_order(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ManualOrderRequest>,
) -> Result<Json<Value>> {
    req.customer
        .validate()
        .map_err(|_| Error::validation("invalid email"))?;

    let result =
        OrderService::submit_checkout_order(&state.db.pool, &req.customer, &req.items).await?;
    let meta = json!({ "user_created": result.user_created });
    Ok(data_with_meta(result, meta))
}
