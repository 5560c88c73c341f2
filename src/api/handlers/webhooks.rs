use axum::{extract::State, http::HeaderMap, Json};
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::services::webhooks::WebhookService;
use crate::utils::response::data;
use crate::AppState;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

/// POST /payments/webhook/mercadopago
///
/// Always answers 200 with a classification, except for an invalid
/// signature which is a hard 401.
pub async fn mercadopago_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Json<Value>> {
    let x_signature = header_str(&headers, "x-signature");
    let x_request_id = header_str(&headers, "x-request-id");

    let outcome =
        WebhookService::process_mercadopago_webhook(&state, &payload, x_signature, x_request_id)
            .await?;
    Ok(data(outcome))
}
