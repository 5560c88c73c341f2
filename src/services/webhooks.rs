//! Mercado Pago webhook reconciliation: signature check, replay suppression
//! through the webhook event log, authoritative payment fetch, and state
//! application. Unprocessable notifications resolve to soft no-ops; only a
//! bad signature is a hard failure.

use serde::Serialize;
use serde_json::Value;
use sqlx::PgConnection;

use crate::error::{is_unique_violation, Error, Result};
use crate::models::{PaymentResponse, WebhookEvent, WebhookEventStatus};
use crate::services::mercadopago::{extract_data_id, is_signature_valid};
use crate::services::payments::{normalize_mp_payment_state, PaymentService};
use crate::AppState;

pub const PROVIDER_MERCADOPAGO: &str = "mercadopago";

const MAX_ERROR_MESSAGE_CHARS: usize = 2000;

#[derive(Debug, Serialize)]
pub struct WebhookOutcome {
    pub processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentResponse>,
}

impl WebhookOutcome {
    fn skipped(reason: &str) -> Self {
        Self {
            processed: false,
            reason: Some(reason.to_string()),
            payment: None,
        }
    }

    fn processed(payment: PaymentResponse) -> Self {
        Self {
            processed: true,
            reason: None,
            payment: Some(payment),
        }
    }
}

fn trimmed_string(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if raw.is_empty() {
        None
    } else {
        Some(raw)
    }
}

fn truncate_error(message: &str) -> String {
    message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}

/// Deduplication key for a notification: the provider event id when one is
/// present, otherwise topic + data id + action.
pub fn build_event_key(payload: &Value, data_id: &str) -> String {
    if let Some(event_id) = payload.get("id").and_then(trimmed_string) {
        return format!("mp:event:{event_id}");
    }
    let topic = payload
        .get("topic")
        .and_then(trimmed_string)
        .or_else(|| payload.get("type").and_then(trimmed_string))
        .unwrap_or_else(|| "payment".to_string());
    let action = payload
        .get("action")
        .and_then(trimmed_string)
        .unwrap_or_else(|| "unknown".to_string());
    format!("mp:{topic}:{data_id}:{action}")
}

fn webhook_topic(payload: &Value) -> Option<String> {
    payload
        .get("type")
        .and_then(trimmed_string)
        .or_else(|| payload.get("topic").and_then(trimmed_string))
}

pub struct WebhookService;

impl WebhookService {
    /// Claim an event key for processing. Inserts inside a savepoint so a
    /// uniqueness conflict cannot poison the caller's transaction. Returns
    /// false when another delivery already holds or finished this key; a
    /// `failed` row is revived for retry.
    pub async fn acquire_webhook_event(
        conn: &mut PgConnection,
        provider: &str,
        event_key: &str,
        payload: Option<&Value>,
    ) -> Result<bool> {
        let provider = provider.trim();
        if provider.is_empty() {
            return Err(Error::validation("provider is required"));
        }
        let event_key = event_key.trim();
        if event_key.is_empty() {
            return Err(Error::validation("event_key is required"));
        }
        let payload_text = payload.map(Value::to_string);

        let mut savepoint = sqlx::Connection::begin(&mut *conn).await?;
        let inserted = sqlx::query(
            "INSERT INTO webhook_events (provider, event_key, status, payload, received_at)
             VALUES ($1, $2, 'processing', $3, NOW())",
        )
        .bind(provider)
        .bind(event_key)
        .bind(&payload_text)
        .execute(&mut *savepoint)
        .await;

        match inserted {
            Ok(_) => {
                savepoint.commit().await?;
                Ok(true)
            }
            Err(err) if is_unique_violation(&err) => {
                savepoint.rollback().await?;

                let existing = sqlx::query_as::<_, WebhookEvent>(
                    "SELECT id, provider, event_key, status, payload, received_at, processed_at,
                            last_error
                     FROM webhook_events
                     WHERE provider = $1 AND event_key = $2 FOR UPDATE",
                )
                .bind(provider)
                .bind(event_key)
                .fetch_optional(&mut *conn)
                .await?;

                match existing.map(|event| event.status) {
                    Some(WebhookEventStatus::Failed) => {
                        sqlx::query(
                            "UPDATE webhook_events
                             SET status = 'processing', received_at = NOW(), processed_at = NULL,
                                 last_error = NULL, payload = COALESCE($3, payload)
                             WHERE provider = $1 AND event_key = $2",
                        )
                        .bind(provider)
                        .bind(event_key)
                        .bind(&payload_text)
                        .execute(&mut *conn)
                        .await?;
                        Ok(true)
                    }
                    Some(_) => Ok(false),
                    None => Ok(false),
                }
            }
            Err(err) => {
                savepoint.rollback().await?;
                Err(err.into())
            }
        }
    }

    pub async fn mark_webhook_event_processed(
        conn: &mut PgConnection,
        provider: &str,
        event_key: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE webhook_events
             SET status = 'processed', processed_at = NOW(), last_error = NULL
             WHERE provider = $1 AND event_key = $2",
        )
        .bind(provider)
        .bind(event_key)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn mark_webhook_event_failed(
        conn: &mut PgConnection,
        provider: &str,
        event_key: &str,
        error_message: &str,
    ) -> Result<()> {
        let message = if error_message.trim().is_empty() {
            "webhook processing failed".to_string()
        } else {
            truncate_error(error_message)
        };
        sqlx::query(
            "UPDATE webhook_events
             SET status = 'failed', processed_at = NOW(), last_error = $3
             WHERE provider = $1 AND event_key = $2",
        )
        .bind(provider)
        .bind(event_key)
        .bind(&message)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Full webhook pipeline. A bad signature is the only hard error (401);
    /// everything else resolves to a classified soft no-op so the provider
    /// stops retrying.
    pub async fn process_mercadopago_webhook(
        state: &AppState,
        payload: &Value,
        x_signature: Option<&str>,
        x_request_id: Option<&str>,
    ) -> Result<WebhookOutcome> {
        if !payload.is_object() {
            tracing::info!(request_id = ?x_request_id, "mp webhook ignored: invalid payload");
            return Ok(WebhookOutcome::skipped("invalid webhook payload"));
        }

        if let Some(topic) = webhook_topic(payload) {
            if topic != "payment" {
                tracing::info!(
                    request_id = ?x_request_id,
                    topic = %topic,
                    "mp webhook ignored: unsupported topic"
                );
                return Ok(WebhookOutcome::skipped("unsupported webhook topic"));
            }
        }

        let Some(data_id) = extract_data_id(payload) else {
            tracing::info!(request_id = ?x_request_id, "mp webhook ignored: missing data.id");
            return Ok(WebhookOutcome::skipped("missing data.id"));
        };

        if !is_signature_valid(
            &state.config.mercadopago_webhook_secret,
            &data_id,
            x_request_id,
            x_signature,
        ) {
            tracing::warn!(request_id = ?x_request_id, data_id = %data_id, "mp webhook signature failed");
            return Err(Error::unauthorized("invalid signature"));
        }

        let event_key = build_event_key(payload, &data_id);
        let mut tx = state.db.pool.begin().await?;

        let acquired = Self::acquire_webhook_event(
            &mut tx,
            PROVIDER_MERCADOPAGO,
            &event_key,
            Some(payload),
        )
        .await?;
        if !acquired {
            tx.commit().await?;
            tracing::info!(data_id = %data_id, event_key = %event_key, "duplicate mp webhook event");
            return Ok(WebhookOutcome::skipped("duplicate webhook event"));
        }

        let mp_payment = match state.mp_provider.get_payment(&data_id).await {
            Ok(payment) => payment,
            Err(err) => {
                tracing::error!(data_id = %data_id, error = %err, "mp payment lookup failed");
                Self::mark_webhook_event_failed(
                    &mut tx,
                    PROVIDER_MERCADOPAGO,
                    &event_key,
                    "payment lookup failed",
                )
                .await?;
                tx.commit().await?;
                return Ok(WebhookOutcome::skipped("payment lookup failed"));
            }
        };

        let normalized = match normalize_mp_payment_state(&mp_payment) {
            Ok(normalized) => normalized,
            Err(err) => {
                tracing::info!(data_id = %data_id, error = %err, "mp webhook ignored: invalid payment payload");
                Self::mark_webhook_event_failed(
                    &mut tx,
                    PROVIDER_MERCADOPAGO,
                    &event_key,
                    &err.to_string(),
                )
                .await?;
                tx.commit().await?;
                return Ok(WebhookOutcome::skipped("invalid mercadopago payment payload"));
            }
        };

        let payment = PaymentService::find_payment_for_mercadopago_event(
            &mut tx,
            &normalized.external_reference,
        )
        .await?;
        let Some(payment) = payment else {
            tracing::info!(
                data_id = %data_id,
                external_reference = %normalized.external_reference,
                "mp webhook unmatched payment"
            );
            Self::mark_webhook_event_failed(
                &mut tx,
                PROVIDER_MERCADOPAGO,
                &event_key,
                "payment not found",
            )
            .await?;
            tx.commit().await?;
            return Ok(WebhookOutcome::skipped("payment not found"));
        };

        // The apply runs in its own savepoint so a failure can be recorded
        // without committing partial state changes.
        let apply_result = {
            let mut savepoint = sqlx::Connection::begin(&mut *tx).await?;
            match PaymentService::apply_mercadopago_normalized_state(
                &mut savepoint,
                payment.id,
                &normalized,
                Some(payload),
            )
            .await
            {
                Ok(updated) => {
                    savepoint.commit().await?;
                    Ok(updated)
                }
                Err(err) => {
                    savepoint.rollback().await?;
                    Err(err)
                }
            }
        };

        match apply_result {
            Ok(updated) => {
                Self::mark_webhook_event_processed(&mut tx, PROVIDER_MERCADOPAGO, &event_key)
                    .await?;
                tx.commit().await?;
                tracing::info!(
                    data_id = %data_id,
                    external_reference = %normalized.external_reference,
                    payment_id = updated.id,
                    order_id = updated.order_id,
                    provider_status = %normalized.provider_status,
                    "mp webhook processed"
                );
                Ok(WebhookOutcome::processed(updated.into()))
            }
            Err(err) => {
                let message = err.to_string();
                tracing::error!(
                    data_id = %data_id,
                    external_reference = %normalized.external_reference,
                    payment_id = payment.id,
                    error = %message,
                    "mp payment update failed"
                );
                Self::mark_webhook_event_failed(
                    &mut tx,
                    PROVIDER_MERCADOPAGO,
                    &event_key,
                    &message,
                )
                .await?;
                tx.commit().await?;
                Ok(WebhookOutcome::skipped(&message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_key_prefers_top_level_id() {
        let payload = json!({"id": 987, "type": "payment", "data": {"id": "55"}});
        assert_eq!(build_event_key(&payload, "55"), "mp:event:987");
    }

    #[test]
    fn test_event_key_falls_back_to_topic_and_action() {
        let payload = json!({"topic": "payment", "action": "payment.updated", "data": {"id": "55"}});
        assert_eq!(
            build_event_key(&payload, "55"),
            "mp:payment:55:payment.updated"
        );

        let bare = json!({"data": {"id": "55"}});
        assert_eq!(build_event_key(&bare, "55"), "mp:payment:55:unknown");
    }

    #[test]
    fn test_webhook_topic_extraction() {
        assert_eq!(
            webhook_topic(&json!({"type": "payment"})).as_deref(),
            Some("payment")
        );
        assert_eq!(
            webhook_topic(&json!({"topic": "merchant_order"})).as_deref(),
            Some("merchant_order")
        );
        assert_eq!(webhook_topic(&json!({})), None);
    }

    #[test]
    fn test_truncate_error() {
        let long = "x".repeat(3000);
        assert_eq!(truncate_error(&long).chars().count(), 2000);
        assert_eq!(truncate_error("short"), "short");
    }
}
