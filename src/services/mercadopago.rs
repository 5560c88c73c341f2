//! Mercado Pago provider client and webhook signature verification.
//!
//! The provider surface is a trait so payment flows run against a stub in
//! tests; the real client talks to the REST API with a bounded retry policy.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use serde_json::Value;
use sha2::Sha256;
use std::time::Duration;

use crate::config::AppConfig;
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub const MAX_RETRY_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_DELAY_MS: u64 = 200;

const API_BASE_URL: &str = "https://api.mercadopago.com";

#[async_trait]
pub trait MpProvider: Send + Sync {
    /// Create a checkout preference; `idempotency_key` is forwarded as the
    /// provider's `x-idempotency-key`.
    async fn create_preference(&self, payload: &Value, idempotency_key: &str) -> Result<Value>;

    /// Fetch the authoritative payment state by provider payment id.
    async fn get_payment(&self, payment_id: &str) -> Result<Value>;
}

pub struct MercadoPagoClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl MercadoPagoClient {
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.mercadopago_timeout_seconds))
            .build()?;
        Ok(Self {
            http,
            base_url: API_BASE_URL.to_string(),
            access_token: config.mercadopago_access_token.clone(),
        })
    }

    /// Up to `MAX_RETRY_ATTEMPTS` tries with linear backoff. Timeouts,
    /// network errors, 5xx, 408/429 and malformed bodies retry; other
    /// client errors bubble immediately.
    async fn request_with_retry<F>(&self, operation: &str, build: F) -> Result<Value>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_error = Error::ProviderUnavailable(format!("mercadopago {operation} failed"));

        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(Duration::from_millis(
                    RETRY_BASE_DELAY_MS * u64::from(attempt - 1),
                ))
                .await;
            }

            let response = match build().send().await {
                Ok(response) => response,
                Err(err) => {
                    last_error = if err.is_timeout() {
                        Error::ProviderTimeout("mercadopago request timed out".to_string())
                    } else {
                        Error::ProviderUnavailable("mercadopago request failed".to_string())
                    };
                    continue;
                }
            };

            let status = response.status();
            if status.is_server_error() {
                last_error =
                    Error::ProviderUnavailable("mercadopago unavailable".to_string());
                continue;
            }
            if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS {
                last_error =
                    Error::ProviderUnavailable("mercadopago unavailable".to_string());
                continue;
            }
            match status.as_u16() {
                400 | 404 | 422 => {
                    return Err(Error::ProviderValidation(format!(
                        "mercadopago {operation} rejected"
                    )));
                }
                401 | 403 => {
                    return Err(Error::ProviderAuth(
                        "mercadopago credentials rejected".to_string(),
                    ));
                }
                s if s >= 400 => {
                    return Err(Error::ProviderUnavailable(format!(
                        "mercadopago {operation} failed"
                    )));
                }
                _ => {}
            }

            match response.json::<Value>().await {
                Ok(body) if body.is_object() => return Ok(body),
                _ => {
                    last_error = Error::ProviderUnavailable(
                        "mercadopago invalid response payload".to_string(),
                    );
                }
            }
        }

        Err(last_error)
    }
}

#[async_trait]
impl MpProvider for MercadoPagoClient {
    async fn create_preference(&self, payload: &Value, idempotency_key: &str) -> Result<Value> {
        let url = format!("{}/checkout/preferences", self.base_url);
        let data = self
            .request_with_retry("preference creation", || {
                self.http
                    .post(&url)
                    .bearer_auth(&self.access_token)
                    .header("x-idempotency-key", idempotency_key)
                    .json(payload)
            })
            .await?;

        let preference_id = data.get("id").and_then(Value::as_str).unwrap_or("");
        if preference_id.is_empty() {
            return Err(Error::ProviderValidation(
                "mercadopago preference id missing".to_string(),
            ));
        }
        let has_checkout_url = ["init_point", "sandbox_init_point"].iter().any(|key| {
            data.get(*key)
                .and_then(Value::as_str)
                .is_some_and(|url| !url.is_empty())
        });
        if !has_checkout_url {
            return Err(Error::ProviderValidation(
                "mercadopago checkout url missing".to_string(),
            ));
        }
        Ok(data)
    }

    async fn get_payment(&self, payment_id: &str) -> Result<Value> {
        let payment_id = payment_id.trim();
        if payment_id.is_empty() {
            return Err(Error::ProviderValidation(
                "mercadopago payment id is required".to_string(),
            ));
        }
        let url = format!("{}/v1/payments/{}", self.base_url, payment_id);
        self.request_with_retry("payment lookup", || {
            self.http.get(&url).bearer_auth(&self.access_token)
        })
        .await
    }
}

/// `data.id` from a webhook notification body, as a trimmed string.
pub fn extract_data_id(payload: &Value) -> Option<String> {
    let raw = payload.get("data")?.get("id")?;
    let id = match raw {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

/// Parse the `x-signature` header (`ts=...,v1=...`) into its parts.
pub fn parse_signature_header(header: &str) -> (Option<String>, Option<String>) {
    let mut ts = None;
    let mut v1 = None;
    for item in header.split(',') {
        let Some((key, value)) = item.split_once('=') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.as_str() {
            "ts" => ts = Some(value.to_string()),
            "v1" => v1 = Some(value.to_string()),
            _ => {}
        }
    }
    (ts, v1)
}

/// Verify the webhook HMAC: manifest
/// `id:{data.id};request-id:{x-request-id};ts:{ts};` signed with the
/// configured webhook secret, compared constant-time against `v1`.
pub fn is_signature_valid(
    secret: &str,
    data_id: &str,
    request_id: Option<&str>,
    signature_header: Option<&str>,
) -> bool {
    let request_id = request_id.map(str::trim).unwrap_or("");
    let Some(header) = signature_header else {
        return false;
    };
    let (ts, v1) = parse_signature_header(header);
    let (Some(ts), Some(v1)) = (ts, v1) else {
        return false;
    };
    if request_id.is_empty() {
        return false;
    }

    let Ok(signature) = hex::decode(v1.to_lowercase()) else {
        return false;
    };

    let manifest = format!("id:{data_id};request-id:{request_id};ts:{ts};");
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(manifest.as_bytes());
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sign(secret: &str, manifest: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(manifest.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_extract_data_id() {
        assert_eq!(
            extract_data_id(&json!({"data": {"id": "123"}})),
            Some("123".to_string())
        );
        assert_eq!(
            extract_data_id(&json!({"data": {"id": 456}})),
            Some("456".to_string())
        );
        assert_eq!(extract_data_id(&json!({"data": {"id": "  "}})), None);
        assert_eq!(extract_data_id(&json!({"data": {}})), None);
        assert_eq!(extract_data_id(&json!({})), None);
    }

    #[test]
    fn test_parse_signature_header() {
        let (ts, v1) = parse_signature_header("ts=1704908010,v1=abcdef");
        assert_eq!(ts.as_deref(), Some("1704908010"));
        assert_eq!(v1.as_deref(), Some("abcdef"));

        let (ts, v1) = parse_signature_header(" TS=1 , V1=2 ");
        assert_eq!(ts.as_deref(), Some("1"));
        assert_eq!(v1.as_deref(), Some("2"));

        let (ts, v1) = parse_signature_header("garbage");
        assert!(ts.is_none() && v1.is_none());
    }

    #[test]
    fn test_signature_roundtrip() {
        let secret = "whsec";
        let manifest = "id:42;request-id:req-1;ts:1704908010;";
        let v1 = sign(secret, manifest);
        let header = format!("ts=1704908010,v1={v1}");

        assert!(is_signature_valid(secret, "42", Some("req-1"), Some(&header)));
        // Uppercase hex also accepted.
        let header_upper = format!("ts=1704908010,v1={}", v1.to_uppercase());
        assert!(is_signature_valid(secret, "42", Some("req-1"), Some(&header_upper)));
    }

    #[test]
    fn test_signature_rejects_mismatches() {
        let secret = "whsec";
        let manifest = "id:42;request-id:req-1;ts:1704908010;";
        let v1 = sign(secret, manifest);
        let header = format!("ts=1704908010,v1={v1}");

        assert!(!is_signature_valid("other", "42", Some("req-1"), Some(&header)));
        assert!(!is_signature_valid(secret, "43", Some("req-1"), Some(&header)));
        assert!(!is_signature_valid(secret, "42", Some("req-2"), Some(&header)));
        assert!(!is_signature_valid(secret, "42", None, Some(&header)));
        assert!(!is_signature_valid(secret, "42", Some(""), Some(&header)));
        assert!(!is_signature_valid(secret, "42", Some("req-1"), None));
        assert!(!is_signature_valid(
            secret,
            "42",
            Some("req-1"),
            Some("ts=1704908010,v1=nothex")
        ));
    }
}
