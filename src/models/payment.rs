use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_method", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    BankTransfer,
    Mercadopago,
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentMethod::BankTransfer => write!(f, "bank_transfer"),
            PaymentMethod::Mercadopago => write!(f, "mercadopago"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Cancelled,
    Expired,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentStatus::Pending => write!(f, "pending"),
            PaymentStatus::Paid => write!(f, "paid"),
            PaymentStatus::Cancelled => write!(f, "cancelled"),
            PaymentStatus::Expired => write!(f, "expired"),
        }
    }
}

impl PaymentStatus {
    /// Payment transition table. Terminal statuses are absorbing; `pending`
    /// may re-assert itself (provider retries).
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        match self {
            PaymentStatus::Pending => true,
            PaymentStatus::Paid => next == PaymentStatus::Paid,
            PaymentStatus::Cancelled => next == PaymentStatus::Cancelled,
            PaymentStatus::Expired => next == PaymentStatus::Expired,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: i64,
    pub order_id: i64,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub amount: Decimal,
    pub currency: String,
    pub idempotency_key: String,
    pub external_ref: Option<String>,
    pub provider_status: Option<String>,
    pub provider_payload: Option<String>,
    pub receipt_url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentResponse {
    pub id: i64,
    pub order_id: i64,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub amount: Decimal,
    pub currency: String,
    pub idempotency_key: String,
    pub external_ref: Option<String>,
    pub provider_status: Option<String>,
    /// Opaque provider payload, surfaced as parsed JSON when well-formed.
    pub provider_payload: Option<Value>,
    pub receipt_url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Payment> for PaymentResponse {
    fn from(payment: Payment) -> Self {
        let provider_payload = payment
            .provider_payload
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());
        Self {
            id: payment.id,
            order_id: payment.order_id,
            method: payment.method,
            status: payment.status,
            amount: payment.amount,
            currency: payment.currency,
            idempotency_key: payment.idempotency_key,
            external_ref: payment.external_ref,
            provider_status: payment.provider_status,
            provider_payload,
            receipt_url: payment.receipt_url,
            expires_at: payment.expires_at,
            paid_at: payment.paid_at,
            created_at: payment.created_at,
            updated_at: payment.updated_at,
        }
    }
}

fn default_expires_in_minutes() -> i64 {
    60
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateOrderPaymentRequest {
    pub method: PaymentMethod,
    pub currency: Option<String>,
    #[serde(default = "default_expires_in_minutes")]
    pub expires_in_minutes: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_transition_table() {
        use PaymentStatus::*;
        for next in [Pending, Paid, Cancelled, Expired] {
            assert!(Pending.can_transition_to(next));
        }
        assert!(Paid.can_transition_to(Paid));
        assert!(!Paid.can_transition_to(Pending));
        assert!(!Paid.can_transition_to(Cancelled));
        assert!(Cancelled.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Paid));
        assert!(Expired.can_transition_to(Expired));
        assert!(!Expired.can_transition_to(Pending));
    }
}
