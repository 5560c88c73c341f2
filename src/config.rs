//! Application configuration, loaded once from the environment at startup.

use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MercadoPagoEnv {
    Sandbox,
    Production,
}

impl MercadoPagoEnv {
    pub fn as_str(&self) -> &'static str {
        match self {
            MercadoPagoEnv::Sandbox => "sandbox",
            MercadoPagoEnv::Production => "production",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,

    pub jwt_secret: String,
    pub jwt_algorithm: String,
    pub jwt_issuer: String,
    pub access_token_expire_minutes: i64,
    pub refresh_token_expire_days: i64,

    pub mercadopago_access_token: String,
    pub mercadopago_env: MercadoPagoEnv,
    pub mercadopago_timeout_seconds: u64,
    pub mercadopago_success_url: String,
    pub mercadopago_failure_url: String,
    pub mercadopago_pending_url: String,
    pub mercadopago_notification_url: String,
    pub mercadopago_webhook_secret: String,

    /// Interval of the background reservation sweep.
    pub reservation_sweep_interval_secs: u64,
}

fn required(name: &str) -> anyhow::Result<String> {
    let value = env::var(name).unwrap_or_default().trim().to_string();
    if value.is_empty() {
        anyhow::bail!("{} is required", name);
    }
    Ok(value)
}

fn optional(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

fn parse_positive<T>(name: &str, raw: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let value: T = raw
        .parse()
        .map_err(|_| anyhow::anyhow!("{} must be a number", name))?;
    if value <= T::default() {
        anyhow::bail!("{} must be greater than 0", name);
    }
    Ok(value)
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let database_url = required("DATABASE_URL")?;
        let jwt_secret = required("JWT_SECRET")?;
        let access_token_expire_minutes =
            parse_positive("ACCESS_TOKEN_EXPIRE_MINUTES", &required("ACCESS_TOKEN_EXPIRE_MINUTES")?)?;
        let refresh_token_expire_days =
            parse_positive("REFRESH_TOKEN_EXPIRE_DAYS", &optional("REFRESH_TOKEN_EXPIRE_DAYS", "30"))?;
        let mercadopago_access_token = required("MERCADOPAGO_ACCESS_TOKEN")?;
        let mercadopago_webhook_secret = required("MERCADOPAGO_WEBHOOK_SECRET")?;

        let mercadopago_env = match optional("MERCADOPAGO_ENV", "sandbox").as_str() {
            "sandbox" => MercadoPagoEnv::Sandbox,
            "production" => MercadoPagoEnv::Production,
            other => anyhow::bail!("MERCADOPAGO_ENV must be sandbox or production, got {other}"),
        };

        let mercadopago_timeout_seconds =
            parse_positive("MERCADOPAGO_TIMEOUT_SECONDS", &optional("MERCADOPAGO_TIMEOUT_SECONDS", "10"))?;

        Ok(Self {
            port: optional("PORT", "8080").parse()?,
            database_url,
            jwt_secret,
            jwt_algorithm: optional("JWT_ALGORITHM", "HS256"),
            jwt_issuer: optional("JWT_ISSUER", "storefront-api"),
            access_token_expire_minutes,
            refresh_token_expire_days,
            mercadopago_access_token,
            mercadopago_env,
            mercadopago_timeout_seconds,
            mercadopago_success_url: optional("MERCADOPAGO_SUCCESS_URL", ""),
            mercadopago_failure_url: optional("MERCADOPAGO_FAILURE_URL", ""),
            mercadopago_pending_url: optional("MERCADOPAGO_PENDING_URL", ""),
            mercadopago_notification_url: optional("MERCADOPAGO_NOTIFICATION_URL", ""),
            mercadopago_webhook_secret,
            reservation_sweep_interval_secs:
                parse_positive("RESERVATION_SWEEP_INTERVAL_SECS", &optional("RESERVATION_SWEEP_INTERVAL_SECS", "60"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_positive_rejects_zero_and_garbage() {
        assert!(parse_positive::<i64>("X", "0").is_err());
        assert!(parse_positive::<i64>("X", "-3").is_err());
        assert!(parse_positive::<i64>("X", "abc").is_err());
        assert_eq!(parse_positive::<i64>("X", "15").unwrap(), 15);
    }

    #[test]
    fn test_mercadopago_env_str() {
        assert_eq!(MercadoPagoEnv::Sandbox.as_str(), "sandbox");
        assert_eq!(MercadoPagoEnv::Production.as_str(), "production");
    }
}
