//! Access/refresh token pairs. Access tokens carry `sub`, `type`, `is_admin`,
//! `iss`, `iat`, `exp`; refresh tokens additionally carry a `jti` and are
//! stored server-side as a SHA-256 hash (one rotated session per user).

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    #[serde(rename = "type")]
    pub token_type: String,
    pub is_admin: bool,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub sub: String,
    #[serde(rename = "type")]
    pub token_type: String,
    pub jti: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    issuer: String,
    access_expire_minutes: i64,
    refresh_expire_days: i64,
}

impl JwtManager {
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let algorithm = match config.jwt_algorithm.as_str() {
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            other => anyhow::bail!("unsupported JWT_ALGORITHM: {other}"),
        };
        Ok(Self {
            encoding_key: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            algorithm,
            issuer: config.jwt_issuer.clone(),
            access_expire_minutes: config.access_token_expire_minutes,
            refresh_expire_days: config.refresh_token_expire_days,
        })
    }

    pub fn access_expire_minutes(&self) -> i64 {
        self.access_expire_minutes
    }

    pub fn generate_access_token(&self, user_id: i64, is_admin: bool) -> Result<String> {
        let now = Utc::now();
        let claims = AccessClaims {
            sub: user_id.to_string(),
            token_type: "access".to_string(),
            is_admin,
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + Duration::minutes(self.access_expire_minutes)).timestamp(),
        };
        encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("failed to sign access token: {e}")))
    }

    pub fn generate_refresh_token(&self, user_id: i64) -> Result<String> {
        let now = Utc::now();
        let claims = RefreshClaims {
            sub: user_id.to_string(),
            token_type: "refresh".to_string(),
            jti: Uuid::new_v4().to_string(),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + Duration::days(self.refresh_expire_days)).timestamp(),
        };
        encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("failed to sign refresh token: {e}")))
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(self.algorithm);
        validation.set_issuer(&[&self.issuer]);
        validation
    }

    pub fn decode_access_token(&self, token: &str) -> Result<AccessClaims> {
        let data = decode::<AccessClaims>(token, &self.decoding_key, &self.validation())
            .map_err(|_| Error::unauthorized("invalid token"))?;
        if data.claims.token_type != "access" {
            return Err(Error::unauthorized("invalid token type"));
        }
        if data.claims.sub.trim().is_empty() {
            return Err(Error::unauthorized("token payload is missing subject"));
        }
        Ok(data.claims)
    }

    pub fn decode_refresh_token(&self, token: &str) -> Result<RefreshClaims> {
        let data = decode::<RefreshClaims>(token, &self.decoding_key, &self.validation())
            .map_err(|_| Error::unauthorized("invalid token"))?;
        if data.claims.token_type != "refresh" {
            return Err(Error::unauthorized("invalid token type"));
        }
        if data.claims.jti.trim().is_empty() {
            return Err(Error::unauthorized("invalid refresh token id"));
        }
        Ok(data.claims)
    }
}

/// Parse a token subject into a user id.
pub fn parse_subject(sub: &str) -> Result<i64> {
    sub.trim()
        .parse::<i64>()
        .map_err(|_| Error::unauthorized("invalid token subject"))
}

/// Refresh tokens are stored hashed, never verbatim.
pub fn hash_refresh_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.trim().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MercadoPagoEnv;

    fn test_config() -> AppConfig {
        AppConfig {
            port: 8080,
            database_url: "postgres://test".into(),
            jwt_secret: "test_secret".into(),
            jwt_algorithm: "HS256".into(),
            jwt_issuer: "storefront-api".into(),
            access_token_expire_minutes: 15,
            refresh_token_expire_days: 30,
            mercadopago_access_token: "token".into(),
            mercadopago_env: MercadoPagoEnv::Sandbox,
            mercadopago_timeout_seconds: 10,
            mercadopago_success_url: String::new(),
            mercadopago_failure_url: String::new(),
            mercadopago_pending_url: String::new(),
            mercadopago_notification_url: String::new(),
            mercadopago_webhook_secret: "whsec".into(),
            reservation_sweep_interval_secs: 60,
        }
    }

    #[test]
    fn test_access_token_roundtrip() {
        let manager = JwtManager::from_config(&test_config()).unwrap();
        let token = manager.generate_access_token(42, true).unwrap();
        let claims = manager.decode_access_token(&token).unwrap();
        assert_eq!(claims.sub, "42");
        assert!(claims.is_admin);
        assert_eq!(claims.token_type, "access");
        assert_eq!(claims.iss, "storefront-api");
    }

    #[test]
    fn test_refresh_token_roundtrip_carries_jti() {
        let manager = JwtManager::from_config(&test_config()).unwrap();
        let token = manager.generate_refresh_token(7).unwrap();
        let claims = manager.decode_refresh_token(&token).unwrap();
        assert_eq!(claims.sub, "7");
        assert!(!claims.jti.is_empty());
    }

    #[test]
    fn test_token_type_is_enforced() {
        let manager = JwtManager::from_config(&test_config()).unwrap();
        let refresh = manager.generate_refresh_token(7).unwrap();
        assert!(manager.decode_access_token(&refresh).is_err());
        let access = manager.generate_access_token(7, false).unwrap();
        assert!(manager.decode_refresh_token(&access).is_err());
    }

    #[test]
    fn test_issuer_is_enforced() {
        let manager = JwtManager::from_config(&test_config()).unwrap();
        let mut other = test_config();
        other.jwt_issuer = "someone-else".into();
        let other_manager = JwtManager::from_config(&other).unwrap();
        let token = other_manager.generate_access_token(1, false).unwrap();
        assert!(manager.decode_access_token(&token).is_err());
    }

    #[test]
    fn test_hash_refresh_token_is_stable_and_trimmed() {
        assert_eq!(hash_refresh_token("abc"), hash_refresh_token(" abc "));
        assert_ne!(hash_refresh_token("abc"), hash_refresh_token("abd"));
        assert_eq!(hash_refresh_token("abc").len(), 64);
    }

    #[test]
    fn test_parse_subject() {
        assert_eq!(parse_subject("42").unwrap(), 42);
        assert!(parse_subject("").is_err());
        assert!(parse_subject("abc").is_err());
    }
}
