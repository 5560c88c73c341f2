//! Login, refresh and logout over a single rotated refresh session per user.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sqlx::{PgConnection, PgPool};

use crate::auth::constant_time_eq;
use crate::auth::jwt::{hash_refresh_token, parse_subject, JwtManager, RefreshClaims};
use crate::auth::password::PasswordHasher;
use crate::error::{Error, Result};
use crate::models::User;
use crate::services::users::UserService;

#[derive(Debug, Serialize)]
pub struct TokenPairResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub access_expires_in_seconds: i64,
    pub access_expires_in_minutes: i64,
}

fn claim_timestamp(raw: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(raw, 0)
        .single()
        .ok_or_else(|| Error::unauthorized("invalid token timestamp"))
}

pub struct AuthService;

impl AuthService {
    pub async fn authenticate_user(
        conn: &mut PgConnection,
        hasher: &dyn PasswordHasher,
        email: &str,
        password: &str,
    ) -> Result<User> {
        let normalized_email = email.trim().to_lowercase();
        if normalized_email.is_empty() {
            return Err(Error::validation("email is required"));
        }
        if password.is_empty() {
            return Err(Error::validation("password is required"));
        }

        let user = UserService::find_by_email(conn, &normalized_email)
            .await?
            .ok_or_else(|| Error::unauthorized("invalid credentials"))?;

        if !user.is_active {
            return Err(Error::unauthorized("inactive user"));
        }
        if !user.has_account {
            return Err(Error::unauthorized("user does not have an account yet"));
        }
        if !hasher.verify_password(password, &user.password_hash) {
            return Err(Error::unauthorized("invalid credentials"));
        }
        Ok(user)
    }

    async fn upsert_refresh_session(
        conn: &mut PgConnection,
        user_id: i64,
        refresh_token: &str,
        claims: &RefreshClaims,
    ) -> Result<()> {
        let claim_iat = claim_timestamp(claims.iat)?;
        let claim_exp = claim_timestamp(claims.exp)?;

        sqlx::query(
            "INSERT INTO user_refresh_sessions
                 (user_id, token_hash, token_jti, claim_sub, claim_type, claim_iss, claim_iat, claim_exp, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
             ON CONFLICT (user_id) DO UPDATE SET
                 token_hash = EXCLUDED.token_hash,
                 token_jti = EXCLUDED.token_jti,
                 claim_sub = EXCLUDED.claim_sub,
                 claim_type = EXCLUDED.claim_type,
                 claim_iss = EXCLUDED.claim_iss,
                 claim_iat = EXCLUDED.claim_iat,
                 claim_exp = EXCLUDED.claim_exp,
                 expires_at = EXCLUDED.expires_at,
                 updated_at = NOW()",
        )
        .bind(user_id)
        .bind(hash_refresh_token(refresh_token))
        .bind(&claims.jti)
        .bind(&claims.sub)
        .bind(&claims.token_type)
        .bind(&claims.iss)
        .bind(claim_iat)
        .bind(claim_exp)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn issue_token_pair(
        conn: &mut PgConnection,
        jwt: &JwtManager,
        user: &User,
    ) -> Result<TokenPairResponse> {
        let access_token = jwt.generate_access_token(user.id, user.is_admin)?;
        let refresh_token = jwt.generate_refresh_token(user.id)?;
        let refresh_claims = jwt.decode_refresh_token(&refresh_token)?;

        Self::upsert_refresh_session(conn, user.id, &refresh_token, &refresh_claims).await?;

        let minutes = jwt.access_expire_minutes();
        Ok(TokenPairResponse {
            access_token,
            refresh_token,
            token_type: "bearer",
            access_expires_in_seconds: minutes * 60,
            access_expires_in_minutes: minutes,
        })
    }

    pub async fn login(
        pool: &PgPool,
        jwt: &JwtManager,
        hasher: &dyn PasswordHasher,
        email: &str,
        password: &str,
    ) -> Result<TokenPairResponse> {
        let mut tx = pool.begin().await?;
        let user = Self::authenticate_user(&mut tx, hasher, email, password).await?;
        let tokens = Self::issue_token_pair(&mut tx, jwt, &user).await?;
        tx.commit().await?;
        Ok(tokens)
    }

    pub async fn refresh(
        pool: &PgPool,
        jwt: &JwtManager,
        refresh_token: &str,
    ) -> Result<TokenPairResponse> {
        let claims = jwt.decode_refresh_token(refresh_token)?;
        let user_id = parse_subject(&claims.sub)?;

        let mut tx = pool.begin().await?;
        let session: Option<(String, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT token_hash, token_jti, expires_at
             FROM user_refresh_sessions WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (token_hash, token_jti, expires_at) =
            session.ok_or_else(|| Error::unauthorized("refresh session not found"))?;

        if expires_at <= Utc::now() {
            return Err(Error::unauthorized("refresh token expired"));
        }
        let presented_hash = hash_refresh_token(refresh_token);
        if !constant_time_eq(token_hash.as_bytes(), presented_hash.as_bytes()) {
            return Err(Error::unauthorized("invalid refresh token"));
        }
        if token_jti != claims.jti {
            return Err(Error::unauthorized("invalid refresh token"));
        }

        let user = UserService::get_by_id(&mut tx, user_id)
            .await
            .map_err(|_| Error::unauthorized("user not found"))?;
        if !user.is_active {
            return Err(Error::unauthorized("user not found"));
        }

        let tokens = Self::issue_token_pair(&mut tx, jwt, &user).await?;
        tx.commit().await?;
        Ok(tokens)
    }

    pub async fn logout(pool: &PgPool, jwt: &JwtManager, refresh_token: &str) -> Result<()> {
        let claims = jwt.decode_refresh_token(refresh_token)?;
        let user_id = parse_subject(&claims.sub)?;

        sqlx::query("DELETE FROM user_refresh_sessions WHERE user_id = $1")
            .bind(user_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_timestamp() {
        let ts = claim_timestamp(1_700_000_000).unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert!(claim_timestamp(i64::MAX).is_err());
    }
}
