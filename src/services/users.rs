//! User registration, idempotent guest resolution by contact data, and the
//! admin search used by manual order entry.

use sqlx::{PgConnection, PgPool};

use crate::auth::password::{PasswordHasher, GUEST_PASSWORD_SENTINEL};
use crate::error::{is_unique_violation, Error, Result};
use crate::models::{ContactRequest, CreateUserRequest, SearchUsersQuery, User};

const CONTACT_MISMATCH: &str = "contact data does not match existing user for this email";

const USER_COLUMNS: &str = "id, first_name, last_name, email, phone, dni, password_hash, \
     has_account, is_admin, is_active, created_at";

fn normalize_email(email: &str) -> Result<String> {
    let normalized = email.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(Error::validation("email is required"));
    }
    Ok(normalized)
}

fn normalize_required(value: &str, field: &str) -> Result<String> {
    let normalized = value.trim().to_string();
    if normalized.is_empty() {
        return Err(Error::validation(format!("{field} is required")));
    }
    Ok(normalized)
}

fn normalize_optional(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub struct UserService;

impl UserService {
    pub async fn find_by_email(conn: &mut PgConnection, email: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(user)
    }

    pub async fn get_by_id(conn: &mut PgConnection, user_id: i64) -> Result<User> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| Error::not_found("user not found"))
    }

    pub async fn create_user(
        pool: &PgPool,
        hasher: &dyn PasswordHasher,
        req: CreateUserRequest,
    ) -> Result<User> {
        let email = normalize_email(&req.email)?;
        let first_name = normalize_required(&req.first_name, "first_name")?;
        let last_name = normalize_required(&req.last_name, "last_name")?;
        if req.password.is_empty() {
            return Err(Error::validation("password is required"));
        }

        let mut tx = pool.begin().await?;
        if Self::find_by_email(&mut tx, &email).await?.is_some() {
            return Err(Error::conflict("email already exists"));
        }

        let password_hash = hasher.hash_password(&req.password)?;
        let user = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (first_name, last_name, email, phone, password_hash, has_account, is_admin, is_active)
             VALUES ($1, $2, $3, NULL, $4, TRUE, FALSE, TRUE)
             RETURNING {USER_COLUMNS}"
        ))
        .bind(&first_name)
        .bind(&last_name)
        .bind(&email)
        .bind(&password_hash)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::conflict("email already exists")
            } else {
                e.into()
            }
        })?;

        tx.commit().await?;
        Ok(user)
    }

    /// Idempotent get-or-create for guest/manual orders. Existing non-null
    /// contact fields must match (names case-insensitive); null fields are
    /// backfilled from the request.
    pub async fn get_or_create_by_contact(
        conn: &mut PgConnection,
        contact: &ContactRequest,
    ) -> Result<(User, bool)> {
        let email = normalize_email(&contact.email)?;
        let first_name = normalize_required(&contact.first_name, "first_name")?;
        let last_name = normalize_required(&contact.last_name, "last_name")?;
        let phone = normalize_required(&contact.phone, "phone")?;
        let dni = normalize_optional(contact.dni.as_deref());

        if let Some(existing) = Self::find_by_email(conn, &email).await? {
            let existing_first = existing.first_name.trim().to_lowercase();
            let existing_last = existing.last_name.trim().to_lowercase();
            let existing_phone = normalize_optional(existing.phone.as_deref());
            let existing_dni = normalize_optional(existing.dni.as_deref());

            if !existing_first.is_empty() && existing_first != first_name.to_lowercase() {
                return Err(Error::conflict(CONTACT_MISMATCH));
            }
            if !existing_last.is_empty() && existing_last != last_name.to_lowercase() {
                return Err(Error::conflict(CONTACT_MISMATCH));
            }
            if let Some(existing_phone) = &existing_phone {
                if *existing_phone != phone {
                    return Err(Error::conflict(CONTACT_MISMATCH));
                }
            }
            if let (Some(existing_dni), Some(dni)) = (&existing_dni, &dni) {
                if existing_dni != dni {
                    return Err(Error::conflict(CONTACT_MISMATCH));
                }
            }

            let backfill_phone = existing_phone.is_none();
            let backfill_dni = existing_dni.is_none() && dni.is_some();
            if backfill_phone || backfill_dni {
                let user = sqlx::query_as::<_, User>(&format!(
                    "UPDATE users
                     SET phone = COALESCE(phone, $1), dni = COALESCE(dni, $2)
                     WHERE id = $3
                     RETURNING {USER_COLUMNS}"
                ))
                .bind(&phone)
                .bind(&dni)
                .bind(existing.id)
                .fetch_one(&mut *conn)
                .await?;
                return Ok((user, false));
            }
            return Ok((existing, false));
        }

        let user = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (first_name, last_name, email, phone, dni, password_hash, has_account, is_admin, is_active)
             VALUES ($1, $2, $3, $4, $5, $6, FALSE, FALSE, TRUE)
             RETURNING {USER_COLUMNS}"
        ))
        .bind(&first_name)
        .bind(&last_name)
        .bind(&email)
        .bind(&phone)
        .bind(&dni)
        .bind(GUEST_PASSWORD_SENTINEL)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::conflict(CONTACT_MISMATCH)
            } else {
                e.into()
            }
        })?;

        Ok((user, true))
    }

    pub async fn resolve_user(pool: &PgPool, contact: &ContactRequest) -> Result<(User, bool)> {
        let mut tx = pool.begin().await?;
        let resolved = Self::get_or_create_by_contact(&mut tx, contact).await?;
        tx.commit().await?;
        Ok(resolved)
    }

    pub async fn search_users(pool: &PgPool, query: &SearchUsersQuery) -> Result<Vec<User>> {
        let email = normalize_optional(query.email.as_deref()).map(|e| e.to_lowercase());
        let dni = normalize_optional(query.dni.as_deref());
        let first_name = normalize_optional(query.first_name.as_deref());
        let last_name = normalize_optional(query.last_name.as_deref());
        let phone = normalize_optional(query.phone.as_deref());

        if email.is_none()
            && dni.is_none()
            && first_name.is_none()
            && last_name.is_none()
            && phone.is_none()
        {
            return Err(Error::validation("at least one search filter is required"));
        }

        let limit = query.limit.unwrap_or(20).clamp(1, 100);
        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users
             WHERE ($1::text IS NULL OR email = $1)
               AND ($2::text IS NULL OR dni = $2)
               AND ($3::text IS NULL OR first_name ILIKE '%' || $3 || '%')
               AND ($4::text IS NULL OR last_name ILIKE '%' || $4 || '%')
               AND ($5::text IS NULL OR phone LIKE '%' || $5 || '%')
             ORDER BY created_at DESC, id DESC
             LIMIT $6"
        ))
        .bind(&email)
        .bind(&dni)
        .bind(&first_name)
        .bind(&last_name)
        .bind(&phone)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Foo@Example.COM ").unwrap(), "foo@example.com");
        assert!(normalize_email("   ").is_err());
    }

    #[test]
    fn test_normalize_required() {
        assert_eq!(normalize_required(" Ana ", "first_name").unwrap(), "Ana");
        assert!(normalize_required("  ", "first_name").is_err());
    }

    #[test]
    fn test_normalize_optional() {
        assert_eq!(normalize_optional(Some(" x ")), Some("x".to_string()));
        assert_eq!(normalize_optional(Some("  ")), None);
        assert_eq!(normalize_optional(None), None);
    }
}
