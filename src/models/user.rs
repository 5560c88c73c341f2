use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub dni: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub has_account: bool,
    pub is_admin: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CreateUserRequest {
    pub first_name: String,
    pub last_name: String,
    #[validate(email)]
    pub email: String,
    pub password: String,
}

/// Contact payload shared by guest checkout, manual orders and user
/// resolution.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ContactRequest {
    #[validate(email)]
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub dni: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchUsersQuery {
    pub email: Option<String>,
    pub dni: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CreatedUserResponse {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub dni: Option<String>,
    pub phone: Option<String>,
    pub has_account: bool,
    pub is_admin: bool,
    pub is_active: bool,
    pub status: &'static str,
}

impl From<User> for CreatedUserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            first_name: user.first_name,
            last_name: user.last_name,
            email: user.email,
            dni: user.dni,
            phone: user.phone,
            has_account: user.has_account,
            is_admin: user.is_admin,
            is_active: user.is_active,
            status: "created",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UserBasicResponse {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub dni: Option<String>,
    pub phone: Option<String>,
    pub has_account: bool,
    pub is_active: bool,
}

impl From<User> for UserBasicResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            first_name: user.first_name,
            last_name: user.last_name,
            email: user.email,
            dni: user.dni,
            phone: user.phone,
            has_account: user.has_account,
            is_active: user.is_active,
        }
    }
}
