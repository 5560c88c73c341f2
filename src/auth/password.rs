//! Password hashing behind a trait seam. Guest users carry the sentinel
//! hash `"!"`, which never parses and therefore never verifies.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher as _, PasswordVerifier};

use crate::error::{Error, Result};

/// Sentinel stored for guest users until an account activation flow sets a
/// real password.
pub const GUEST_PASSWORD_SENTINEL: &str = "!";

pub trait PasswordHasher: Send + Sync {
    fn hash_password(&self, password: &str) -> Result<String>;
    fn verify_password(&self, password: &str, password_hash: &str) -> bool;
}

#[derive(Debug, Default)]
pub struct Argon2PasswordHasher;

impl PasswordHasher for Argon2PasswordHasher {
    fn hash_password(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| Error::Internal(format!("failed to hash password: {e}")))
    }

    fn verify_password(&self, password: &str, password_hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(password_hash) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify_roundtrip() {
        let hasher = Argon2PasswordHasher;
        let hash = hasher.hash_password("hunter2").unwrap();
        assert!(hasher.verify_password("hunter2", &hash));
        assert!(!hasher.verify_password("hunter3", &hash));
    }

    #[test]
    fn test_sentinel_never_verifies() {
        let hasher = Argon2PasswordHasher;
        assert!(!hasher.verify_password("", GUEST_PASSWORD_SENTINEL));
        assert!(!hasher.verify_password("!", GUEST_PASSWORD_SENTINEL));
        assert!(!hasher.verify_password("anything", GUEST_PASSWORD_SENTINEL));
    }

    #[test]
    fn test_hashes_are_salted() {
        let hasher = Argon2PasswordHasher;
        let a = hasher.hash_password("same").unwrap();
        let b = hasher.hash_password("same").unwrap();
        assert_ne!(a, b);
    }
}
