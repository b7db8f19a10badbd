//! Secret hashing and comparison for user-table rows.
//! Rows hold either an Argon2 PHC string or, until migrated, the clear-text secret.

use anyhow::{anyhow, Result};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use password_hash::{PasswordHash, SaltString};
use subtle::ConstantTimeEq;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretCheck {
    Match,
    Mismatch,
}

/// Hash a secret into a PHC string with a fresh random salt.
pub fn hash_secret(secret: &str) -> Result<String> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let argon2 = Argon2::default();
    let phc = argon2.hash_password(secret.as_bytes(), &salt).map_err(|e| anyhow!(e.to_string()))?.to_string();
    Ok(phc)
}

/// Compare a provided secret against a stored value.
pub fn check_secret(provided: &str, stored: &str, allow_plaintext: bool) -> SecretCheck {
    if let Ok(parsed) = PasswordHash::new(stored) {
        return if Argon2::default().verify_password(provided.as_bytes(), &parsed).is_ok() {
            SecretCheck::Match
        } else {
            SecretCheck::Mismatch
        };
    }
    if !allow_plaintext {
        return SecretCheck::Mismatch;
    }
    let eq: bool = provided.as_bytes().ct_eq(stored.as_bytes()).into();
    if eq {
        warn!(target: "auth", "user row holds a clear-text secret; rehash it with `wipecert_login hash-secret`");
        SecretCheck::Match
    } else {
        SecretCheck::Mismatch
    }
}
